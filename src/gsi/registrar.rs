//! Registrars (Layer 4)
//!
//! A registrar decides what registering, unregistering and deleting an
//! activation means for a grain type. `ClusterLocalRegistrar` only touches the
//! local partition. `GlobalSingleInstanceRegistrar` runs the ownership
//! protocol against every other cluster of the federation:
//!
//! ```text
//! RequestedOwnership -> Owned | Doubtful | RaceLoser | Cached
//! RaceLoser          -> RequestedOwnership
//! Doubtful           -> RequestedOwnership   (background retry)
//! ```
//!
//! Every local transition is a compare-and-set on the expected previous
//! status; a failed transition rereads the entry and decides again.

use crate::config::DirectoryConfig;
use crate::directory::partition::{DirectoryPartition, RemovedActivation};
use crate::directory::types::{
    ActivationAddress, ClusterId, DirectoryEntryStatus, GrainId, HostId, UnregistrationCause,
};
use crate::errors::{DirectoryError, TransportError};
use crate::federation::MultiClusterOracle;
use crate::gsi::outcome::{ActivationOutcome, ResponseTracker};
use crate::gsi::response::RemoteClusterActivationResponse;
use crate::transport::DirectoryClient;
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How activations of a grain type are registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStrategy {
    /// Registered in this cluster only.
    ClusterLocal,
    /// At most one activation across the federation.
    GlobalSingleInstance,
}

impl fmt::Display for RegistrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationStrategy::ClusterLocal => write!(f, "ClusterLocal"),
            RegistrationStrategy::GlobalSingleInstance => write!(f, "GlobalSingleInstance"),
        }
    }
}

/// Registration behavior for one strategy.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register `address`, returning the address callers should use.
    ///
    /// The returned address may differ from `address` when another
    /// activation (local or remote) already holds the grain.
    async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
    ) -> Result<ActivationAddress, DirectoryError>;

    async fn unregister(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError>;

    async fn delete(&self, grain: GrainId) -> Result<(), DirectoryError>;

    /// Drop a cached pointer to `address`.
    fn invalidate_cache(&self, address: &ActivationAddress);
}

/// Registrar for grains that are never coordinated across clusters.
pub struct ClusterLocalRegistrar {
    partition: Arc<dyn DirectoryPartition>,
}

impl ClusterLocalRegistrar {
    pub fn new(partition: Arc<dyn DirectoryPartition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl Registrar for ClusterLocalRegistrar {
    async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
    ) -> Result<ActivationAddress, DirectoryError> {
        if single_activation {
            let entry = self
                .partition
                .add_single_activation(&address, DirectoryEntryStatus::ClusterLocal);
            Ok(entry.address)
        } else {
            self.partition
                .add_activation(&address, DirectoryEntryStatus::ClusterLocal);
            Ok(address)
        }
    }

    async fn unregister(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        for address in &addresses {
            self.partition
                .remove_activation(&address.grain, &address.activation, cause);
        }
        Ok(())
    }

    async fn delete(&self, grain: GrainId) -> Result<(), DirectoryError> {
        self.partition.remove_grain(&grain);
        Ok(())
    }

    fn invalidate_cache(&self, address: &ActivationAddress) {
        self.partition.remove_activation(
            &address.grain,
            &address.activation,
            UnregistrationCause::CacheInvalidation,
        );
    }
}

/// Settings of the global single instance protocol.
#[derive(Debug, Clone)]
pub struct GsiOptions {
    pub has_multi_cluster_network: bool,
    /// Request rounds per registration before falling back to doubtful.
    pub retries: u32,
    /// Timeout of each remote inquiry.
    pub request_timeout: Duration,
}

impl Default for GsiOptions {
    fn default() -> Self {
        Self {
            has_multi_cluster_network: true,
            retries: 3,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DirectoryConfig> for GsiOptions {
    fn from(config: &DirectoryConfig) -> Self {
        Self {
            has_multi_cluster_network: config.multi_cluster.has_multi_cluster_network,
            retries: config.multi_cluster.global_single_instance_number_retries,
            request_timeout: config.request_timeout,
        }
    }
}

/// Registrar running the global single instance ownership protocol.
pub struct GlobalSingleInstanceRegistrar {
    cluster_id: ClusterId,
    partition: Arc<dyn DirectoryPartition>,
    oracle: Arc<dyn MultiClusterOracle>,
    client: Arc<dyn DirectoryClient>,
    options: GsiOptions,
    logger: Logger,
}

impl GlobalSingleInstanceRegistrar {
    pub fn new(
        cluster_id: ClusterId,
        partition: Arc<dyn DirectoryPartition>,
        oracle: Arc<dyn MultiClusterOracle>,
        client: Arc<dyn DirectoryClient>,
        options: GsiOptions,
        logger: Logger,
    ) -> Self {
        let logger = logger.new(o!("component" => "GSIP"));
        Self {
            cluster_id,
            partition,
            oracle,
            client,
            options,
            logger,
        }
    }

    /// Whether this cluster belongs to the current federation configuration.
    pub fn is_member(&self) -> bool {
        self.oracle.is_member(&self.cluster_id)
    }

    /// Members of the current configuration other than this cluster.
    pub fn remote_clusters(&self) -> Vec<ClusterId> {
        self.oracle
            .configuration()
            .map(|config| config.remote_clusters(&self.cluster_id).cloned().collect())
            .unwrap_or_default()
    }

    /// Run request rounds for a freshly claimed entry until it is resolved.
    async fn resolve_ownership(
        &self,
        address: &ActivationAddress,
        remotes: &[ClusterId],
    ) -> ActivationAddress {
        let grain = &address.grain;

        for round in 0..self.options.retries {
            let outcome = self.run_round(grain, remotes).await;
            debug!(self.logger, "Ownership round finished";
                "grain" => %grain,
                "round" => round,
                "outcome" => %outcome
            );

            if let Some((remote, cluster)) = outcome.remote_owner() {
                if matches!(outcome, ActivationOutcome::RemoteOwnerLikely { .. }) {
                    info!(self.logger, "Yielding to likely remote owner";
                        "grain" => %grain,
                        "cluster" => %cluster
                    );
                }
                self.partition
                    .cache_remote_pointer(grain, &address.activation, remote);
                return remote.clone();
            }

            if outcome == ActivationOutcome::Succeed
                && self.partition.update_status(
                    grain,
                    &address.activation,
                    DirectoryEntryStatus::RequestedOwnership,
                    DirectoryEntryStatus::Owned,
                )
            {
                debug!(self.logger, "Ownership acquired"; "grain" => %grain);
                return address.clone();
            }

            let Some(entry) = self.partition.try_get_activation(grain) else {
                warn!(self.logger, "Entry removed during registration"; "grain" => %grain);
                return address.clone();
            };
            if entry.address.activation != address.activation {
                return entry.address;
            }
            match entry.status {
                DirectoryEntryStatus::RequestedOwnership => continue,
                DirectoryEntryStatus::RaceLoser => {
                    if !self.partition.update_status(
                        grain,
                        &address.activation,
                        DirectoryEntryStatus::RaceLoser,
                        DirectoryEntryStatus::RequestedOwnership,
                    ) {
                        debug!(self.logger, "Lost transition out of race loser"; "grain" => %grain);
                    }
                }
                DirectoryEntryStatus::Owned => return address.clone(),
                DirectoryEntryStatus::Cached => return entry.address,
                status => {
                    error!(self.logger, "Protocol error: unexpected status during registration";
                        "grain" => %grain,
                        "status" => %status
                    );
                    return address.clone();
                }
            }
        }

        self.give_up(address);
        address.clone()
    }

    /// Park an unresolved registration as doubtful for the background agent.
    fn give_up(&self, address: &ActivationAddress) {
        let grain = &address.grain;
        for expected in [
            DirectoryEntryStatus::RequestedOwnership,
            DirectoryEntryStatus::RaceLoser,
        ] {
            if self.partition.update_status(
                grain,
                &address.activation,
                expected,
                DirectoryEntryStatus::Doubtful,
            ) {
                info!(self.logger, "Registration unresolved, marked doubtful"; "grain" => %grain);
                return;
            }
        }
        debug!(self.logger, "Entry left its claim state before giving up"; "grain" => %grain);
    }

    /// Send one inquiry per remote cluster and aggregate the replies.
    ///
    /// Returns as soon as a decision is reachable; unfinished inquiries are dropped.
    pub async fn run_round(&self, grain: &GrainId, remotes: &[ClusterId]) -> ActivationOutcome {
        let mut tracker = ResponseTracker::new(grain.clone(), remotes.len());
        if let Some(outcome) = tracker.outcome() {
            return outcome.clone();
        }

        let mut pending: FuturesUnordered<_> = remotes
            .iter()
            .enumerate()
            .map(|(index, cluster)| async move { (index, self.request_one(cluster, grain).await) })
            .collect();

        while let Some((index, response)) = pending.next().await {
            if let Some(outcome) = tracker.record(index, response) {
                return outcome.clone();
            }
        }
        tracker.finish()
    }

    async fn request_one(&self, cluster: &ClusterId, grain: &GrainId) -> RemoteClusterActivationResponse {
        let Some(gateway) = self.oracle.random_cluster_gateway(cluster) else {
            warn!(self.logger, "No gateway for cluster"; "cluster" => %cluster);
            return RemoteClusterActivationResponse::faulted(
                DirectoryError::NoGateway {
                    cluster: cluster.clone(),
                }
                .to_string(),
            );
        };

        let request = self
            .client
            .process_activation_request(&gateway, grain, &self.cluster_id, 0);
        match tokio::time::timeout(self.options.request_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(self.logger, "Activation request faulted";
                    "cluster" => %cluster,
                    "grain" => %grain,
                    "error" => %e
                );
                RemoteClusterActivationResponse::faulted(e.to_string())
            }
            Err(_) => {
                warn!(self.logger, "Activation request timed out";
                    "cluster" => %cluster,
                    "grain" => %grain
                );
                RemoteClusterActivationResponse::faulted(TransportError::Timeout { host: gateway }.to_string())
            }
        }
    }

    /// Ask every remote cluster about many grains at once.
    ///
    /// One batch message per remote cluster; a failed batch counts as faulted
    /// for every grain in it. Outcomes align with `grains`.
    pub async fn run_batch_round(
        &self,
        grains: &[GrainId],
        remotes: &[ClusterId],
    ) -> Vec<ActivationOutcome> {
        let batches =
            join_all(remotes.iter().map(|cluster| self.request_batch(cluster, grains)))
                .await;

        grains
            .iter()
            .enumerate()
            .map(|(index, grain)| {
                let responses: Vec<Option<RemoteClusterActivationResponse>> = batches
                    .iter()
                    .map(|batch| batch.get(index).cloned())
                    .collect();
                ResponseTracker::get_outcome(grain, &responses).unwrap_or(ActivationOutcome::Inconclusive)
            })
            .collect()
    }

    async fn request_batch(
        &self,
        cluster: &ClusterId,
        grains: &[GrainId],
    ) -> Vec<RemoteClusterActivationResponse> {
        let faulted = |reason: String| -> Vec<RemoteClusterActivationResponse> {
            grains
                .iter()
                .map(|_| RemoteClusterActivationResponse::faulted(reason.clone()))
                .collect()
        };

        let Some(gateway) = self.oracle.random_cluster_gateway(cluster) else {
            return faulted(DirectoryError::NoGateway { cluster: cluster.clone() }.to_string());
        };

        let request = self
            .client
            .process_activation_request_batch(&gateway, grains, &self.cluster_id, 0);
        match tokio::time::timeout(self.options.request_timeout, request).await {
            Ok(Ok(responses)) if responses.len() == grains.len() => responses,
            Ok(Ok(responses)) => {
                warn!(self.logger, "Batch reply has wrong length";
                    "cluster" => %cluster,
                    "expected" => grains.len(),
                    "got" => responses.len()
                );
                faulted("malformed batch reply".to_string())
            }
            Ok(Err(e)) => {
                warn!(self.logger, "Batch activation request faulted";
                    "cluster" => %cluster,
                    "grains" => grains.len(),
                    "error" => %e
                );
                faulted(e.to_string())
            }
            Err(_) => faulted(TransportError::Timeout { host: gateway }.to_string()),
        }
    }

    /// Remove activations locally, returning the ones other clusters may point at.
    pub fn unregister_local(
        &self,
        addresses: &[ActivationAddress],
        cause: UnregistrationCause,
    ) -> Vec<ActivationAddress> {
        addresses
            .iter()
            .filter_map(|address| {
                let (removed, was_removed) =
                    self.partition
                        .remove_activation(&address.grain, &address.activation, cause);
                if !was_removed {
                    debug!(self.logger, "Nothing to unregister";
                        "grain" => %address.grain,
                        "cause" => ?cause
                    );
                }
                removed
            })
            .filter(|removed| removed.status.is_visible_to_remote_clusters())
            .map(|removed| removed.address)
            .collect()
    }

    /// Drop every local entry of `grain`, returning whether any was visible remotely.
    pub fn delete_local(&self, grain: &GrainId) -> bool {
        self.partition
            .remove_grain(grain)
            .iter()
            .any(|removed: &RemovedActivation| removed.status.is_visible_to_remote_clusters())
    }

    /// Gateways of `clusters`, skipping unreachable ones.
    fn gateways(&self, clusters: impl IntoIterator<Item = ClusterId>) -> Vec<(ClusterId, HostId)> {
        clusters
            .into_iter()
            .filter(|cluster| cluster != &self.cluster_id)
            .filter_map(|cluster| {
                let gateway = self.oracle.random_cluster_gateway(&cluster);
                if gateway.is_none() {
                    warn!(self.logger, "Skipping notice to cluster without gateway"; "cluster" => %cluster);
                }
                gateway.map(|gateway| (cluster, gateway))
            })
            .collect()
    }

    fn broadcast_deactivations(&self, addresses: Vec<ActivationAddress>) {
        let targets = self.gateways(self.remote_clusters());
        if targets.is_empty() {
            return;
        }
        let client = self.client.clone();
        let logger = self.logger.clone();
        let timeout = self.options.request_timeout;
        tokio::spawn(async move {
            let notices = targets.into_iter().map(|(cluster, gateway)| {
                let (client, addresses, logger) = (&client, &addresses, &logger);
                async move {
                    let send = client.process_deactivations(&gateway, addresses, 0);
                    match tokio::time::timeout(timeout, send).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(logger, "Deactivation notice failed"; "cluster" => %cluster, "error" => %e),
                        Err(_) => warn!(logger, "Deactivation notice timed out"; "cluster" => %cluster),
                    }
                }
            });
            join_all(notices).await;
        });
    }

    fn broadcast_deletion(&self, grain: GrainId) {
        let targets = self.gateways(self.oracle.known_clusters());
        if targets.is_empty() {
            return;
        }
        let client = self.client.clone();
        let logger = self.logger.clone();
        let timeout = self.options.request_timeout;
        tokio::spawn(async move {
            let notices = targets.into_iter().map(|(cluster, gateway)| {
                let (client, grain, logger) = (&client, &grain, &logger);
                async move {
                    let send = client.process_deletion(&gateway, grain, 0);
                    match tokio::time::timeout(timeout, send).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(logger, "Deletion notice failed"; "cluster" => %cluster, "error" => %e),
                        Err(_) => warn!(logger, "Deletion notice timed out"; "cluster" => %cluster),
                    }
                }
            });
            join_all(notices).await;
        });
    }
}

#[async_trait]
impl Registrar for GlobalSingleInstanceRegistrar {
    async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
    ) -> Result<ActivationAddress, DirectoryError> {
        if !single_activation {
            return Err(DirectoryError::MultipleActivationsUnsupported {
                grain: address.grain,
            });
        }

        if !self.options.has_multi_cluster_network {
            let entry = self
                .partition
                .add_single_activation(&address, DirectoryEntryStatus::Owned);
            return Ok(entry.address);
        }

        let configuration = self.oracle.configuration();
        let Some(configuration) = configuration.filter(|c| c.contains(&self.cluster_id)) else {
            let entry = self
                .partition
                .add_single_activation(&address, DirectoryEntryStatus::Doubtful);
            debug!(self.logger, "Not a federation member, registered as doubtful";
                "grain" => %address.grain
            );
            return Ok(entry.address);
        };

        let entry = self
            .partition
            .add_single_activation(&address, DirectoryEntryStatus::RequestedOwnership);
        if entry.address != address || entry.status != DirectoryEntryStatus::RequestedOwnership {
            return Ok(entry.address);
        }

        let remotes: Vec<ClusterId> = configuration
            .remote_clusters(&self.cluster_id)
            .cloned()
            .collect();
        Ok(self.resolve_ownership(&address, &remotes).await)
    }

    async fn unregister(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let visible = self.unregister_local(&addresses, cause);
        if !visible.is_empty() && self.options.has_multi_cluster_network {
            self.broadcast_deactivations(visible);
        }
        Ok(())
    }

    async fn delete(&self, grain: GrainId) -> Result<(), DirectoryError> {
        if self.delete_local(&grain) && self.options.has_multi_cluster_network {
            self.broadcast_deletion(grain);
        }
        Ok(())
    }

    fn invalidate_cache(&self, address: &ActivationAddress) {
        self.partition.remove_activation(
            &address.grain,
            &address.activation,
            UnregistrationCause::CacheInvalidation,
        );
    }
}
