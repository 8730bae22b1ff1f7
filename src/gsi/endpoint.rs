//! Directory RPC Endpoint (Layer 5)
//!
//! Answers the directory requests of other clusters, and of other silos of
//! this cluster forwarding on their behalf. Requests for a grain whose
//! partition lives on another silo are forwarded there; every operation is
//! idempotent, so a duplicated or re-forwarded request is harmless.

use crate::config::DirectoryConfig;
use crate::directory::partition::DirectoryPartition;
use crate::directory::ring::ConsistentHashRing;
use crate::directory::types::{
    ActivationAddress, ClusterId, DirectoryEntryStatus, GrainId, HostId, UnregistrationCause,
};
use crate::errors::{DirectoryError, TransportError};
use crate::federation::MultiClusterOracle;
use crate::gsi::precedence::precedes;
use crate::gsi::registrar::{GlobalSingleInstanceRegistrar, Registrar};
use crate::gsi::response::RemoteClusterActivationResponse;
use crate::transport::{DirectoryClient, DirectoryService};
use async_trait::async_trait;
use slog::{debug, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Delay before re-checking partition ownership of a forwarded request.
    pub forward_retry_delay: Duration,
    pub max_forward_hops: u32,
    /// Timeout of each forwarded call.
    pub request_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            forward_retry_delay: Duration::from_millis(200),
            max_forward_hops: 2,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&DirectoryConfig> for EndpointOptions {
    fn from(config: &DirectoryConfig) -> Self {
        Self {
            forward_retry_delay: config.forward_retry_delay,
            max_forward_hops: config.max_forward_hops,
            request_timeout: config.request_timeout,
        }
    }
}

/// Per-silo endpoint of the cluster grain directory
pub struct ClusterGrainDirectory {
    cluster_id: ClusterId,
    silo: HostId,
    ring: Arc<ConsistentHashRing>,
    partition: Arc<dyn DirectoryPartition>,
    oracle: Arc<dyn MultiClusterOracle>,
    /// Used to forward to other silos of this cluster
    client: Arc<dyn DirectoryClient>,
    registrar: Arc<GlobalSingleInstanceRegistrar>,
    options: EndpointOptions,
    logger: Logger,
}

impl ClusterGrainDirectory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster_id: ClusterId,
        ring: Arc<ConsistentHashRing>,
        partition: Arc<dyn DirectoryPartition>,
        oracle: Arc<dyn MultiClusterOracle>,
        client: Arc<dyn DirectoryClient>,
        registrar: Arc<GlobalSingleInstanceRegistrar>,
        options: EndpointOptions,
        logger: Logger,
    ) -> Self {
        let silo = ring.local_host().clone();
        let logger = logger.new(o!("component" => "GSIP", "endpoint" => silo.to_string()));
        Self {
            cluster_id,
            silo,
            ring,
            partition,
            oracle,
            client,
            registrar,
            options,
            logger,
        }
    }

    /// Silo to forward `grain` to, or `None` when this silo owns it.
    fn forward_target(&self, grain: &GrainId) -> Option<HostId> {
        let owner = self.ring.owner_of(grain);
        (owner != self.silo).then_some(owner)
    }

    /// Forward target after the re-check delay for already forwarded requests.
    async fn settled_forward_target(&self, grain: &GrainId, hop_count: u32) -> Option<HostId> {
        self.forward_target(grain)?;
        if hop_count > 0 {
            tokio::time::sleep(self.options.forward_retry_delay).await;
        }
        self.forward_target(grain)
    }

    fn check_hops(&self, grain: &GrainId, hop_count: u32) -> Result<(), DirectoryError> {
        if hop_count >= self.options.max_forward_hops {
            warn!(self.logger, "Forwarding limit reached"; "grain" => %grain, "hops" => hop_count);
            return Err(DirectoryError::ForwardingLimit {
                grain: grain.clone(),
                hops: hop_count,
            });
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        target: &HostId,
        call: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.options.request_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout {
                    host: target.clone(),
                })
            })
    }

    /// Answer an inquiry from the partition owner's local state.
    fn evaluate(&self, grain: &GrainId, requesting_cluster: &ClusterId) -> RemoteClusterActivationResponse {
        if !self.oracle.is_member(requesting_cluster) {
            debug!(self.logger, "Rejecting request from non-member";
                "grain" => %grain,
                "from" => %requesting_cluster
            );
            return RemoteClusterActivationResponse::rejected(format!(
                "cluster {} is not in the multi-cluster configuration",
                requesting_cluster
            ));
        }

        loop {
            let Some(entry) = self.partition.try_get_activation(grain) else {
                return RemoteClusterActivationResponse::pass();
            };

            match entry.status {
                DirectoryEntryStatus::Owned => {
                    return RemoteClusterActivationResponse::failed_owner(
                        entry.address,
                        self.cluster_id.clone(),
                    );
                }
                DirectoryEntryStatus::RequestedOwnership | DirectoryEntryStatus::Doubtful => {
                    if precedes(grain, &self.cluster_id, requesting_cluster) {
                        return RemoteClusterActivationResponse::failed_candidate(
                            entry.address,
                            self.cluster_id.clone(),
                        );
                    }
                    if entry.status == DirectoryEntryStatus::Doubtful {
                        return RemoteClusterActivationResponse::pass();
                    }
                    if self.partition.update_status(
                        grain,
                        &entry.address.activation,
                        DirectoryEntryStatus::RequestedOwnership,
                        DirectoryEntryStatus::RaceLoser,
                    ) {
                        debug!(self.logger, "Local claim lost the race";
                            "grain" => %grain,
                            "winner" => %requesting_cluster
                        );
                        return RemoteClusterActivationResponse::pass();
                    }
                    // Status moved under us, decide again.
                }
                _ => return RemoteClusterActivationResponse::pass(),
            }
        }
    }

    /// Group indices of `items` by the silo owning their grain; `None` is this silo.
    fn group_by_owner<T>(&self, items: &[T], grain_of: impl Fn(&T) -> &GrainId) -> HashMap<Option<HostId>, Vec<usize>> {
        let mut groups: HashMap<Option<HostId>, Vec<usize>> = HashMap::new();
        for (index, item) in items.iter().enumerate() {
            groups
                .entry(self.forward_target(grain_of(item)))
                .or_default()
                .push(index);
        }
        groups
    }

    /// Re-group after the forwarding delay when any element must leave this silo.
    async fn settled_groups<T>(
        &self,
        items: &[T],
        hop_count: u32,
        grain_of: impl Fn(&T) -> &GrainId,
    ) -> HashMap<Option<HostId>, Vec<usize>> {
        let groups = self.group_by_owner(items, &grain_of);
        if hop_count > 0 && groups.keys().any(Option::is_some) {
            tokio::time::sleep(self.options.forward_retry_delay).await;
            return self.group_by_owner(items, &grain_of);
        }
        groups
    }
}

#[async_trait]
impl DirectoryService for ClusterGrainDirectory {
    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting_cluster: ClusterId,
        hop_count: u32,
    ) -> RemoteClusterActivationResponse {
        let Some(owner) = self.settled_forward_target(&grain, hop_count).await else {
            return self.evaluate(&grain, &requesting_cluster);
        };

        if let Err(e) = self.check_hops(&grain, hop_count) {
            return RemoteClusterActivationResponse::faulted(e.to_string());
        }
        debug!(self.logger, "Forwarding activation request";
            "grain" => %grain,
            "owner" => %owner,
            "hop" => hop_count + 1
        );
        let call = self
            .client
            .process_activation_request(&owner, &grain, &requesting_cluster, hop_count + 1);
        match self.with_timeout(&owner, call).await {
            Ok(response) => response,
            Err(e) => {
                warn!(self.logger, "Forwarded activation request failed";
                    "grain" => %grain,
                    "owner" => %owner,
                    "error" => %e
                );
                RemoteClusterActivationResponse::faulted(e.to_string())
            }
        }
    }

    async fn process_activation_request_batch(
        &self,
        grains: Vec<GrainId>,
        requesting_cluster: ClusterId,
        hop_count: u32,
    ) -> Vec<RemoteClusterActivationResponse> {
        let mut responses: Vec<Option<RemoteClusterActivationResponse>> = vec![None; grains.len()];
        let groups = self.settled_groups(&grains, hop_count, |g| g).await;

        let mut forwards = Vec::new();
        for (owner, indices) in groups {
            match owner {
                None => {
                    for index in indices {
                        responses[index] = Some(self.evaluate(&grains[index], &requesting_cluster));
                    }
                }
                Some(owner) => forwards.push((owner, indices)),
            }
        }

        let forwarded = futures::future::join_all(forwards.into_iter().map(|(owner, indices)| {
            let subset: Vec<GrainId> = indices.iter().map(|&i| grains[i].clone()).collect();
            let requesting_cluster = &requesting_cluster;
            async move {
                let result = match self.check_hops(&subset[0], hop_count) {
                    Err(e) => Err(e.to_string()),
                    Ok(()) => {
                        let call = self.client.process_activation_request_batch(
                            &owner,
                            &subset,
                            requesting_cluster,
                            hop_count + 1,
                        );
                        match self.with_timeout(&owner, call).await {
                            Ok(replies) if replies.len() == subset.len() => Ok(replies),
                            Ok(_) => Err("malformed batch reply".to_string()),
                            Err(e) => Err(e.to_string()),
                        }
                    }
                };
                (indices, result)
            }
        }))
        .await;

        for (indices, result) in forwarded {
            match result {
                Ok(replies) => {
                    for (index, reply) in indices.into_iter().zip(replies) {
                        responses[index] = Some(reply);
                    }
                }
                Err(reason) => {
                    warn!(self.logger, "Forwarded batch failed"; "grains" => indices.len(), "error" => &reason);
                    for index in indices {
                        responses[index] = Some(RemoteClusterActivationResponse::faulted(reason.clone()));
                    }
                }
            }
        }

        responses
            .into_iter()
            .map(|r| r.unwrap_or_else(|| RemoteClusterActivationResponse::faulted("no reply")))
            .collect()
    }

    async fn process_deactivations(
        &self,
        addresses: Vec<ActivationAddress>,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        let groups = self.settled_groups(&addresses, hop_count, |a| &a.grain).await;

        let mut first_error = None;
        for (owner, indices) in groups {
            let subset: Vec<ActivationAddress> = indices.iter().map(|&i| addresses[i].clone()).collect();
            match owner {
                None => {
                    self.registrar
                        .unregister_local(&subset, UnregistrationCause::Force);
                }
                Some(owner) => {
                    let result = match self.check_hops(&subset[0].grain, hop_count) {
                        Err(e) => Err(e),
                        Ok(()) => {
                            let call = self.client.process_deactivations(&owner, &subset, hop_count + 1);
                            self.with_timeout(&owner, call).await.map_err(DirectoryError::from)
                        }
                    };
                    if let Err(e) = result {
                        warn!(self.logger, "Forwarding deactivations failed"; "owner" => %owner, "error" => %e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn process_deletion(&self, grain: GrainId, hop_count: u32) -> Result<(), DirectoryError> {
        match self.settled_forward_target(&grain, hop_count).await {
            None => {
                self.registrar.delete_local(&grain);
                Ok(())
            }
            Some(owner) => {
                self.check_hops(&grain, hop_count)?;
                let call = self.client.process_deletion(&owner, &grain, hop_count + 1);
                Ok(self.with_timeout(&owner, call).await?)
            }
        }
    }

    async fn unregister_after_nonexisting_activation(
        &self,
        address: ActivationAddress,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        match self.settled_forward_target(&address.grain, hop_count).await {
            None => {
                self.registrar
                    .unregister(vec![address], UnregistrationCause::NonexistentActivation)
                    .await
            }
            Some(owner) => {
                self.check_hops(&address.grain, hop_count)?;
                let call = self
                    .client
                    .unregister_after_nonexisting_activation(&owner, &address, hop_count + 1);
                Ok(self.with_timeout(&owner, call).await?)
            }
        }
    }
}
