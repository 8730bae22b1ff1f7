//! Reconciliation Agent (Layer 6)
//!
//! Background task that keeps single-instance entries moving toward a stable
//! state. Each tick either demotes owned entries (this cluster left the
//! federation) or re-runs the ownership protocol, batched per remote
//! cluster, for every doubtful entry. Ticks run on a fixed period, and
//! immediately when the federation configuration changes or someone prods
//! the agent. At most one tick runs at a time.

use crate::directory::partition::DirectoryPartition;
use crate::directory::types::{ActivationAddress, ClusterId, DirectoryEntryStatus, GrainId, HostId};
use crate::errors::DirectoryError;
use crate::federation::{MultiClusterConfiguration, MultiClusterOracle};
use crate::gsi::outcome::ActivationOutcome;
use crate::gsi::registrar::GlobalSingleInstanceRegistrar;
use async_trait::async_trait;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Largest number of grains sent in one batch request.
const MAX_BATCH_SIZE: usize = 500;

/// Deactivates local activations that lost ownership to another cluster.
#[async_trait]
pub trait ActivationCatalog: Send + Sync {
    async fn delete_activations(
        &self,
        host: &HostId,
        addresses: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError>;
}

/// Activations a host should deactivate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeactivationRequest {
    pub host: HostId,
    pub addresses: Vec<ActivationAddress>,
}

/// Catalog that hands deactivation requests to whoever owns the receiver.
pub struct ChannelActivationCatalog {
    tx: mpsc::UnboundedSender<DeactivationRequest>,
}

impl ChannelActivationCatalog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeactivationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivationCatalog for ChannelActivationCatalog {
    async fn delete_activations(
        &self,
        host: &HostId,
        addresses: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError> {
        self.tx
            .send(DeactivationRequest {
                host: host.clone(),
                addresses,
            })
            .map_err(|_| DirectoryError::Stopping)
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Tick did not run (another tick in progress, or a cluster unreachable).
    pub skipped: bool,
    pub demoted: usize,
    pub owned: usize,
    pub yielded: usize,
    pub still_doubtful: usize,
}

pub struct ActivationMaintainer {
    registrar: Arc<GlobalSingleInstanceRegistrar>,
    partition: Arc<dyn DirectoryPartition>,
    oracle: Arc<dyn MultiClusterOracle>,
    catalog: Arc<dyn ActivationCatalog>,
    period: Duration,
    prod: Notify,
    tick_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl ActivationMaintainer {
    pub fn new(
        registrar: Arc<GlobalSingleInstanceRegistrar>,
        partition: Arc<dyn DirectoryPartition>,
        oracle: Arc<dyn MultiClusterOracle>,
        catalog: Arc<dyn ActivationCatalog>,
        period: Duration,
        logger: Logger,
    ) -> Self {
        let logger = logger.new(o!("component" => "GSIP", "agent" => "maintainer"));
        Self {
            registrar,
            partition,
            oracle,
            catalog,
            period,
            prod: Notify::new(),
            tick_guard: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            logger,
        }
    }

    /// Spawn the background loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }
        let this = self.clone();
        let config_rx = self.oracle.subscribe();
        *task = Some(tokio::spawn(async move { this.run(config_rx).await }));
        info!(self.logger, "Activation maintainer started"; "period_ms" => self.period.as_millis() as u64);
    }

    /// Run a tick as soon as possible.
    pub fn prod(&self) {
        self.prod.notify_one();
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(self.logger, "Activation maintainer task failed"; "error" => %e);
            }
        }
        info!(self.logger, "Activation maintainer stopped");
    }

    async fn run(&self, config_rx: watch::Receiver<Option<MultiClusterConfiguration>>) {
        let mut config_rx = Some(config_rx);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
                _ = self.prod.notified() => {
                    debug!(self.logger, "Prodded");
                }
                changed = async {
                    match config_rx.as_mut() {
                        Some(rx) => rx.changed().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if changed.is_err() {
                        config_rx = None;
                        continue;
                    }
                    info!(self.logger, "Multi-cluster configuration changed, checking entries");
                }
            }

            let report = self.run_check().await;
            if report != MaintenanceReport::default() {
                debug!(self.logger, "Maintenance tick finished";
                    "skipped" => report.skipped,
                    "demoted" => report.demoted,
                    "owned" => report.owned,
                    "yielded" => report.yielded,
                    "still_doubtful" => report.still_doubtful
                );
            }
        }
    }

    /// Run one tick now.
    pub async fn run_check(&self) -> MaintenanceReport {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!(self.logger, "Previous tick still running, skipping");
            return MaintenanceReport {
                skipped: true,
                ..Default::default()
            };
        };

        if !self.registrar.is_member() {
            return self.demote_owned();
        }

        let remotes = self.registrar.remote_clusters();
        if let Some(unreachable) = remotes
            .iter()
            .find(|cluster| self.oracle.random_cluster_gateway(cluster).is_none())
        {
            warn!(self.logger, "Skipping retry pass, cluster has no gateway"; "cluster" => %unreachable);
            return MaintenanceReport {
                skipped: true,
                ..Default::default()
            };
        }

        let doubtful = self
            .partition
            .single_instance_entries_with_status(DirectoryEntryStatus::Doubtful);
        let mut report = MaintenanceReport::default();
        for chunk in doubtful.chunks(MAX_BATCH_SIZE) {
            self.retry_batch(chunk, &remotes, &mut report).await;
        }
        report
    }

    /// This cluster left the federation: owned entries can no longer be asserted.
    fn demote_owned(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for address in self
            .partition
            .single_instance_entries_with_status(DirectoryEntryStatus::Owned)
        {
            if self.partition.update_status(
                &address.grain,
                &address.activation,
                DirectoryEntryStatus::Owned,
                DirectoryEntryStatus::Doubtful,
            ) {
                report.demoted += 1;
            }
        }
        if report.demoted > 0 {
            info!(self.logger, "Not a federation member, demoted owned entries"; "count" => report.demoted);
        }
        report
    }

    async fn retry_batch(
        &self,
        doubtful: &[ActivationAddress],
        remotes: &[ClusterId],
        report: &mut MaintenanceReport,
    ) {
        let claimed: Vec<&ActivationAddress> = doubtful
            .iter()
            .filter(|address| {
                self.partition.update_status(
                    &address.grain,
                    &address.activation,
                    DirectoryEntryStatus::Doubtful,
                    DirectoryEntryStatus::RequestedOwnership,
                )
            })
            .collect();
        if claimed.is_empty() {
            return;
        }

        let grains: Vec<GrainId> = claimed.iter().map(|a| a.grain.clone()).collect();
        let outcomes = self.registrar.run_batch_round(&grains, remotes).await;

        let mut losers: HashMap<HostId, Vec<ActivationAddress>> = HashMap::new();
        for (address, outcome) in claimed.into_iter().zip(outcomes) {
            let grain = &address.grain;

            if let Some((remote, cluster)) = outcome.remote_owner() {
                debug!(self.logger, "Doubtful entry resolved to remote owner";
                    "grain" => %grain,
                    "cluster" => %cluster,
                    "outcome" => %outcome
                );
                self.partition
                    .cache_remote_pointer(grain, &address.activation, remote);
                losers.entry(address.host.clone()).or_default().push(address.clone());
                report.yielded += 1;
                continue;
            }

            if outcome == ActivationOutcome::Succeed
                && self.partition.update_status(
                    grain,
                    &address.activation,
                    DirectoryEntryStatus::RequestedOwnership,
                    DirectoryEntryStatus::Owned,
                )
            {
                report.owned += 1;
                continue;
            }

            let current = self
                .partition
                .try_get_activation(grain)
                .filter(|entry| entry.address.activation == address.activation);
            let Some(entry) = current else {
                debug!(self.logger, "Entry changed during retry"; "grain" => %grain);
                continue;
            };
            match entry.status {
                DirectoryEntryStatus::RequestedOwnership | DirectoryEntryStatus::RaceLoser => {
                    if self.partition.update_status(
                        grain,
                        &address.activation,
                        entry.status,
                        DirectoryEntryStatus::Doubtful,
                    ) {
                        report.still_doubtful += 1;
                    }
                }
                status => {
                    error!(self.logger, "Protocol error: unexpected status after retry";
                        "grain" => %grain,
                        "status" => %status
                    );
                }
            }
        }

        for (host, addresses) in losers {
            let catalog = self.catalog.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                let count = addresses.len();
                if let Err(e) = catalog.delete_activations(&host, addresses).await {
                    warn!(logger, "Failed to deactivate losing activations";
                        "host" => %host,
                        "count" => count,
                        "error" => %e
                    );
                }
            });
        }
    }
}
