//! Multi-cluster configuration and the oracle that serves it

use crate::directory::types::{ClusterId, HostId};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Set of clusters joined into the federation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiClusterConfiguration {
    pub clusters: BTreeSet<ClusterId>,
    #[serde(default)]
    pub comment: String,
}

impl MultiClusterConfiguration {
    pub fn new(clusters: impl IntoIterator<Item = ClusterId>) -> Self {
        Self {
            clusters: clusters.into_iter().collect(),
            comment: String::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn contains(&self, cluster: &ClusterId) -> bool {
        self.clusters.contains(cluster)
    }

    /// Members other than `local`.
    pub fn remote_clusters<'a>(
        &'a self,
        local: &'a ClusterId,
    ) -> impl Iterator<Item = &'a ClusterId> + 'a {
        self.clusters.iter().filter(move |c| *c != local)
    }
}

impl fmt::Display for MultiClusterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.clusters.iter().map(ClusterId::as_str).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Eventually-consistent view of the federation.
pub trait MultiClusterOracle: Send + Sync {
    /// Current configuration, `None` until one has been received.
    fn configuration(&self) -> Option<MultiClusterConfiguration>;

    /// Whether `cluster` is in the current configuration.
    fn is_member(&self, cluster: &ClusterId) -> bool {
        self.configuration()
            .map(|config| config.contains(cluster))
            .unwrap_or(false)
    }

    /// Any live gateway into `cluster`, or `None` if it is unreachable.
    fn random_cluster_gateway(&self, cluster: &ClusterId) -> Option<HostId>;

    /// Every cluster that has ever appeared in a configuration.
    fn known_clusters(&self) -> Vec<ClusterId>;

    /// Receiver that observes every configuration change.
    fn subscribe(&self) -> watch::Receiver<Option<MultiClusterConfiguration>>;
}

struct OracleState {
    known: BTreeSet<ClusterId>,
    gateways: HashMap<ClusterId, Vec<HostId>>,
}

/// Oracle fed by static gateways and injected configurations.
pub struct InMemoryMultiClusterOracle {
    state: RwLock<OracleState>,
    config_tx: watch::Sender<Option<MultiClusterConfiguration>>,
}

impl InMemoryMultiClusterOracle {
    pub fn new(initial: Option<MultiClusterConfiguration>) -> Self {
        let known = initial
            .as_ref()
            .map(|c| c.clusters.clone())
            .unwrap_or_default();
        let (config_tx, _) = watch::channel(initial);
        Self {
            state: RwLock::new(OracleState {
                known,
                gateways: HashMap::new(),
            }),
            config_tx,
        }
    }

    /// Publish a new configuration to every subscriber.
    pub fn inject_configuration(&self, config: MultiClusterConfiguration) {
        self.write().known.extend(config.clusters.iter().cloned());
        self.config_tx.send_replace(Some(config));
    }

    /// Replace the gateways of one cluster.
    pub fn set_gateways(&self, cluster: ClusterId, gateways: Vec<HostId>) {
        let mut state = self.write();
        state.known.insert(cluster.clone());
        state.gateways.insert(cluster, gateways);
    }

    /// Mark a cluster as unreachable.
    pub fn clear_gateways(&self, cluster: &ClusterId) {
        self.write().gateways.remove(cluster);
    }

    fn read(&self) -> RwLockReadGuard<'_, OracleState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, OracleState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MultiClusterOracle for InMemoryMultiClusterOracle {
    fn configuration(&self) -> Option<MultiClusterConfiguration> {
        self.config_tx.borrow().clone()
    }

    fn random_cluster_gateway(&self, cluster: &ClusterId) -> Option<HostId> {
        let state = self.read();
        state
            .gateways
            .get(cluster)
            .and_then(|gateways| gateways.choose(&mut rand::thread_rng()))
            .cloned()
    }

    fn known_clusters(&self) -> Vec<ClusterId> {
        self.read().known.iter().cloned().collect()
    }

    fn subscribe(&self) -> watch::Receiver<Option<MultiClusterConfiguration>> {
        self.config_tx.subscribe()
    }
}
