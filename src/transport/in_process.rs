//! In-process network for testing
//!
//! Routes directory calls between silos living in the same process without
//! any I/O, so multi-cluster scenarios run as ordinary async tests. Supports
//! fault injection (disconnecting a host), an artificial per-call latency,
//! and counts every call it carries.

use crate::directory::types::{ActivationAddress, ClusterId, GrainId, HostId};
use crate::errors::{DirectoryError, TransportError};
use crate::gsi::response::RemoteClusterActivationResponse;
use crate::transport::{DirectoryClient, DirectoryService};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<HostId, Weak<dyn DirectoryService>>,
    disconnected: HashSet<HostId>,
    latency: Duration,
}

/// Registry of every silo reachable in this process
pub struct InProcessNetwork {
    state: RwLock<NetworkState>,
    request_count: AtomicU64,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NetworkState::default()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Register a silo's directory service under `host`.
    ///
    /// Only a weak reference is kept; the silo stays owned by its runtime.
    pub fn register_host(&self, host: HostId, service: &Arc<dyn DirectoryService>) {
        self.write().hosts.insert(host, Arc::downgrade(service));
    }

    /// Make every call to `host` fail as unreachable.
    pub fn disconnect(&self, host: &HostId) {
        self.write().disconnected.insert(host.clone());
    }

    pub fn reconnect(&self, host: &HostId) {
        self.write().disconnected.remove(host);
    }

    /// Delay applied to every call before it is delivered.
    pub fn set_latency(&self, latency: Duration) {
        self.write().latency = latency;
    }

    /// Number of calls carried so far, including failed ones.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn host_count(&self) -> usize {
        self.read().hosts.len()
    }

    /// Count the call, apply latency and resolve the target.
    async fn route(&self, target: &HostId) -> Result<Arc<dyn DirectoryService>, TransportError> {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let latency = self.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.read();
        if state.disconnected.contains(target) {
            return Err(TransportError::Unreachable {
                host: target.clone(),
                reason: "host disconnected".to_string(),
            });
        }
        state
            .hosts
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::HostNotFound {
                host: target.clone(),
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, NetworkState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// DirectoryClient implementation over an InProcessNetwork
pub struct InProcessDirectoryClient {
    network: Arc<InProcessNetwork>,
}

impl InProcessDirectoryClient {
    pub fn new(network: Arc<InProcessNetwork>) -> Self {
        Self { network }
    }
}

fn remote_error(target: &HostId, error: DirectoryError) -> TransportError {
    TransportError::Remote {
        host: target.clone(),
        reason: error.to_string(),
    }
}

#[async_trait]
impl DirectoryClient for InProcessDirectoryClient {
    async fn process_activation_request(
        &self,
        target: &HostId,
        grain: &GrainId,
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<RemoteClusterActivationResponse, TransportError> {
        let service = self.network.route(target).await?;
        Ok(service
            .process_activation_request(grain.clone(), requesting_cluster.clone(), hop_count)
            .await)
    }

    async fn process_activation_request_batch(
        &self,
        target: &HostId,
        grains: &[GrainId],
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<Vec<RemoteClusterActivationResponse>, TransportError> {
        let service = self.network.route(target).await?;
        Ok(service
            .process_activation_request_batch(grains.to_vec(), requesting_cluster.clone(), hop_count)
            .await)
    }

    async fn process_deactivations(
        &self,
        target: &HostId,
        addresses: &[ActivationAddress],
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let service = self.network.route(target).await?;
        service
            .process_deactivations(addresses.to_vec(), hop_count)
            .await
            .map_err(|e| remote_error(target, e))
    }

    async fn process_deletion(
        &self,
        target: &HostId,
        grain: &GrainId,
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let service = self.network.route(target).await?;
        service
            .process_deletion(grain.clone(), hop_count)
            .await
            .map_err(|e| remote_error(target, e))
    }

    async fn unregister_after_nonexisting_activation(
        &self,
        target: &HostId,
        address: &ActivationAddress,
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let service = self.network.route(target).await?;
        service
            .unregister_after_nonexisting_activation(address.clone(), hop_count)
            .await
            .map_err(|e| remote_error(target, e))
    }
}
