//! Directory transport (Layer 2)
//!
//! Carries the five remote directory operations between silos, both inside a
//! cluster (forwarding to the partition owner) and across clusters (through a
//! gateway). The protocol is chosen by the `DirectoryClient` implementation:
//! in-process for tests, JSON over HTTP otherwise.

pub mod http_client;
pub mod http_server;
pub mod in_process;
pub mod messages;

use crate::directory::types::{ActivationAddress, ClusterId, GrainId, HostId};
use crate::errors::{DirectoryError, TransportError};
use crate::gsi::response::RemoteClusterActivationResponse;
use async_trait::async_trait;

pub use http_client::HttpDirectoryClient;
pub use http_server::HttpDirectoryServer;
pub use in_process::{InProcessDirectoryClient, InProcessNetwork};

/// Server side of the directory protocol
///
/// Implemented by the directory endpoint of each silo. Transports deliver
/// decoded requests here.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Answer an ownership inquiry from `requesting_cluster` for one grain.
    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting_cluster: ClusterId,
        hop_count: u32,
    ) -> RemoteClusterActivationResponse;

    /// Answer ownership inquiries for many grains; replies align with `grains`.
    async fn process_activation_request_batch(
        &self,
        grains: Vec<GrainId>,
        requesting_cluster: ClusterId,
        hop_count: u32,
    ) -> Vec<RemoteClusterActivationResponse>;

    /// Evict pointers to activations that were deactivated in another cluster.
    async fn process_deactivations(
        &self,
        addresses: Vec<ActivationAddress>,
        hop_count: u32,
    ) -> Result<(), DirectoryError>;

    /// Evict every entry of a grain deleted in another cluster.
    async fn process_deletion(&self, grain: GrainId, hop_count: u32) -> Result<(), DirectoryError>;

    /// Remove an activation a caller found missing.
    async fn unregister_after_nonexisting_activation(
        &self,
        address: ActivationAddress,
        hop_count: u32,
    ) -> Result<(), DirectoryError>;
}

/// Client side of the directory protocol
///
/// Every call names the silo it targets: a remote gateway or the local
/// partition owner.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn process_activation_request(
        &self,
        target: &HostId,
        grain: &GrainId,
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<RemoteClusterActivationResponse, TransportError>;

    async fn process_activation_request_batch(
        &self,
        target: &HostId,
        grains: &[GrainId],
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<Vec<RemoteClusterActivationResponse>, TransportError>;

    async fn process_deactivations(
        &self,
        target: &HostId,
        addresses: &[ActivationAddress],
        hop_count: u32,
    ) -> Result<(), TransportError>;

    async fn process_deletion(
        &self,
        target: &HostId,
        grain: &GrainId,
        hop_count: u32,
    ) -> Result<(), TransportError>;

    async fn unregister_after_nonexisting_activation(
        &self,
        target: &HostId,
        address: &ActivationAddress,
        hop_count: u32,
    ) -> Result<(), TransportError>;
}
