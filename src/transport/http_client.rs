//! HTTP client for directory requests

use crate::directory::types::{ActivationAddress, ClusterId, GrainId, HostId};
use crate::errors::TransportError;
use crate::gsi::response::RemoteClusterActivationResponse;
use crate::transport::messages::{
    ActivationBatchRequest, ActivationBatchResponse, ActivationRequest, DeactivationsRequest,
    DeletionRequest, NonexistingActivationRequest, NoticeResponse, ACTIVATION_BATCH_PATH,
    ACTIVATION_PATH, DEACTIVATIONS_PATH, DELETION_PATH, NONEXISTING_ACTIVATION_PATH,
};
use crate::transport::DirectoryClient;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, warn, Logger};
use std::time::Duration;

/// HTTP client for sending directory requests to other silos
pub struct HttpDirectoryClient {
    client: reqwest::Client,
    logger: Logger,
}

impl HttpDirectoryClient {
    pub fn new(timeout: Duration, logger: Logger) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, logger })
    }

    fn url(target: &HostId, path: &str) -> String {
        let host = target.as_str();
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}{}", host.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", host, path)
        }
    }

    async fn post<Req, Resp>(&self, target: &HostId, path: &str, body: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = Self::url(target, path);
        debug!(self.logger, "Sending HTTP POST request"; "url" => &url);

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            warn!(self.logger, "HTTP request failed"; "error" => %e, "url" => &url);
            if e.is_timeout() {
                TransportError::Timeout {
                    host: target.clone(),
                }
            } else {
                TransportError::Unreachable {
                    host: target.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            warn!(self.logger, "HTTP request returned error status";
                "status" => response.status().as_u16(),
                "url" => &url
            );
            return Err(TransportError::Remote {
                host: target.clone(),
                reason: format!("HTTP request returned status {}", response.status()),
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| TransportError::Serialization {
                reason: e.to_string(),
            })
    }

    async fn notice<Req>(&self, target: &HostId, path: &str, body: &Req) -> Result<(), TransportError>
    where
        Req: Serialize + Sync,
    {
        let reply: NoticeResponse = self.post(target, path, body).await?;
        if reply.success {
            Ok(())
        } else {
            Err(TransportError::Remote {
                host: target.clone(),
                reason: reply.error.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn process_activation_request(
        &self,
        target: &HostId,
        grain: &GrainId,
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<RemoteClusterActivationResponse, TransportError> {
        let request = ActivationRequest {
            grain: grain.clone(),
            requesting_cluster: requesting_cluster.clone(),
            hop_count,
        };
        self.post(target, ACTIVATION_PATH, &request).await
    }

    async fn process_activation_request_batch(
        &self,
        target: &HostId,
        grains: &[GrainId],
        requesting_cluster: &ClusterId,
        hop_count: u32,
    ) -> Result<Vec<RemoteClusterActivationResponse>, TransportError> {
        let request = ActivationBatchRequest {
            grains: grains.to_vec(),
            requesting_cluster: requesting_cluster.clone(),
            hop_count,
        };
        let reply: ActivationBatchResponse = self.post(target, ACTIVATION_BATCH_PATH, &request).await?;
        if reply.responses.len() != grains.len() {
            return Err(TransportError::Serialization {
                reason: format!(
                    "batch reply has {} elements, expected {}",
                    reply.responses.len(),
                    grains.len()
                ),
            });
        }
        Ok(reply.responses)
    }

    async fn process_deactivations(
        &self,
        target: &HostId,
        addresses: &[ActivationAddress],
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let request = DeactivationsRequest {
            addresses: addresses.to_vec(),
            hop_count,
        };
        self.notice(target, DEACTIVATIONS_PATH, &request).await
    }

    async fn process_deletion(
        &self,
        target: &HostId,
        grain: &GrainId,
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let request = DeletionRequest {
            grain: grain.clone(),
            hop_count,
        };
        self.notice(target, DELETION_PATH, &request).await
    }

    async fn unregister_after_nonexisting_activation(
        &self,
        target: &HostId,
        address: &ActivationAddress,
        hop_count: u32,
    ) -> Result<(), TransportError> {
        let request = NonexistingActivationRequest {
            address: address.clone(),
            hop_count,
        };
        self.notice(target, NONEXISTING_ACTIVATION_PATH, &request).await
    }
}
