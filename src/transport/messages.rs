//! HTTP message bodies
//!
//! Requests and replies of the directory protocol as JSON.

use crate::directory::types::{ActivationAddress, ClusterId, GrainId};
use crate::gsi::response::RemoteClusterActivationResponse;
use serde::{Deserialize, Serialize};

pub const ACTIVATION_PATH: &str = "/directory/activation";
pub const ACTIVATION_BATCH_PATH: &str = "/directory/activation/batch";
pub const DEACTIVATIONS_PATH: &str = "/directory/deactivations";
pub const DELETION_PATH: &str = "/directory/deletion";
pub const NONEXISTING_ACTIVATION_PATH: &str = "/directory/unregister-nonexisting";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub grain: GrainId,
    pub requesting_cluster: ClusterId,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationBatchRequest {
    pub grains: Vec<GrainId>,
    pub requesting_cluster: ClusterId,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationBatchResponse {
    pub responses: Vec<RemoteClusterActivationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivationsRequest {
    pub addresses: Vec<ActivationAddress>,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub grain: GrainId,
    #[serde(default)]
    pub hop_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonexistingActivationRequest {
    pub address: ActivationAddress,
    #[serde(default)]
    pub hop_count: u32,
}

/// Reply to a notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl NoticeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub cluster_id: ClusterId,
    pub silo: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_count_defaults_to_zero() {
        let json = r#"{"grain":{"type_name":"Player","key":"1"},"requesting_cluster":"B"}"#;
        let request: ActivationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.hop_count, 0);
        assert_eq!(request.requesting_cluster, ClusterId::new("B"));
    }

    #[test]
    fn test_response_json_shape() {
        let json = serde_json::to_value(RemoteClusterActivationResponse::pass()).unwrap();
        assert_eq!(json["status"], "Pass");
        assert_eq!(json["owned"], false);
        assert!(json["existing_activation"].is_null());
    }
}
