//! Replies to ownership inquiries

use crate::directory::types::{ActivationAddress, ClusterId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationResponseStatus {
    /// No conflicting claim.
    Pass,
    /// The remote cluster holds an activation; see `owned`.
    Failed,
    /// The inquiry could not be completed.
    Faulted,
}

/// Reply of one remote cluster about one grain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteClusterActivationResponse {
    pub status: ActivationResponseStatus,
    pub existing_activation: Option<ActivationAddress>,
    pub owning_cluster: Option<ClusterId>,
    /// True when the responder definitively owns `existing_activation`.
    pub owned: bool,
    pub error: Option<String>,
}

impl RemoteClusterActivationResponse {
    pub fn pass() -> Self {
        Self {
            status: ActivationResponseStatus::Pass,
            existing_activation: None,
            owning_cluster: None,
            owned: false,
            error: None,
        }
    }

    pub fn faulted(error: impl Into<String>) -> Self {
        Self {
            status: ActivationResponseStatus::Faulted,
            existing_activation: None,
            owning_cluster: None,
            owned: false,
            error: Some(error.into()),
        }
    }

    /// The responder owns `address`.
    pub fn failed_owner(address: ActivationAddress, cluster: ClusterId) -> Self {
        Self {
            status: ActivationResponseStatus::Failed,
            existing_activation: Some(address),
            owning_cluster: Some(cluster),
            owned: true,
            error: None,
        }
    }

    /// The responder is a competing candidate that precedes the requester.
    pub fn failed_candidate(address: ActivationAddress, cluster: ClusterId) -> Self {
        Self {
            status: ActivationResponseStatus::Failed,
            existing_activation: Some(address),
            owning_cluster: Some(cluster),
            owned: false,
            error: None,
        }
    }

    /// The request was refused without reporting an activation.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: ActivationResponseStatus::Failed,
            existing_activation: None,
            owning_cluster: None,
            owned: false,
            error: Some(reason.into()),
        }
    }

    pub fn is_definitive_owner(&self) -> bool {
        self.status == ActivationResponseStatus::Failed && self.owned
    }
}
