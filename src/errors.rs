//! Error types for the directory runtime

use crate::directory::types::{ClusterId, GrainId, HostId};
use std::fmt;

/// Errors that can occur while talking to another silo or cluster
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Target host not found in the network registry
    HostNotFound { host: HostId },

    /// Target host refused or dropped the request
    Unreachable { host: HostId, reason: String },

    /// Request did not complete in time
    Timeout { host: HostId },

    /// Failed to encode or decode a message
    Serialization { reason: String },

    /// Remote side processed the request and reported an error
    Remote { host: HostId, reason: String },

    /// Other transport error
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::HostNotFound { host } => {
                write!(f, "Host {} not found in registry", host)
            }
            TransportError::Unreachable { host, reason } => {
                write!(f, "Host {} unreachable: {}", host, reason)
            }
            TransportError::Timeout { host } => {
                write!(f, "Request to host {} timed out", host)
            }
            TransportError::Serialization { reason } => {
                write!(f, "Failed to serialize message: {}", reason)
            }
            TransportError::Remote { host, reason } => {
                write!(f, "Host {} returned an error: {}", host, reason)
            }
            TransportError::Other(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors surfaced to local callers of the directory
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("grain {grain} uses global single instance registration, which supports only one activation")]
    MultipleActivationsUnsupported { grain: GrainId },

    #[error("no registrar configured for strategy {strategy}")]
    NoRegistrarForStrategy { strategy: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("cluster {cluster} has no gateway")]
    NoGateway { cluster: ClusterId },

    #[error("request for {grain} dropped after {hops} forwarding hops")]
    ForwardingLimit { grain: GrainId, hops: u32 },

    #[error("silo {silo} does not own the directory partition of {grain}, {owner} does")]
    NotPartitionOwner {
        grain: GrainId,
        silo: HostId,
        owner: HostId,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("directory is shutting down")]
    Stopping,
}

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
