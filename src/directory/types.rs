//! Core identifiers shared by every directory layer

use crate::directory::hash::stable_str_hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a logical actor (grain).
///
/// A grain is named by its type and a key; the type selects the registration
/// strategy, the full identity is what the directory indexes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrainId {
    type_name: String,
    key: String,
}

impl GrainId {
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Uniform hash of the grain identity, identical on every host.
    pub fn uniform_hash(&self) -> u64 {
        stable_str_hash(&self.to_string())
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.key)
    }
}

/// Identity of one physical instantiation of a grain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(Uuid);

impl ActivationId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a hosting process (silo), e.g. "10.0.0.5:11111".
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a cluster in the federation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable hash of the cluster name, used by the precedence function.
    pub fn stable_hash(&self) -> u64 {
        stable_str_hash(&self.0)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One physical instantiation of a grain: which grain, which activation, where.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    pub grain: GrainId,
    pub activation: ActivationId,
    pub host: HostId,
}

impl ActivationAddress {
    pub fn new(grain: GrainId, activation: ActivationId, host: HostId) -> Self {
        Self {
            grain,
            activation,
            host,
        }
    }

    /// Fresh address for a new activation of `grain` on `host`.
    pub fn new_activation(grain: GrainId, host: HostId) -> Self {
        Self::new(grain, ActivationId::new_random(), host)
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.grain, self.activation, self.host)
    }
}

/// Registration status of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectoryEntryStatus {
    /// No entry, or an entry that cannot be interpreted.
    Invalid,
    /// Registered through the cluster-local strategy; never coordinated.
    ClusterLocal,
    /// Tentatively claimed, an ownership round is pending.
    RequestedOwnership,
    /// This cluster is the authoritative host.
    Owned,
    /// Held locally but ownership cannot currently be asserted.
    Doubtful,
    /// Lost a race against a concurrent request; must retry.
    RaceLoser,
    /// Pointer to an activation owned by another cluster.
    Cached,
}

impl DirectoryEntryStatus {
    /// Whether other clusters may hold a cached pointer to an entry in this state.
    pub fn is_visible_to_remote_clusters(&self) -> bool {
        matches!(self, DirectoryEntryStatus::Owned | DirectoryEntryStatus::Doubtful)
    }
}

impl fmt::Display for DirectoryEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectoryEntryStatus::Invalid => "INVALID",
            DirectoryEntryStatus::ClusterLocal => "CLUSTER_LOCAL",
            DirectoryEntryStatus::RequestedOwnership => "REQUESTED_OWNERSHIP",
            DirectoryEntryStatus::Owned => "OWNED",
            DirectoryEntryStatus::Doubtful => "DOUBTFUL",
            DirectoryEntryStatus::RaceLoser => "RACE_LOSER",
            DirectoryEntryStatus::Cached => "CACHED",
        };
        f.write_str(name)
    }
}

/// Why an activation is being removed from the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnregistrationCause {
    /// Unconditional removal (deactivation, remote notice).
    Force,
    /// A caller found the activation missing; skipped for fresh registrations.
    NonexistentActivation,
    /// Only evicts cached pointers to remote activations.
    CacheInvalidation,
}
