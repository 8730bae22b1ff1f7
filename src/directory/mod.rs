//! Layer 0-1: Local grain directory
//!
//! Identifiers, stable hashing, the versioned directory partition and the
//! intra-cluster ring that picks the partition owner for a grain.

pub mod hash;
pub mod partition;
pub mod ring;
pub mod types;

pub use hash::{stable_hash, stable_str_hash};
pub use partition::{ActivationEntry, DirectoryPartition, InMemoryDirectoryPartition, RemovedActivation};
pub use ring::ConsistentHashRing;
pub use types::{
    ActivationAddress, ActivationId, ClusterId, DirectoryEntryStatus, GrainId, HostId,
    UnregistrationCause,
};
