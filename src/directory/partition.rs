//! Directory Partition
//!
//! Local per-cluster store mapping a grain to its activations, each carrying a
//! registration status. Every mutation bumps a partition-wide version counter,
//! and status changes are compare-and-set on the expected previous status, so
//! callers never hold a lock across an await point.

use crate::directory::types::{
    ActivationAddress, ActivationId, DirectoryEntryStatus, GrainId, HostId, UnregistrationCause,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Snapshot of the activation registered for a grain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationEntry {
    pub address: ActivationAddress,
    pub version: u64,
    pub status: DirectoryEntryStatus,
}

/// An activation that was removed from the partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedActivation {
    pub address: ActivationAddress,
    pub status: DirectoryEntryStatus,
}

/// Storage interface consumed by the registrars, the endpoint and the maintainer.
pub trait DirectoryPartition: Send + Sync {
    /// Current activation of a grain with its version tag and status.
    fn try_get_activation(&self, grain: &GrainId) -> Option<ActivationEntry>;

    /// Create the single activation of a grain with `initial_status`.
    ///
    /// If the grain already has an activation, nothing is written and the
    /// existing activation is returned instead.
    fn add_single_activation(
        &self,
        address: &ActivationAddress,
        initial_status: DirectoryEntryStatus,
    ) -> ActivationEntry;

    /// Add one more activation to a multi-activation grain. Returns the new version.
    fn add_activation(&self, address: &ActivationAddress, status: DirectoryEntryStatus) -> u64;

    /// Compare-and-set the status of one activation.
    fn update_status(
        &self,
        grain: &GrainId,
        activation: &ActivationId,
        expected: DirectoryEntryStatus,
        new: DirectoryEntryStatus,
    ) -> bool;

    /// Remove one activation. Returns the removed activation and whether a removal happened.
    fn remove_activation(
        &self,
        grain: &GrainId,
        activation: &ActivationId,
        cause: UnregistrationCause,
    ) -> (Option<RemovedActivation>, bool);

    /// Replace the local activation of a grain with a pointer to a remote owner.
    fn cache_remote_pointer(
        &self,
        grain: &GrainId,
        local_activation: &ActivationId,
        remote: &ActivationAddress,
    );

    /// Drop the whole entry of a grain, returning the activations it held.
    fn remove_grain(&self, grain: &GrainId) -> Vec<RemovedActivation>;

    /// Activations of single-instance grains currently in `status`.
    fn single_instance_entries_with_status(
        &self,
        status: DirectoryEntryStatus,
    ) -> Vec<ActivationAddress>;

    /// Grains whose (first) activation is in `status`.
    fn grains_with_status(&self, status: DirectoryEntryStatus) -> Vec<GrainId>;

    /// Number of grains with an entry.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
struct ActivationInfo {
    activation: ActivationId,
    host: HostId,
    status: DirectoryEntryStatus,
    registered_at: Instant,
}

#[derive(Debug)]
struct GrainInfo {
    activations: Vec<ActivationInfo>,
    version: u64,
    single_instance: bool,
}

impl GrainInfo {
    fn find(&self, activation: &ActivationId) -> Option<usize> {
        self.activations.iter().position(|a| &a.activation == activation)
    }

    fn first_entry(&self, grain: &GrainId) -> Option<ActivationEntry> {
        self.activations.first().map(|info| ActivationEntry {
            address: ActivationAddress::new(grain.clone(), info.activation, info.host.clone()),
            version: self.version,
            status: info.status,
        })
    }
}

struct PartitionState {
    grains: HashMap<GrainId, GrainInfo>,
    next_version: u64,
}

impl PartitionState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-memory versioned partition.
pub struct InMemoryDirectoryPartition {
    state: Mutex<PartitionState>,
    lazy_deregistration_delay: Duration,
}

impl InMemoryDirectoryPartition {
    /// Create an empty partition.
    ///
    /// `lazy_deregistration_delay` is the minimum age an activation must reach
    /// before a `NonexistentActivation` removal is honoured.
    pub fn new(lazy_deregistration_delay: Duration) -> Self {
        Self {
            state: Mutex::new(PartitionState {
                grains: HashMap::new(),
                next_version: 0,
            }),
            lazy_deregistration_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_skip_removal(&self, info: &ActivationInfo, cause: UnregistrationCause) -> bool {
        match cause {
            UnregistrationCause::Force => false,
            UnregistrationCause::CacheInvalidation => info.status != DirectoryEntryStatus::Cached,
            UnregistrationCause::NonexistentActivation => {
                info.status == DirectoryEntryStatus::RequestedOwnership
                    || info.registered_at.elapsed() < self.lazy_deregistration_delay
            }
        }
    }
}

impl Default for InMemoryDirectoryPartition {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl DirectoryPartition for InMemoryDirectoryPartition {
    fn try_get_activation(&self, grain: &GrainId) -> Option<ActivationEntry> {
        let state = self.lock();
        state.grains.get(grain).and_then(|info| info.first_entry(grain))
    }

    fn add_single_activation(
        &self,
        address: &ActivationAddress,
        initial_status: DirectoryEntryStatus,
    ) -> ActivationEntry {
        let mut state = self.lock();

        if let Some(existing) = state
            .grains
            .get(&address.grain)
            .and_then(|info| info.first_entry(&address.grain))
        {
            return existing;
        }

        let version = state.bump();
        state.grains.insert(
            address.grain.clone(),
            GrainInfo {
                activations: vec![ActivationInfo {
                    activation: address.activation,
                    host: address.host.clone(),
                    status: initial_status,
                    registered_at: Instant::now(),
                }],
                version,
                single_instance: true,
            },
        );

        ActivationEntry {
            address: address.clone(),
            version,
            status: initial_status,
        }
    }

    fn add_activation(&self, address: &ActivationAddress, status: DirectoryEntryStatus) -> u64 {
        let mut state = self.lock();
        let version = state.bump();
        let info = state
            .grains
            .entry(address.grain.clone())
            .or_insert_with(|| GrainInfo {
                activations: Vec::new(),
                version,
                single_instance: false,
            });

        match info.find(&address.activation) {
            // Same activation on the same host: just a refresh.
            Some(idx) if info.activations[idx].host == address.host => return info.version,
            Some(idx) => {
                info.activations[idx].host = address.host.clone();
                info.activations[idx].status = status;
                info.activations[idx].registered_at = Instant::now();
            }
            None => info.activations.push(ActivationInfo {
                activation: address.activation,
                host: address.host.clone(),
                status,
                registered_at: Instant::now(),
            }),
        }
        info.version = version;
        version
    }

    fn update_status(
        &self,
        grain: &GrainId,
        activation: &ActivationId,
        expected: DirectoryEntryStatus,
        new: DirectoryEntryStatus,
    ) -> bool {
        let mut state = self.lock();
        let version = state.next_version + 1;

        let Some(info) = state.grains.get_mut(grain) else {
            return false;
        };
        let Some(idx) = info.find(activation) else {
            return false;
        };
        if info.activations[idx].status != expected {
            return false;
        }

        info.activations[idx].status = new;
        info.version = version;
        state.next_version = version;
        true
    }

    fn remove_activation(
        &self,
        grain: &GrainId,
        activation: &ActivationId,
        cause: UnregistrationCause,
    ) -> (Option<RemovedActivation>, bool) {
        let mut state = self.lock();
        let version = state.next_version + 1;

        let Some(info) = state.grains.get_mut(grain) else {
            return (None, false);
        };
        let Some(idx) = info.find(activation) else {
            return (None, false);
        };
        if self.should_skip_removal(&info.activations[idx], cause) {
            return (None, false);
        }

        let removed = info.activations.remove(idx);
        info.version = version;
        let now_empty = info.activations.is_empty();
        state.next_version = version;
        if now_empty {
            state.grains.remove(grain);
        }

        (
            Some(RemovedActivation {
                address: ActivationAddress::new(grain.clone(), removed.activation, removed.host),
                status: removed.status,
            }),
            true,
        )
    }

    fn cache_remote_pointer(
        &self,
        grain: &GrainId,
        local_activation: &ActivationId,
        remote: &ActivationAddress,
    ) {
        let mut state = self.lock();
        let version = state.bump();
        let info = state.grains.entry(grain.clone()).or_insert_with(|| GrainInfo {
            activations: Vec::new(),
            version,
            single_instance: true,
        });

        if let Some(idx) = info.find(local_activation) {
            info.activations.remove(idx);
        }
        info.activations.retain(|a| a.activation != remote.activation);
        info.activations.insert(
            0,
            ActivationInfo {
                activation: remote.activation,
                host: remote.host.clone(),
                status: DirectoryEntryStatus::Cached,
                registered_at: Instant::now(),
            },
        );
        info.single_instance = true;
        info.version = version;
    }

    fn remove_grain(&self, grain: &GrainId) -> Vec<RemovedActivation> {
        let mut state = self.lock();
        let Some(info) = state.grains.remove(grain) else {
            return Vec::new();
        };
        state.bump();
        info.activations
            .into_iter()
            .map(|a| RemovedActivation {
                address: ActivationAddress::new(grain.clone(), a.activation, a.host),
                status: a.status,
            })
            .collect()
    }

    fn single_instance_entries_with_status(
        &self,
        status: DirectoryEntryStatus,
    ) -> Vec<ActivationAddress> {
        let state = self.lock();
        state
            .grains
            .iter()
            .filter(|(_, info)| info.single_instance)
            .filter_map(|(grain, info)| info.first_entry(grain))
            .filter(|entry| entry.status == status)
            .map(|entry| entry.address)
            .collect()
    }

    fn grains_with_status(&self, status: DirectoryEntryStatus) -> Vec<GrainId> {
        let state = self.lock();
        state
            .grains
            .iter()
            .filter(|(_, info)| info.activations.first().map(|a| a.status) == Some(status))
            .map(|(grain, _)| grain.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.lock().grains.len()
    }
}
