//! Intra-cluster consistent-hash ring
//!
//! Decides which silo of this cluster owns the directory partition for a
//! grain. Silos are placed on the ring by the stable hash of their address; a
//! grain belongs to the first silo at or after its uniform hash.

use crate::directory::hash::stable_str_hash;
use crate::directory::types::{GrainId, HostId};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct ConsistentHashRing {
    local: HostId,
    ring: RwLock<Vec<(u64, HostId)>>,
}

impl ConsistentHashRing {
    /// Ring containing only the local silo.
    pub fn new(local: HostId) -> Self {
        let ring = vec![(stable_str_hash(local.as_str()), local.clone())];
        Self {
            local,
            ring: RwLock::new(ring),
        }
    }

    /// Ring containing the local silo plus `others`.
    pub fn with_hosts(local: HostId, others: impl IntoIterator<Item = HostId>) -> Self {
        let ring = Self::new(local);
        for host in others {
            ring.add_host(host);
        }
        ring
    }

    pub fn local_host(&self) -> &HostId {
        &self.local
    }

    /// Add a silo. Returns false if it was already present.
    pub fn add_host(&self, host: HostId) -> bool {
        let mut ring = self.write();
        if ring.iter().any(|(_, h)| h == &host) {
            return false;
        }
        let point = stable_str_hash(host.as_str());
        let idx = ring
            .iter()
            .position(|(p, h)| (*p, h) > (point, &host))
            .unwrap_or(ring.len());
        ring.insert(idx, (point, host));
        true
    }

    /// Remove a silo. The local silo is never removed.
    pub fn remove_host(&self, host: &HostId) -> bool {
        if host == &self.local {
            return false;
        }
        let mut ring = self.write();
        let before = ring.len();
        ring.retain(|(_, h)| h != host);
        ring.len() != before
    }

    /// Silo owning the partition for `grain`.
    pub fn owner_of(&self, grain: &GrainId) -> HostId {
        let ring = self.read();
        let point = grain.uniform_hash();
        ring.iter()
            .find(|(p, _)| *p >= point)
            .or_else(|| ring.first())
            .map(|(_, h)| h.clone())
            .unwrap_or_else(|| self.local.clone())
    }

    pub fn is_local_owner(&self, grain: &GrainId) -> bool {
        self.owner_of(grain) == self.local
    }

    pub fn hosts(&self) -> Vec<HostId> {
        self.read().iter().map(|(_, h)| h.clone()).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(u64, HostId)>> {
        self.ring.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(u64, HostId)>> {
        self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
