//! Authoritative per-peer lock state: the table a peer's own lock server
//! consults when deciding whether to grant, and the in-process
//! implementation of [`PeerLockClient`](super::PeerLockClient) used to talk
//! to the local peer without a network round trip.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{LockGrant, LockMode, PeerLockClient};

struct Holder {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct ResourceState {
    mode: Option<LockMode>,
    holders: Vec<Holder>,
}

impl ResourceState {
    fn prune(&mut self, now: Instant) {
        self.holders.retain(|h| h.expires_at > now);
        if self.holders.is_empty() {
            self.mode = None;
        }
    }

    fn grant(&mut self, mode: LockMode, owner: &str, ttl: Duration, now: Instant) -> bool {
        self.prune(now);
        let compatible = match self.mode {
            None => true,
            Some(LockMode::Shared) => mode == LockMode::Shared,
            Some(LockMode::Exclusive) => self.holders.iter().all(|h| h.owner == owner),
        };
        if !compatible {
            return false;
        }
        self.mode = Some(mode);
        if let Some(existing) = self.holders.iter_mut().find(|h| h.owner == owner) {
            existing.expires_at = now + ttl;
        } else {
            self.holders.push(Holder {
                owner: owner.to_string(),
                expires_at: now + ttl,
            });
        }
        true
    }
}

struct Lease {
    resource: String,
    owner: String,
}

/// Per-peer lock table: resource name to lock state, plus a reverse index
/// from the opaque lease id handed back to acquirers so `Unlock`/`Refresh`
/// don't need to carry the resource name back.
#[derive(Default)]
pub struct LocalLockTable {
    resources: Mutex<HashMap<String, ResourceState>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, resource: &str, mode: LockMode, owner: &str, ttl: Duration) -> LockGrant {
        let now = Instant::now();
        let mut resources = self.resources.lock();
        let state = resources.entry(resource.to_string()).or_default();
        if !state.grant(mode, owner, ttl, now) {
            return LockGrant {
                granted: false,
                lease_id: None,
            };
        }
        let lease_id = Uuid::new_v4().to_string();
        self.leases.lock().insert(
            lease_id.clone(),
            Lease {
                resource: resource.to_string(),
                owner: owner.to_string(),
            },
        );
        LockGrant {
            granted: true,
            lease_id: Some(lease_id),
        }
    }

    pub fn unlock(&self, lease_id: &str) {
        let Some(lease) = self.leases.lock().remove(lease_id) else {
            return;
        };
        let mut resources = self.resources.lock();
        if let Some(state) = resources.get_mut(&lease.resource) {
            state.holders.retain(|h| h.owner != lease.owner);
            state.prune(Instant::now());
        }
    }

    pub fn refresh(&self, lease_id: &str, ttl: Duration) -> bool {
        let leases = self.leases.lock();
        let Some(lease) = leases.get(lease_id) else {
            return false;
        };
        let resource = lease.resource.clone();
        let owner = lease.owner.clone();
        drop(leases);
        let mut resources = self.resources.lock();
        let Some(state) = resources.get_mut(&resource) else {
            return false;
        };
        let now = Instant::now();
        state.prune(now);
        if let Some(holder) = state.holders.iter_mut().find(|h| h.owner == owner) {
            holder.expires_at = now + ttl;
            true
        } else {
            false
        }
    }

    pub fn force_unlock(&self, resource: &str) {
        self.resources.lock().remove(resource);
        self.leases.lock().retain(|_, lease| lease.resource != resource);
    }
}

/// In-process `PeerLockClient` for this node's own lock server, avoiding an
/// HTTP hop back to ourselves when computing the majority.
pub struct LocalPeer {
    table: std::sync::Arc<LocalLockTable>,
}

impl LocalPeer {
    pub fn new(table: std::sync::Arc<LocalLockTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl PeerLockClient for LocalPeer {
    async fn lock(&self, resource: &str, mode: LockMode, owner: &str, ttl: Duration) -> anyhow::Result<LockGrant> {
        Ok(self.table.lock(resource, mode, owner, ttl))
    }

    async fn unlock(&self, lease_id: &str) -> anyhow::Result<()> {
        self.table.unlock(lease_id);
        Ok(())
    }

    async fn refresh(&self, lease_id: &str, ttl: Duration) -> anyhow::Result<bool> {
        Ok(self.table.refresh(lease_id, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let table = LocalLockTable::new();
        let a = table.lock("r", LockMode::Shared, "a", Duration::from_secs(30));
        let b = table.lock("r", LockMode::Shared, "b", Duration::from_secs(30));
        assert!(a.granted);
        assert!(b.granted);
    }

    #[test]
    fn exclusive_conflicts_with_shared() {
        let table = LocalLockTable::new();
        let a = table.lock("r", LockMode::Shared, "a", Duration::from_secs(30));
        let b = table.lock("r", LockMode::Exclusive, "b", Duration::from_secs(30));
        assert!(a.granted);
        assert!(!b.granted);
    }

    #[test]
    fn exclusive_is_reentrant_for_same_owner() {
        let table = LocalLockTable::new();
        let a = table.lock("r", LockMode::Exclusive, "a", Duration::from_secs(30));
        let b = table.lock("r", LockMode::Exclusive, "a", Duration::from_secs(30));
        assert!(a.granted);
        assert!(b.granted);
    }

    #[test]
    fn unlock_releases_for_other_owners() {
        let table = LocalLockTable::new();
        let grant = table.lock("r", LockMode::Exclusive, "a", Duration::from_secs(30));
        table.unlock(grant.lease_id.as_deref().unwrap());
        let b = table.lock("r", LockMode::Exclusive, "b", Duration::from_secs(30));
        assert!(b.granted);
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let table = LocalLockTable::new();
        table.lock("r", LockMode::Exclusive, "a", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        let b = table.lock("r", LockMode::Exclusive, "b", Duration::from_secs(30));
        assert!(b.granted);
    }

    #[test]
    fn force_unlock_clears_all_holders() {
        let table = LocalLockTable::new();
        table.lock("r", LockMode::Shared, "a", Duration::from_secs(30));
        table.lock("r", LockMode::Shared, "b", Duration::from_secs(30));
        table.force_unlock("r");
        let c = table.lock("r", LockMode::Exclusive, "c", Duration::from_secs(30));
        assert!(c.granted);
    }
}
