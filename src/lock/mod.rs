//! Distributed Namespace Lock: one logical R/W lock per `(bucket, object)`
//! honored across every peer node via majority-quorum grants.

mod rpc;
mod server;
mod table;

pub use rpc::RemotePeer;
pub use server::{router, LockServerState};
pub use table::{LocalLockTable, LocalPeer};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;

/// Refresh cadence: half the lease TTL, so a refresher that misses one tick
/// still has a full TTL/2 of slack before the peer reclaims the grant.
pub const LEASE_TTL: Duration = Duration::from_secs(30);
const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockGrant {
    pub granted: bool,
    pub lease_id: Option<String>,
}

/// Abstraction over one peer's lock server, whether reached in-process
/// ([`LocalPeer`]) or over the wire ([`RemotePeer`]).
#[async_trait]
pub trait PeerLockClient: Send + Sync {
    async fn lock(&self, resource: &str, mode: LockMode, owner: &str, ttl: Duration) -> anyhow::Result<LockGrant>;
    async fn unlock(&self, lease_id: &str) -> anyhow::Result<()>;
    async fn refresh(&self, lease_id: &str, ttl: Duration) -> anyhow::Result<bool>;
}

/// Client-facing handle to the cluster of peer lock servers. One instance is
/// shared by the whole pipeline; `acquire` is the only entry point callers
/// need.
pub struct DistributedLock {
    peers: Vec<Arc<dyn PeerLockClient>>,
}

impl DistributedLock {
    pub fn new(peers: Vec<Arc<dyn PeerLockClient>>) -> Self {
        assert!(!peers.is_empty(), "a namespace lock needs at least one peer");
        Self { peers }
    }

    fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// Acquires `resource` in `mode`, racing grants from every peer against
    /// `deadline`. Returns as soon as a majority is reached; on timeout,
    /// releases whatever partial grants were collected and fails.
    pub async fn acquire(
        self: &Arc<Self>,
        bucket: &str,
        object: &str,
        resource: &str,
        mode: LockMode,
        deadline: Duration,
    ) -> Result<LockHandle, GatewayError> {
        let owner = Uuid::new_v4().to_string();
        let majority = self.majority();
        let wait_start = tokio::time::Instant::now();

        let mut pending: FuturesUnordered<_> = self
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                let peer = peer.clone();
                let owner = owner.clone();
                let resource = resource.to_string();
                async move { (i, peer.lock(&resource, mode, &owner, LEASE_TTL).await) }
            })
            .collect();

        let mut grants: Vec<(usize, String)> = Vec::new();
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        loop {
            if grants.len() >= majority {
                break;
            }
            tokio::select! {
                _ = &mut sleep => break,
                next = pending.next() => {
                    match next {
                        Some((i, Ok(grant))) if grant.granted => {
                            if let Some(lease_id) = grant.lease_id {
                                grants.push((i, lease_id));
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        if grants.len() < majority {
            self.release_grants(&grants).await;
            return Err(GatewayError::LockUnavailable {
                bucket: bucket.to_string(),
                object: object.to_string(),
                reason: format!("only {}/{} peers granted within deadline", grants.len(), self.peers.len()),
            });
        }

        crate::metrics::COUNTERS.record_lock_wait(wait_start.elapsed());

        let cancel = tokio_util::sync::CancellationToken::new();
        let refresher = tokio::spawn(Self::run_refresher(
            self.clone(),
            grants.clone(),
            cancel.clone(),
        ));

        Ok(LockHandle {
            resource: resource.to_string(),
            mode,
            owner,
            grants,
            lock: self.clone(),
            cancel,
            refresher: Some(refresher),
        })
    }

    async fn release_grants(&self, grants: &[(usize, String)]) {
        let releases = grants.iter().map(|(i, lease_id)| {
            let peer = self.peers[*i].clone();
            let lease_id = lease_id.clone();
            async move {
                if let Err(e) = peer.unlock(&lease_id).await {
                    log::warn!("best-effort unlock failed for peer {i}: {e}");
                }
            }
        });
        futures::future::join_all(releases).await;
    }

    async fn run_refresher(lock: Arc<Self>, grants: Vec<(usize, String)>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    for (i, lease_id) in &grants {
                        if let Err(e) = lock.peers[*i].refresh(lease_id, LEASE_TTL).await {
                            log::warn!("lease refresh failed for peer {i}: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Held lock; releases on `release()` (preferred) or, failing that, relies
/// on lease expiry to reclaim the grant after a crash — Drop only stops the
/// refresher task, since network unlock calls cannot run in a destructor.
pub struct LockHandle {
    pub resource: String,
    pub mode: LockMode,
    owner: String,
    grants: Vec<(usize, String)>,
    lock: Arc<DistributedLock>,
    cancel: tokio_util::sync::CancellationToken,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .field("grants", &self.grants)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn release(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.refresher.take() {
            let _ = handle.await;
        }
        self.lock.release_grants(&self.grants).await;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    /// Builds a single-node `DistributedLock` backed purely by in-process
    /// tables, for tests that exercise pipeline locking without a network.
    pub fn single_node_lock() -> Arc<DistributedLock> {
        let table = Arc::new(LocalLockTable::new());
        Arc::new(DistributedLock::new(vec![Arc::new(LocalPeer::new(table))]))
    }

    pub fn multi_node_lock(n: usize) -> Arc<DistributedLock> {
        let peers: Vec<Arc<dyn PeerLockClient>> = (0..n)
            .map(|_| {
                let table = Arc::new(LocalLockTable::new());
                Arc::new(LocalPeer::new(table)) as Arc<dyn PeerLockClient>
            })
            .collect();
        Arc::new(DistributedLock::new(peers))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn single_node_majority_is_one() {
        let lock = single_node_lock();
        let handle = lock
            .acquire("b", "o", "b/o", LockMode::Exclusive, Duration::from_secs(5))
            .await
            .unwrap();
        handle.release().await;
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_conflicting_acquire_until_released() {
        let lock = multi_node_lock(3);
        let first = lock
            .acquire("b", "o", "b/o", LockMode::Exclusive, Duration::from_secs(5))
            .await
            .unwrap();

        let err = lock
            .acquire("b", "o", "b/o", LockMode::Exclusive, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LockUnavailable { .. }));

        first.release().await;
        let second = lock
            .acquire("b", "o", "b/o", LockMode::Exclusive, Duration::from_secs(5))
            .await
            .unwrap();
        second.release().await;
    }

    #[tokio::test]
    async fn shared_locks_across_peers_coexist() {
        let lock = multi_node_lock(3);
        let a = lock
            .acquire("b", "o", "b/o", LockMode::Shared, Duration::from_secs(5))
            .await
            .unwrap();
        let b = lock
            .acquire("b", "o", "b/o", LockMode::Shared, Duration::from_secs(5))
            .await
            .unwrap();
        a.release().await;
        b.release().await;
    }
}
