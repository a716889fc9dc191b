//! Health Prober: one background task per Mirror Binding that refreshes the
//! per-replica online flag on a fixed interval, independent of the request
//! path.

use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::bucket::MirrorBindings;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until `shutdown` fires. Every interval, probes every replica of
/// every Mirror Binding in parallel and atomically flips its online flag:
/// success sets it, any error clears it. The flag is read lock-free by the
/// pipeline via `ReplicaClient::is_online`.
pub async fn run(bindings: &MirrorBindings, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return;
            }
            _ = ticker.tick() => {
                probe_all(bindings).await;
            }
        }
    }
}

async fn probe_all(bindings: &MirrorBindings) {
    let mut probes = Vec::new();
    for binding in bindings.iter() {
        for replica in binding.replicas.iter() {
            let replica = replica.clone();
            probes.push(async move {
                let result = replica.backend.bucket_exists().await;
                match result {
                    Ok(true) => replica.set_online(true),
                    Ok(false) => {
                        warn!("replica {} no longer has its bucket, marking offline", replica.id);
                        replica.set_online(false);
                    }
                    Err(e) => {
                        warn!("health probe failed for replica {}: {e}", replica.id);
                        replica.set_online(false);
                    }
                }
            });
        }
    }
    futures::future::join_all(probes).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::replica::testing::mock_replica_client;

    #[tokio::test]
    async fn probe_all_marks_failures_offline() {
        let (replica, backend_ctl) = mock_replica_client("r0", true);
        backend_ctl.set_bucket_exists_result(Ok(false));

        let mut bindings = std::collections::HashMap::new();
        let second = mock_replica_client("r1", true).0;
        bindings.insert(
            "b".to_string(),
            crate::bucket::MirrorBinding {
                name: "b".to_string(),
                replicas: [Arc::clone(&replica), second],
            },
        );
        let bindings = crate::bucket::MirrorBindings::from_map_for_tests(bindings);

        probe_all(&bindings).await;
        assert!(!replica.is_online());
    }
}
