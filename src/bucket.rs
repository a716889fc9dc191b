//! Logical bucket bindings, assembled once at startup from `Config` and
//! never mutated afterward.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::replica::{Replica, ReplicaClient, S3Backend};

/// The per-bucket ordered list of Replica Clients. Position in this vector
/// is the replica index, the only cross-node-stable identifier used at
/// runtime; every peer in a cluster must be configured with the same order.
pub struct MirrorBinding {
    pub name: String,
    pub replicas: [Arc<ReplicaClient>; 2],
}

impl MirrorBinding {
    pub fn replica(&self, index: usize) -> &Arc<ReplicaClient> {
        &self.replicas[index]
    }
}

/// Read-only map from logical bucket name to its Mirror Binding, built once
/// at startup. The only global mutable state beyond this is the multipart
/// registry and the per-replica online flags, both owned by their
/// respective components.
pub struct MirrorBindings(HashMap<String, MirrorBinding>);

impl MirrorBindings {
    pub fn from_config(config: &Config) -> Self {
        let mut bindings = HashMap::with_capacity(config.buckets.len());
        for (name, bucket) in &config.buckets {
            assert_eq!(
                bucket.remote.len(),
                2,
                "config validation must reject non-mirror bucket {name} before this point"
            );
            let replicas: Vec<Arc<ReplicaClient>> = bucket
                .remote
                .iter()
                .map(|remote| {
                    let replica = Replica::from(remote);
                    let backend = Box::new(S3Backend::new(&replica));
                    Arc::new(ReplicaClient::new(&replica, backend))
                })
                .collect();
            let replicas: [Arc<ReplicaClient>; 2] = replicas
                .try_into()
                .unwrap_or_else(|_| unreachable!("validated to be exactly 2 remotes"));
            bindings.insert(
                name.clone(),
                MirrorBinding {
                    name: name.clone(),
                    replicas,
                },
            );
        }
        Self(bindings)
    }

    pub fn get(&self, bucket: &str) -> Option<&MirrorBinding> {
        self.0.get(bucket)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MirrorBinding> {
        self.0.values()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn from_map_for_tests(map: HashMap<String, MirrorBinding>) -> Self {
        Self(map)
    }
}
