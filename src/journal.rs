//! Heal Journal: append-only per-`(replicaBucket, bucket, object)`
//! divergence log, a non-blocking submission channel, and the background
//! replay loop that reconciles replicas from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::MirrorBindings;
use crate::ids::ReplicaId;
use crate::replica::{CopyOptions, PutOptions, ReplicaClient};
use crate::types::{JournalOp, SseMarker};

pub const REPLAY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub bucket: String,
    pub object: String,
    pub dst_bucket: Option<String>,
    pub dst_object: Option<String>,
    pub replica_bucket: String,
    pub err_client_id: ReplicaId,
    pub src_client_id: ReplicaId,
    pub timestamp_unix_ms: u128,
    pub etag: Option<String>,
    pub radio_tag: Option<String>,
    #[serde(default)]
    pub user_meta: HashMap<String, String>,
    #[serde(default)]
    pub sse: SseMarker,
}

impl JournalEntry {
    pub fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

fn journal_path(dir: &Path, replica_bucket: &str, bucket: &str, object: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(replica_bucket.as_bytes());
    hasher.update(b"\0");
    hasher.update(bucket.as_bytes());
    hasher.update(b"\0");
    hasher.update(object.as_bytes());
    dir.join(format!("{}.json", hex::encode(hasher.finalize())))
}

/// Owns the submission channel and the directory entries live under. One
/// background task drains the channel and writes to disk; the request path
/// only ever calls the non-blocking `submit`.
pub struct HealJournal {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl HealJournal {
    pub fn spawn(dir: PathBuf, shutdown: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_writer(dir.clone(), rx, shutdown));
        Arc::new(Self { dir, tx })
    }

    /// Enqueues `entry` for durable storage. Never blocks the request path;
    /// if the writer task is gone the entry is dropped with a warning, since
    /// by this point the client already has an acknowledgment from at least
    /// one replica.
    pub fn submit(&self, entry: JournalEntry) {
        if self.tx.send(entry).is_err() {
            log::warn!("heal journal writer is gone, dropping entry");
            return;
        }
        crate::metrics::COUNTERS.journal_entry_submitted();
    }

    pub async fn read_latest(&self, replica_bucket: &str, bucket: &str, object: &str) -> Option<JournalEntry> {
        let path = journal_path(&self.dir, replica_bucket, bucket, object);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn run_writer(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<JournalEntry>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                entry = rx.recv() => {
                    match entry {
                        Some(entry) => {
                            if let Err(e) = write_entry(&dir, &entry).await {
                                log::warn!(
                                    "failed to write heal journal entry for {}/{}: {e}",
                                    entry.bucket, entry.object
                                );
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

async fn write_entry(dir: &Path, entry: &JournalEntry) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = journal_path(dir, &entry.replica_bucket, &entry.bucket, &entry.object);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn remove_entry(dir: &Path, entry: &JournalEntry) {
    let path = journal_path(dir, &entry.replica_bucket, &entry.bucket, &entry.object);
    let _ = tokio::fs::remove_file(&path).await;
}

async fn all_entries(dir: &Path) -> Vec<JournalEntry> {
    let mut entries = Vec::new();
    let Ok(mut read_dir) = tokio::fs::read_dir(dir).await else {
        return entries;
    };
    while let Ok(Some(file)) = read_dir.next_entry().await {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(entry) = serde_json::from_slice::<JournalEntry>(&bytes) {
                entries.push(entry);
            }
        }
    }
    entries
}

/// Runs until `shutdown` fires, replaying every journal entry once per
/// `REPLAY_INTERVAL`.
pub async fn run_replay(journal: Arc<HealJournal>, bindings: Arc<MirrorBindings>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(REPLAY_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => replay_once(&journal, &bindings).await,
        }
    }
}

/// Runs one replay pass immediately rather than waiting for the next
/// `REPLAY_INTERVAL` tick. Used by callers that want to force reconciliation
/// (an admin endpoint, a test) without waiting out the background cadence.
pub async fn replay_now(journal: &HealJournal, bindings: &MirrorBindings) {
    replay_once(journal, bindings).await;
}

async fn replay_once(journal: &HealJournal, bindings: &MirrorBindings) {
    for entry in all_entries(&journal.dir).await {
        // CopyObject entries journal the destination side: both the failed
        // replica and the winning source-of-truth replica live in the
        // destination's Mirror Binding, since for a cross-bucket copy the
        // object was never written into the source binding's failed slot.
        let lookup_bucket = entry.dst_bucket.as_deref().unwrap_or(&entry.bucket);
        let Some(binding) = bindings.get(lookup_bucket) else {
            continue;
        };
        let Some(err_replica) = binding.replicas.iter().find(|r| r.id == entry.err_client_id) else {
            continue;
        };
        let Some(src_replica) = binding.replicas.iter().find(|r| r.id == entry.src_client_id) else {
            continue;
        };
        if !err_replica.is_online() || !src_replica.is_online() {
            continue;
        }
        match replay_entry(&entry, src_replica, err_replica).await {
            Ok(true) => {
                remove_entry(&journal.dir, &entry).await;
                crate::metrics::COUNTERS.journal_entry_replayed();
            }
            Ok(false) => {}
            Err(e) => log::warn!(
                "replay failed for {}/{} against replica {}: {e}",
                entry.bucket, entry.object, err_replica.id
            ),
        }
    }
}

/// Replays one entry against the failed replica. Returns `Ok(true)` when the
/// entry is fully reconciled (and should be removed), `Ok(false)` when it
/// should be retried next cycle without being treated as an error.
async fn replay_entry(entry: &JournalEntry, src: &Arc<ReplicaClient>, err: &Arc<ReplicaClient>) -> anyhow::Result<bool> {
    match entry.op {
        JournalOp::PutObject => {
            if already_converged(err, &entry.object, entry.etag.as_deref()).await {
                return Ok(true);
            }
            let (mut stream, _src_info) = src.backend.get_object(&entry.object, None).await?;
            let mut body = Vec::new();
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk?);
            }
            let opts = PutOptions {
                content_type: None,
                user_metadata: entry.user_meta.clone(),
                sse: entry.sse.clone(),
                md5_base64: None,
                sha256_hex: None,
            };
            err.backend.put_object(&entry.object, body.into(), &opts).await?;
            Ok(true)
        }
        JournalOp::CopyObject => {
            let dst = entry.dst_object.as_deref().unwrap_or(&entry.object);
            if already_converged(err, dst, entry.etag.as_deref()).await {
                return Ok(true);
            }
            // `src_client_id` here names the winning *destination*-side
            // replica, not the original copy source: for a same-bucket copy
            // that's also a sibling of `err` holding the source key, so the
            // backend's own `copy_object` still works. For a cross-bucket
            // copy the object only exists at `dst` on `src`, so it has to be
            // fetched and re-PUT into `err` instead of re-copied.
            let cross_bucket = entry.dst_bucket.as_deref().is_some_and(|b| b != entry.bucket);
            if cross_bucket {
                let (mut stream, src_info) = src.backend.get_object(dst, None).await?;
                let mut body = Vec::new();
                while let Some(chunk) = stream.next().await {
                    body.extend_from_slice(&chunk?);
                }
                let opts = PutOptions {
                    content_type: src_info.content_type.clone(),
                    user_metadata: entry.user_meta.clone(),
                    sse: entry.sse.clone(),
                    md5_base64: None,
                    sha256_hex: None,
                };
                err.backend.put_object(dst, body.into(), &opts).await?;
            } else {
                let opts = CopyOptions {
                    user_metadata: entry.user_meta.clone(),
                    sse: entry.sse.clone(),
                    metadata_directive_replace: true,
                    copy_source_if_match: None,
                };
                err.backend.copy_object(&entry.object, dst, &opts).await?;
            }
            Ok(true)
        }
        JournalOp::DeleteObject => match err.backend.stat_object(&entry.object).await {
            Err(_) => Ok(true),
            Ok(_) => {
                err.backend.remove_object(&entry.object).await?;
                Ok(true)
            }
        },
    }
}

async fn already_converged(replica: &Arc<ReplicaClient>, key: &str, expected_etag: Option<&str>) -> bool {
    let Some(expected) = expected_etag else {
        return false;
    };
    matches!(replica.backend.stat_object(key).await, Ok(info) if info.etag == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::testing::mock_replica_client;
    use bytes::Bytes;

    #[tokio::test]
    async fn submit_then_read_latest_round_trips() {
        let dir = tempdir::TempDir::new("radio-journal-test").unwrap();
        let journal = HealJournal::spawn(dir.path().to_path_buf(), CancellationToken::new());
        let entry = JournalEntry {
            op: JournalOp::PutObject,
            bucket: "photos".into(),
            object: "cat.png".into(),
            dst_bucket: None,
            dst_object: None,
            replica_bucket: "photos-west".into(),
            err_client_id: ReplicaId::from_connection_tuple("http://west", "photos-west", "ak", "sk", None),
            src_client_id: ReplicaId::from_connection_tuple("http://east", "photos-east", "ak", "sk", None),
            timestamp_unix_ms: JournalEntry::now_ms(),
            etag: Some("abc123".into()),
            radio_tag: Some("tag-1".into()),
            user_meta: HashMap::new(),
            sse: SseMarker(None),
        };
        journal.submit(entry.clone());

        // give the writer task a turn; the channel drains as soon as it's scheduled.
        for _ in 0..50 {
            if journal.read_latest("photos-west", "photos", "cat.png").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let found = journal.read_latest("photos-west", "photos", "cat.png").await.unwrap();
        assert_eq!(found.etag, entry.etag);
    }

    #[tokio::test]
    async fn replay_put_object_streams_from_source_to_failed_replica() {
        let (src, src_ctl) = mock_replica_client("src", true);
        let (err, _err_ctl) = mock_replica_client("err", true);
        src_ctl.seed_object(
            "k",
            Bytes::from_static(b"hello"),
            crate::types::ObjectInfo {
                size: 5,
                etag: "etag-1".into(),
                content_type: None,
                user_metadata: HashMap::new(),
                sse: SseMarker(None),
                replica_index: 0,
            },
        );

        let entry = JournalEntry {
            op: JournalOp::PutObject,
            bucket: "b".into(),
            object: "k".into(),
            dst_bucket: None,
            dst_object: None,
            replica_bucket: "err".into(),
            err_client_id: err.id.clone(),
            src_client_id: src.id.clone(),
            timestamp_unix_ms: JournalEntry::now_ms(),
            etag: Some("etag-1".into()),
            radio_tag: None,
            user_meta: HashMap::new(),
            sse: SseMarker(None),
        };

        let consumed = replay_entry(&entry, &src, &err).await.unwrap();
        assert!(consumed);
    }

    #[tokio::test]
    async fn replay_delete_is_idempotent_when_already_gone() {
        let (src, _) = mock_replica_client("src", true);
        let (err, _) = mock_replica_client("err", true);
        let entry = JournalEntry {
            op: JournalOp::DeleteObject,
            bucket: "b".into(),
            object: "missing".into(),
            dst_bucket: None,
            dst_object: None,
            replica_bucket: "err".into(),
            err_client_id: err.id.clone(),
            src_client_id: src.id.clone(),
            timestamp_unix_ms: JournalEntry::now_ms(),
            etag: None,
            radio_tag: None,
            user_meta: HashMap::new(),
            sse: SseMarker(None),
        };
        let consumed = replay_entry(&entry, &src, &err).await.unwrap();
        assert!(consumed);
    }
}
