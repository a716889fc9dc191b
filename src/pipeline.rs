//! Mirrored Object Pipeline: the (lock, fan-out, reduce, journal) pattern
//! applied to each S3 verb. This is the only component the front-end talks
//! to directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{Stream, StreamExt};

use crate::bucket::{MirrorBinding, MirrorBindings};
use crate::duplicator;
use crate::error::{GatewayError, GatewayResult};
use crate::ids::{RadioTag, UploadId, RADIO_TAG_KEY};
use crate::journal::{HealJournal, JournalEntry};
use crate::lock::{DistributedLock, LockMode};
use crate::multipart::MultipartRegistry;
use crate::reducer::{self, Reduced};
use crate::replica::{CopyOptions, PutOptions, ReplicaClient};
use crate::types::{
    JournalOp, MultipartUploadListing, ObjectInfo, ObjectListing, PartInfo, SseMarker,
};

pub const DATA_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const MULTIPART_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const STAT_TIMEOUT: Duration = Duration::from_secs(3);

fn object_resource(bucket: &str, object: &str) -> String {
    format!("{bucket}/{object}")
}

fn batch_resource(bucket: &str) -> String {
    format!("{bucket}/")
}

fn multipart_resource(bucket: &str, object: &str, upload_id: &UploadId) -> String {
    format!("{bucket}/{object}/{upload_id}")
}

#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub sse: SseMarker,
    pub md5_base64: Option<String>,
    pub sha256_hex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyObjectRequest {
    pub user_metadata: HashMap<String, String>,
    pub sse: SseMarker,
    /// Caller-supplied source ETag precondition (`x-amz-copy-source-if-match`
    /// as given by the client, not the gateway's own freshly-read one).
    /// A mismatch is a client error: rejected before either replica is
    /// touched.
    pub expected_source_etag: Option<String>,
}

/// Orchestrates every S3 verb over a set of Mirror Bindings. Holds no
/// request-scoped state; safe to share behind an `Arc` across the whole
/// server.
pub struct Pipeline {
    bindings: Arc<MirrorBindings>,
    lock: Arc<DistributedLock>,
    journal: Arc<HealJournal>,
    registry: Arc<MultipartRegistry>,
}

impl Pipeline {
    pub fn new(
        bindings: Arc<MirrorBindings>,
        lock: Arc<DistributedLock>,
        journal: Arc<HealJournal>,
        registry: Arc<MultipartRegistry>,
    ) -> Self {
        Self {
            bindings,
            lock,
            journal,
            registry,
        }
    }

    fn binding(&self, bucket: &str) -> GatewayResult<&MirrorBinding> {
        self.bindings
            .get(bucket)
            .ok_or_else(|| GatewayError::UnknownBucket(bucket.to_string()))
    }

    async fn is_marked_divergent(&self, replica: &Arc<ReplicaClient>, bucket: &str, object: &str) -> bool {
        match self.journal.read_latest(&replica.bucket, bucket, object).await {
            Some(entry) => entry.err_client_id == replica.id,
            None => false,
        }
    }

    /// GetObjectInfo: races `StatObject` across every eligible replica and
    /// returns the first success, with its replica index recorded so a
    /// subsequent body read targets the same replica.
    pub async fn get_object_info(&self, bucket: &str, object: &str, mode: LockMode) -> GatewayResult<ObjectInfo> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(bucket, object, &object_resource(bucket, object), mode, DATA_LOCK_TIMEOUT)
            .await?;
        let result = self.get_object_info_locked(binding, bucket, object).await;
        handle.release().await;
        result
    }

    async fn get_object_info_locked(&self, binding: &MirrorBinding, bucket: &str, object: &str) -> GatewayResult<ObjectInfo> {
        let mut eligible = Vec::new();
        for (i, replica) in binding.replicas.iter().enumerate() {
            if !replica.is_online() {
                continue;
            }
            if self.is_marked_divergent(replica, bucket, object).await {
                continue;
            }
            eligible.push(i);
        }

        let mut attempts: FuturesUnordered<_> = eligible
            .into_iter()
            .map(|i| {
                let replica = binding.replicas[i].clone();
                let object = object.to_string();
                async move { (i, tokio::time::timeout(STAT_TIMEOUT, replica.backend.stat_object(&object)).await) }
            })
            .collect();

        while let Some((i, result)) = attempts.next().await {
            if let Ok(Ok(mut info)) = result {
                info.replica_index = i;
                return Ok(info);
            }
        }
        Err(GatewayError::BackendDown {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    /// GetObjectNInfo: resolves the winning replica via `get_object_info`,
    /// then streams the body from that same replica.
    pub async fn get_object_n_info(
        &self,
        bucket: &str,
        object: &str,
    ) -> GatewayResult<(BoxStream<'static, anyhow::Result<Bytes>>, ObjectInfo)> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &object_resource(bucket, object),
                LockMode::Shared,
                DATA_LOCK_TIMEOUT,
            )
            .await?;

        let info = match self.get_object_info_locked(binding, bucket, object).await {
            Ok(info) => info,
            Err(e) => {
                handle.release().await;
                return Err(e);
            }
        };
        let replica = binding.replicas[info.replica_index].clone();
        let stream_result = replica.backend.get_object(object, None).await;
        handle.release().await;
        match stream_result {
            Ok((stream, _)) => Ok((stream, info)),
            Err(e) => Err(GatewayError::Replica(e)),
        }
    }

    /// PutObject: duplicates the body to every replica, fans out in
    /// parallel, reduces, and journals every replica that didn't win.
    pub async fn put_object<S>(&self, bucket: &str, object: &str, body: S, req: PutObjectRequest) -> GatewayResult<ObjectInfo>
    where
        S: Stream<Item = anyhow::Result<Bytes>> + Send + Unpin + 'static,
    {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &object_resource(bucket, object),
                LockMode::Exclusive,
                DATA_LOCK_TIMEOUT,
            )
            .await?;

        let radio_tag = RadioTag::new();
        let mut user_metadata = req.user_metadata.clone();
        user_metadata.insert(RADIO_TAG_KEY.to_string(), radio_tag.as_str().to_string());

        let opts = PutOptions {
            content_type: req.content_type.clone(),
            user_metadata,
            sse: req.sse.clone(),
            md5_base64: req.md5_base64.clone(),
            sha256_hex: req.sha256_hex.clone(),
        };

        let (_producer, readers) = duplicator::fanout(body, binding.replicas.len());
        let mut tasks = Vec::with_capacity(binding.replicas.len());
        for (reader, replica) in readers.into_iter().zip(binding.replicas.iter().cloned()) {
            let opts = opts.clone();
            let object = object.to_string();
            tasks.push(tokio::spawn(async move {
                let body = duplicator::collect_bytes(reader).await?;
                replica.backend.put_object(&object, body, &opts).await
            }));
        }
        let outcomes = futures::future::join_all(tasks).await;

        let mut infos: Vec<Option<ObjectInfo>> = Vec::with_capacity(outcomes.len());
        let mut errs: Vec<Option<anyhow::Error>> = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(Ok(info)) => {
                    infos.push(Some(info));
                    errs.push(None);
                }
                Ok(Err(e)) => {
                    infos.push(None);
                    errs.push(Some(e));
                }
                Err(e) => {
                    infos.push(None);
                    errs.push(Some(anyhow::anyhow!(e)));
                }
            }
        }

        let result = match reducer::reduce(errs) {
            Reduced::Failure(e) => Err(GatewayError::Replica(e)),
            Reduced::Source(winner_idx) => {
                let winner_info = infos[winner_idx].clone().expect("winner must have succeeded");
                for (i, replica) in binding.replicas.iter().enumerate() {
                    if infos[i].is_some() {
                        continue;
                    }
                    crate::metrics::COUNTERS.record_replica_write_failure();
                    self.journal.submit(JournalEntry {
                        op: JournalOp::PutObject,
                        bucket: bucket.to_string(),
                        object: object.to_string(),
                        dst_bucket: None,
                        dst_object: None,
                        replica_bucket: replica.bucket.clone(),
                        err_client_id: replica.id.clone(),
                        src_client_id: binding.replicas[winner_idx].id.clone(),
                        timestamp_unix_ms: JournalEntry::now_ms(),
                        etag: Some(winner_info.etag.clone()),
                        radio_tag: Some(radio_tag.as_str().to_string()),
                        user_meta: winner_info.user_metadata.clone(),
                        sse: winner_info.sse.clone(),
                    });
                }
                Ok(winner_info)
            }
        };
        handle.release().await;
        result
    }

    /// CopyObject. Source and destination may name different buckets;
    /// `len(src.replicas) == len(dst.replicas)` is required (always true
    /// today since every Mirror Binding has exactly two replicas, but the
    /// check stands per design). Same-resource copies (same bucket, same
    /// key) are metadata updates and need only one lock.
    pub async fn copy_object(
        &self,
        bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        req: CopyObjectRequest,
    ) -> GatewayResult<ObjectInfo> {
        let src_binding = self.binding(bucket)?;
        let dst_binding = self.binding(dst_bucket)?;
        if src_binding.replicas.len() != dst_binding.replicas.len() {
            return Err(GatewayError::Unexpected);
        }

        let src_resource = object_resource(bucket, src_object);
        let dst_resource = object_resource(dst_bucket, dst_object);

        // The source needs a lock too (a locked read, per design) so a
        // concurrent PutObject on it can't race the copy. Both locks are
        // exclusive and, when they name different resources, acquired in a
        // fixed order — the lexicographically smaller resource first — so
        // two concurrent copies that swap source and destination can't
        // deadlock on each other.
        let src_first = src_resource <= dst_resource;
        let first_handle = if src_first {
            self.lock.acquire(bucket, src_object, &src_resource, LockMode::Exclusive, DATA_LOCK_TIMEOUT).await?
        } else {
            self.lock.acquire(dst_bucket, dst_object, &dst_resource, LockMode::Exclusive, DATA_LOCK_TIMEOUT).await?
        };
        let second_handle = if src_resource == dst_resource {
            None
        } else {
            let acquired = if src_first {
                self.lock.acquire(dst_bucket, dst_object, &dst_resource, LockMode::Exclusive, DATA_LOCK_TIMEOUT).await
            } else {
                self.lock.acquire(bucket, src_object, &src_resource, LockMode::Exclusive, DATA_LOCK_TIMEOUT).await
            };
            match acquired {
                Ok(handle) => Some(handle),
                Err(e) => {
                    first_handle.release().await;
                    return Err(e);
                }
            }
        };

        let result = self
            .copy_object_locked(src_binding, dst_binding, bucket, src_object, dst_bucket, dst_object, req)
            .await;

        if let Some(handle) = second_handle {
            handle.release().await;
        }
        first_handle.release().await;
        result
    }

    async fn copy_object_locked(
        &self,
        src_binding: &MirrorBinding,
        dst_binding: &MirrorBinding,
        bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        req: CopyObjectRequest,
    ) -> GatewayResult<ObjectInfo> {
        let src_info = self.get_object_info_locked(src_binding, bucket, src_object).await?;

        if let Some(expected) = &req.expected_source_etag {
            if expected != &src_info.etag {
                return Err(GatewayError::Precondition(format!(
                    "source {bucket}/{src_object} ETag {} does not match expected {expected}",
                    src_info.etag
                )));
            }
        }

        let opts = CopyOptions {
            user_metadata: req.user_metadata,
            sse: req.sse,
            metadata_directive_replace: true,
            copy_source_if_match: Some(src_info.etag.clone()),
        };
        let same_bucket = bucket == dst_bucket;

        let mut tasks = Vec::with_capacity(dst_binding.replicas.len());
        for (src_replica, dst_replica) in src_binding.replicas.iter().cloned().zip(dst_binding.replicas.iter().cloned()) {
            let opts = opts.clone();
            let src_object = src_object.to_string();
            let dst_object = dst_object.to_string();
            tasks.push(tokio::spawn(async move {
                copy_pair(src_replica, dst_replica, &src_object, &dst_object, same_bucket, &opts).await
            }));
        }
        let outcomes = futures::future::join_all(tasks).await;

        let errs: Vec<Option<anyhow::Error>> = outcomes
            .iter()
            .map(|o| match o {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(anyhow::anyhow!(e.to_string())),
                Err(e) => Some(anyhow::anyhow!(e.to_string())),
            })
            .collect();

        let winner_idx = match reducer::reduce(errs) {
            Reduced::Failure(e) => return Err(GatewayError::Replica(e)),
            Reduced::Source(i) => i,
        };

        let dst_info = dst_binding.replicas[winner_idx]
            .backend
            .stat_object(dst_object)
            .await
            .map_err(GatewayError::Replica)?;

        for (i, replica) in dst_binding.replicas.iter().enumerate() {
            if i == winner_idx {
                continue;
            }
            let failed = !matches!(&outcomes[i], Ok(Ok(_)));
            if failed {
                crate::metrics::COUNTERS.record_replica_write_failure();
                self.journal.submit(JournalEntry {
                    op: JournalOp::CopyObject,
                    bucket: bucket.to_string(),
                    object: src_object.to_string(),
                    dst_bucket: Some(dst_bucket.to_string()),
                    dst_object: Some(dst_object.to_string()),
                    replica_bucket: replica.bucket.clone(),
                    err_client_id: replica.id.clone(),
                    src_client_id: dst_binding.replicas[winner_idx].id.clone(),
                    timestamp_unix_ms: JournalEntry::now_ms(),
                    etag: Some(dst_info.etag.clone()),
                    radio_tag: dst_info.radio_tag().map(|t| t.as_str().to_string()),
                    user_meta: dst_info.user_metadata.clone(),
                    sse: dst_info.sse.clone(),
                });
            }
        }
        Ok(dst_info)
    }

    pub async fn delete_object(&self, bucket: &str, object: &str) -> GatewayResult<()> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &object_resource(bucket, object),
                LockMode::Exclusive,
                DATA_LOCK_TIMEOUT,
            )
            .await?;

        let mut tasks = Vec::with_capacity(binding.replicas.len());
        for replica in binding.replicas.iter().cloned() {
            let object = object.to_string();
            tasks.push(tokio::spawn(async move { replica.backend.remove_object(&object).await }));
        }
        let outcomes = futures::future::join_all(tasks).await;
        let errs: Vec<Option<anyhow::Error>> = outcomes
            .iter()
            .map(|o| match o {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(anyhow::anyhow!(e.to_string())),
                Err(e) => Some(anyhow::anyhow!(e.to_string())),
            })
            .collect();

        let result = match reducer::reduce(errs) {
            Reduced::Failure(e) => Err(GatewayError::Replica(e)),
            Reduced::Source(winner_idx) => {
                for (i, replica) in binding.replicas.iter().enumerate() {
                    if i == winner_idx {
                        continue;
                    }
                    if !matches!(&outcomes[i], Ok(Ok(()))) {
                        crate::metrics::COUNTERS.record_replica_write_failure();
                        self.journal.submit(JournalEntry {
                            op: JournalOp::DeleteObject,
                            bucket: bucket.to_string(),
                            object: object.to_string(),
                            dst_bucket: None,
                            dst_object: None,
                            replica_bucket: replica.bucket.clone(),
                            err_client_id: replica.id.clone(),
                            src_client_id: binding.replicas[winner_idx].id.clone(),
                            timestamp_unix_ms: JournalEntry::now_ms(),
                            etag: None,
                            radio_tag: None,
                            user_meta: HashMap::new(),
                            sse: SseMarker(None),
                        });
                    }
                }
                Ok(())
            }
        };
        handle.release().await;
        result
    }

    /// DeleteObjects (batch). A single W lock covers the whole batch; each
    /// replica's own batch delete call runs independently and results are
    /// regrouped per object name for per-key reduction and journaling.
    pub async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> GatewayResult<Vec<(String, Option<String>)>> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(bucket, "", &batch_resource(bucket), LockMode::Exclusive, DATA_LOCK_TIMEOUT)
            .await?;

        let mut tasks = Vec::with_capacity(binding.replicas.len());
        for replica in binding.replicas.iter().cloned() {
            let keys = keys.clone();
            tasks.push(tokio::spawn(async move {
                if !replica.is_online() {
                    return None;
                }
                Some(replica.backend.remove_objects(&keys).await)
            }));
        }
        let mut per_replica: Vec<Option<anyhow::Result<Vec<(String, Option<String>)>>>> = Vec::with_capacity(binding.replicas.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => per_replica.push(outcome),
                Err(e) => per_replica.push(Some(Err(anyhow::anyhow!(e)))),
            }
        }

        let mut outcomes: HashMap<String, Vec<Option<String>>> = keys
            .iter()
            .map(|k| (k.clone(), vec![None; binding.replicas.len()]))
            .collect();

        for (i, result) in per_replica.iter().enumerate() {
            match result {
                None => {
                    for key in &keys {
                        outcomes.get_mut(key).unwrap()[i] = Some("replica offline".to_string());
                    }
                }
                Some(Err(e)) => {
                    for key in &keys {
                        outcomes.get_mut(key).unwrap()[i] = Some(e.to_string());
                    }
                }
                Some(Ok(per_object)) => {
                    for (key, message) in per_object {
                        if let (Some(message), Some(slot)) = (message, outcomes.get_mut(key)) {
                            slot[i] = Some(message.clone());
                        }
                    }
                }
            }
        }

        let mut client_results = Vec::with_capacity(keys.len());
        for key in &keys {
            let per_key = outcomes.remove(key).unwrap();
            match reducer::reduce(per_key.clone()) {
                Reduced::Failure(e) => client_results.push((key.clone(), Some(e))),
                Reduced::Source(winner_idx) => {
                    client_results.push((key.clone(), None));
                    for (i, replica) in binding.replicas.iter().enumerate() {
                        if i != winner_idx && per_key[i].is_some() {
                            crate::metrics::COUNTERS.record_replica_write_failure();
                            self.journal.submit(JournalEntry {
                                op: JournalOp::DeleteObject,
                                bucket: bucket.to_string(),
                                object: key.clone(),
                                dst_bucket: None,
                                dst_object: None,
                                replica_bucket: replica.bucket.clone(),
                                err_client_id: replica.id.clone(),
                                src_client_id: binding.replicas[winner_idx].id.clone(),
                                timestamp_unix_ms: JournalEntry::now_ms(),
                                etag: None,
                                radio_tag: None,
                                user_meta: HashMap::new(),
                                sse: SseMarker(None),
                            });
                        }
                    }
                }
            }
        }

        handle.release().await;
        Ok(client_results)
    }

    /// ListObjectsV2: first replica in index order to succeed wins; errors
    /// from earlier replicas are suppressed unless every replica fails.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> GatewayResult<ObjectListing> {
        let binding = self.binding(bucket)?;
        let mut last_err = None;
        for replica in binding.replicas.iter() {
            match replica.backend.list_objects_v2(prefix, continuation_token, max_keys).await {
                Ok(listing) => return Ok(listing),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(GatewayError::Replica)
            .unwrap_or(GatewayError::BackendDown {
                bucket: bucket.to_string(),
                object: String::new(),
            }))
    }

    pub async fn list_multipart_uploads(&self, bucket: &str, prefix: Option<&str>) -> GatewayResult<MultipartUploadListing> {
        let binding = self.binding(bucket)?;
        let mut last_err = None;
        for replica in binding.replicas.iter() {
            match replica.backend.list_multipart_uploads(prefix).await {
                Ok(listing) => return Ok(listing),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(GatewayError::Replica)
            .unwrap_or(GatewayError::BackendDown {
                bucket: bucket.to_string(),
                object: String::new(),
            }))
    }

    /// NewMultipartUpload: mints a logical upload id, initializes it on
    /// every replica in order, and best-effort aborts on the first failure
    /// rather than leaving a half-registered upload that would desync the
    /// registry invariant.
    pub async fn new_multipart_upload(&self, bucket: &str, object: &str, req: PutObjectRequest) -> GatewayResult<UploadId> {
        let binding = self.binding(bucket)?;
        let upload_id = UploadId::new();
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &multipart_resource(bucket, object, &upload_id),
                LockMode::Exclusive,
                MULTIPART_LOCK_TIMEOUT,
            )
            .await?;

        let radio_tag = RadioTag::new();
        let mut user_metadata = req.user_metadata.clone();
        user_metadata.insert(RADIO_TAG_KEY.to_string(), radio_tag.as_str().to_string());
        let opts = PutOptions {
            content_type: req.content_type.clone(),
            user_metadata,
            sse: req.sse.clone(),
            md5_base64: None,
            sha256_hex: None,
        };

        let mut backend_ids = Vec::with_capacity(binding.replicas.len());
        let mut init_error = None;
        for replica in binding.replicas.iter() {
            match replica.backend.create_multipart_upload(object, &opts).await {
                Ok(id) => backend_ids.push(id),
                Err(e) => {
                    // Earlier successes are intentionally left dangling: the
                    // client never saw an upload id for them, so there is
                    // nothing to complete against. They're cleaned up by
                    // backend lifecycle GC rather than a best-effort abort
                    // race here.
                    init_error = Some(e);
                    break;
                }
            }
        }

        let result = match init_error {
            Some(e) => Err(GatewayError::Replica(e)),
            None => {
                self.registry.insert(upload_id.clone(), backend_ids);
                Ok(upload_id.clone())
            }
        };
        handle.release().await;
        result
    }

    fn backend_upload_ids(&self, bucket: &str, object: &str, upload_id: &UploadId) -> GatewayResult<Vec<String>> {
        self.registry.get(upload_id).ok_or_else(|| GatewayError::InvalidUploadId {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id: upload_id.as_str().to_string(),
        })
    }

    pub async fn put_object_part<S>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &UploadId,
        part_number: u16,
        body: S,
    ) -> GatewayResult<PartInfo>
    where
        S: Stream<Item = anyhow::Result<Bytes>> + Send + Unpin + 'static,
    {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &multipart_resource(bucket, object, upload_id),
                LockMode::Exclusive,
                MULTIPART_LOCK_TIMEOUT,
            )
            .await?;

        let result = async {
            let backend_ids = self.backend_upload_ids(bucket, object, upload_id)?;
            let (_producer, readers) = duplicator::fanout(body, binding.replicas.len());
            let mut tasks = Vec::with_capacity(binding.replicas.len());
            for ((reader, replica), backend_id) in readers
                .into_iter()
                .zip(binding.replicas.iter().cloned())
                .zip(backend_ids.into_iter())
            {
                let object = object.to_string();
                tasks.push(tokio::spawn(async move {
                    let body = duplicator::collect_bytes(reader).await?;
                    replica.backend.upload_part(&object, &backend_id, part_number, body).await
                }));
            }
            let outcomes = futures::future::join_all(tasks).await;
            reduce_parts(outcomes)
        }
        .await;

        handle.release().await;
        result
    }

    pub async fn copy_object_part(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &UploadId,
        part_number: u16,
        src_object: &str,
    ) -> GatewayResult<PartInfo> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &multipart_resource(bucket, object, upload_id),
                LockMode::Exclusive,
                MULTIPART_LOCK_TIMEOUT,
            )
            .await?;

        let result = async {
            let backend_ids = self.backend_upload_ids(bucket, object, upload_id)?;
            let mut tasks = Vec::with_capacity(binding.replicas.len());
            for (replica, backend_id) in binding.replicas.iter().cloned().zip(backend_ids.into_iter()) {
                let object = object.to_string();
                let src_object = src_object.to_string();
                tasks.push(tokio::spawn(async move {
                    replica
                        .backend
                        .copy_object_part(&object, &backend_id, part_number, &src_object, None)
                        .await
                }));
            }
            let outcomes = futures::future::join_all(tasks).await;
            reduce_parts(outcomes)
        }
        .await;

        handle.release().await;
        result
    }

    /// AbortMultipartUpload: peers are released serially rather than in
    /// parallel; the first error stops the walk and is returned, leaving
    /// the registry entry in place so the caller can retry abort.
    pub async fn abort_multipart_upload(&self, bucket: &str, object: &str, upload_id: &UploadId) -> GatewayResult<()> {
        let binding = self.binding(bucket)?;
        let handle = self
            .lock
            .acquire(
                bucket,
                object,
                &multipart_resource(bucket, object, upload_id),
                LockMode::Exclusive,
                MULTIPART_LOCK_TIMEOUT,
            )
            .await?;

        let result = async {
            let backend_ids = self.backend_upload_ids(bucket, object, upload_id)?;
            for (replica, backend_id) in binding.replicas.iter().zip(backend_ids.iter()) {
                replica
                    .backend
                    .abort_multipart_upload(object, backend_id)
                    .await
                    .map_err(GatewayError::Replica)?;
            }
            self.registry.remove(upload_id);
            Ok(())
        }
        .await;

        handle.release().await;
        result
    }

    /// CompleteMultipartUpload: R-locks the upload id while W-locking the
    /// object, so concurrent part uploads up to this call are fine but two
    /// completes can't race. The registry entry is dropped regardless of
    /// which replicas succeeded; failed replicas get a PutObject journal
    /// entry so replay streams the assembled object in.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &UploadId,
        parts: Vec<PartInfo>,
    ) -> GatewayResult<ObjectInfo> {
        let binding = self.binding(bucket)?;
        let upload_handle = self
            .lock
            .acquire(
                bucket,
                object,
                &multipart_resource(bucket, object, upload_id),
                LockMode::Shared,
                MULTIPART_LOCK_TIMEOUT,
            )
            .await?;
        let object_handle = self
            .lock
            .acquire(
                bucket,
                object,
                &object_resource(bucket, object),
                LockMode::Exclusive,
                DATA_LOCK_TIMEOUT,
            )
            .await?;

        let result = self.complete_multipart_upload_locked(binding, bucket, object, upload_id, parts).await;

        object_handle.release().await;
        upload_handle.release().await;
        result
    }

    async fn complete_multipart_upload_locked(
        &self,
        binding: &MirrorBinding,
        bucket: &str,
        object: &str,
        upload_id: &UploadId,
        parts: Vec<PartInfo>,
    ) -> GatewayResult<ObjectInfo> {
        let backend_ids = self.backend_upload_ids(bucket, object, upload_id)?;
        self.registry.remove(upload_id);

        let mut outcomes = Vec::with_capacity(binding.replicas.len());
        for (replica, backend_id) in binding.replicas.iter().zip(backend_ids.iter()) {
            outcomes.push(replica.backend.complete_multipart_upload(object, backend_id, &parts).await);
        }

        let errs: Vec<Option<anyhow::Error>> = outcomes
            .iter()
            .map(|o| o.as_ref().err().map(|e| anyhow::anyhow!(e.to_string())))
            .collect();

        let winner_idx = match reducer::reduce(errs) {
            Reduced::Failure(e) => return Err(GatewayError::Replica(e)),
            Reduced::Source(i) => i,
        };
        let winner_info = outcomes[winner_idx].as_ref().expect("winner must have succeeded").clone();

        for (i, replica) in binding.replicas.iter().enumerate() {
            if i == winner_idx || outcomes[i].is_ok() {
                continue;
            }
            crate::metrics::COUNTERS.record_replica_write_failure();
            self.journal.submit(JournalEntry {
                op: JournalOp::PutObject,
                bucket: bucket.to_string(),
                object: object.to_string(),
                dst_bucket: None,
                dst_object: None,
                replica_bucket: replica.bucket.clone(),
                err_client_id: replica.id.clone(),
                src_client_id: binding.replicas[winner_idx].id.clone(),
                timestamp_unix_ms: JournalEntry::now_ms(),
                etag: Some(winner_info.etag.clone()),
                radio_tag: winner_info.radio_tag().map(|t| t.as_str().to_string()),
                user_meta: winner_info.user_metadata.clone(),
                sse: winner_info.sse.clone(),
            });
        }
        Ok(winner_info)
    }
}

/// Runs one replica pair's half of a CopyObject fan-out. `ReplicaBackend::
/// copy_object` only ever copies within its own client/bucket, so a
/// cross-bucket pair can't use it directly: the source replica's bytes are
/// read out and streamed into the destination replica with an explicit
/// PutObject instead. Same-bucket pairs (including same-replica pairs,
/// which is the common case) still use the backend's native copy.
async fn copy_pair(
    src_replica: Arc<ReplicaClient>,
    dst_replica: Arc<ReplicaClient>,
    src_object: &str,
    dst_object: &str,
    same_bucket: bool,
    opts: &CopyOptions,
) -> anyhow::Result<ObjectInfo> {
    if same_bucket {
        return dst_replica.backend.copy_object(src_object, dst_object, opts).await;
    }

    let (mut stream, src_info) = src_replica.backend.get_object(src_object, None).await?;
    let mut body = Vec::with_capacity(src_info.size as usize);
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    let put_opts = PutOptions {
        content_type: src_info.content_type.clone(),
        user_metadata: opts.user_metadata.clone(),
        sse: opts.sse.clone(),
        md5_base64: None,
        sha256_hex: None,
    };
    dst_replica.backend.put_object(dst_object, Bytes::from(body), &put_opts).await
}

fn reduce_parts(outcomes: Vec<Result<anyhow::Result<PartInfo>, tokio::task::JoinError>>) -> GatewayResult<PartInfo> {
    let mut infos: Vec<Option<PartInfo>> = Vec::with_capacity(outcomes.len());
    let mut errs: Vec<Option<anyhow::Error>> = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(Ok(info)) => {
                infos.push(Some(info));
                errs.push(None);
            }
            Ok(Err(e)) => {
                infos.push(None);
                errs.push(Some(e));
            }
            Err(e) => {
                infos.push(None);
                errs.push(Some(anyhow::anyhow!(e)));
            }
        }
    }
    match reducer::reduce(errs) {
        Reduced::Failure(e) => Err(GatewayError::Replica(e)),
        Reduced::Source(i) => Ok(infos[i].clone().expect("winner must have succeeded")),
    }
}
