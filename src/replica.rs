//! Replica Client & the S3 capability surface it wraps.
//!
//! `ReplicaBackend` is the interface the design assumes from the backend S3
//! client library (BucketExists, StatObject, PutObject, ...). `S3Backend` is
//! the production implementation on top of `aws-sdk-s3`; tests substitute an
//! in-memory mock living under `tests/common`.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::config::RemoteConfig;
use crate::ids::ReplicaId;
use crate::types::{
    ListedObject, MultipartUploadListing, MultipartUploadSummary, ObjectInfo, ObjectListing, PartInfo, SseMarker,
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const STARTUP_PROBE_MAX_ATTEMPTS: u32 = 3;

/// A replica's connection tuple. Two replicas constructed from identical
/// tuples share a `ReplicaId`.
#[derive(Debug, Clone)]
pub struct Replica {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl Replica {
    pub fn id(&self) -> ReplicaId {
        ReplicaId::from_connection_tuple(
            &self.endpoint,
            &self.bucket,
            &self.access_key,
            &self.secret_key,
            self.session_token.as_deref(),
        )
    }
}

impl From<&RemoteConfig> for Replica {
    fn from(remote: &RemoteConfig) -> Self {
        Replica {
            endpoint: remote.endpoint.clone(),
            bucket: remote.bucket.clone(),
            access_key: remote.access_key.clone(),
            secret_key: remote.secret_key.clone(),
            session_token: remote.session_token.clone(),
        }
    }
}

/// Parameters for a `put_object`/`complete_multipart_upload` call, bundled
/// so fan-out sites don't repeat a long argument list.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub sse: SseMarker,
    pub md5_base64: Option<String>,
    pub sha256_hex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub user_metadata: HashMap<String, String>,
    pub sse: SseMarker,
    pub metadata_directive_replace: bool,
    pub copy_source_if_match: Option<String>,
}

/// The S3 capability surface the pipeline assumes, per the design's
/// external interfaces section. Every call takes no explicit cancellation
/// argument here; callers race it against `tokio::time::timeout` or a
/// `CancellationToken`-aware future at the call site.
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    async fn bucket_exists(&self) -> anyhow::Result<bool>;

    async fn list_objects_v2(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> anyhow::Result<ObjectListing>;

    async fn stat_object(&self, key: &str) -> anyhow::Result<ObjectInfo>;

    async fn get_object(
        &self,
        key: &str,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<(BoxStream<'static, anyhow::Result<Bytes>>, ObjectInfo)>;

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        opts: &PutOptions,
    ) -> anyhow::Result<ObjectInfo>;

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> anyhow::Result<ObjectInfo>;

    async fn remove_object(&self, key: &str) -> anyhow::Result<()>;

    async fn remove_objects(&self, keys: &[String]) -> anyhow::Result<Vec<(String, Option<String>)>>;

    async fn create_multipart_upload(
        &self,
        key: &str,
        opts: &PutOptions,
    ) -> anyhow::Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        backend_upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> anyhow::Result<PartInfo>;

    async fn copy_object_part(
        &self,
        key: &str,
        backend_upload_id: &str,
        part_number: u16,
        src_key: &str,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<PartInfo>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        backend_upload_id: &str,
        parts: &[PartInfo],
    ) -> anyhow::Result<ObjectInfo>;

    async fn abort_multipart_upload(&self, key: &str, backend_upload_id: &str) -> anyhow::Result<()>;

    async fn list_multipart_uploads(&self, prefix: Option<&str>) -> anyhow::Result<MultipartUploadListing>;
}

/// Production `ReplicaBackend` on top of the official AWS SDK, pointed at
/// whatever S3-compatible endpoint the replica's connection tuple names.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub fn new(replica: &Replica) -> Self {
        let credentials = Credentials::new(
            replica.access_key.clone(),
            replica.secret_key.clone(),
            replica.session_token.clone(),
            None,
            "radio-replica",
        );
        let timeout_config = TimeoutConfig::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .read_timeout(RESPONSE_HEADER_TIMEOUT)
            .build();
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(credentials)
            .endpoint_url(&replica.endpoint)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .timeout_config(timeout_config)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: replica.bucket.clone(),
        }
    }

    fn object_info_from_head(
        content_length: i64,
        etag: Option<String>,
        content_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> ObjectInfo {
        ObjectInfo {
            size: content_length.max(0) as u64,
            etag: etag.unwrap_or_default().trim_matches('"').to_string(),
            content_type,
            user_metadata: metadata.unwrap_or_default(),
            sse: SseMarker(None),
            replica_index: 0,
        }
    }
}

#[async_trait]
impl ReplicaBackend for S3Backend {
    async fn bucket_exists(&self) -> anyhow::Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(aws_sdk_s3::error::SdkError::ServiceError(err)) => {
                if err.err().is_not_found() {
                    Ok(false)
                } else {
                    Err(err.into_err().into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects_v2(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: i32,
    ) -> anyhow::Result<ObjectListing> {
        let mut req = self.client.list_objects_v2().bucket(&self.bucket).max_keys(max_keys);
        if let Some(prefix) = prefix {
            req = req.prefix(prefix);
        }
        if let Some(token) = continuation_token {
            req = req.continuation_token(token);
        }
        let out = req.send().await?;
        let objects = out
            .contents()
            .iter()
            .map(|o| ListedObject {
                key: o.key().unwrap_or_default().to_string(),
                size: o.size().unwrap_or(0).max(0) as u64,
                etag: o.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                last_modified: o.last_modified().map(|t| t.to_string()),
            })
            .collect();
        Ok(ObjectListing {
            objects,
            next_continuation_token: out.next_continuation_token().map(str::to_string),
            is_truncated: out.is_truncated().unwrap_or(false),
        })
    }

    async fn stat_object(&self, key: &str) -> anyhow::Result<ObjectInfo> {
        let out = self.client.head_object().bucket(&self.bucket).key(key).send().await?;
        Ok(Self::object_info_from_head(
            out.content_length().unwrap_or(0),
            out.e_tag().map(str::to_string),
            out.content_type().map(str::to_string),
            out.metadata().cloned(),
        ))
    }

    async fn get_object(
        &self,
        key: &str,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<(BoxStream<'static, anyhow::Result<Bytes>>, ObjectInfo)> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = &range {
            req = req.range(format!("bytes={}-{}", range.start, range.end.saturating_sub(1)));
        }
        let out = req.send().await?;
        let info = Self::object_info_from_head(
            out.content_length().unwrap_or(0),
            out.e_tag().map(str::to_string),
            out.content_type().map(str::to_string),
            out.metadata().cloned(),
        );
        use futures::StreamExt;
        let stream = tokio_util::io::ReaderStream::new(out.body.into_async_read())
            .map(|chunk| chunk.map_err(anyhow::Error::from));
        Ok((Box::pin(stream), info))
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        opts: &PutOptions,
    ) -> anyhow::Result<ObjectInfo> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.clone()))
            .set_content_type(opts.content_type.clone())
            .set_content_md5(opts.md5_base64.clone());
        for (k, v) in &opts.user_metadata {
            req = req.metadata(k, v);
        }
        if let Some(sse) = &opts.sse.0 {
            req = req.server_side_encryption(sse.as_str().into());
        }
        let out = req.send().await?;
        Ok(ObjectInfo {
            size: body.len() as u64,
            etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            content_type: opts.content_type.clone(),
            user_metadata: opts.user_metadata.clone(),
            sse: opts.sse.clone(),
            replica_index: 0,
        })
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        opts: &CopyOptions,
    ) -> anyhow::Result<ObjectInfo> {
        let copy_source = format!("{}/{}", self.bucket, src_key);
        let mut req = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(dst_key)
            .copy_source(&copy_source);
        if opts.metadata_directive_replace {
            req = req.metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace);
            for (k, v) in &opts.user_metadata {
                req = req.metadata(k, v);
            }
        }
        if let Some(etag) = &opts.copy_source_if_match {
            req = req.copy_source_if_match(etag);
        }
        if let Some(sse) = &opts.sse.0 {
            req = req.server_side_encryption(sse.as_str().into());
        }
        let out = req.send().await?;
        let etag = out
            .copy_object_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        Ok(ObjectInfo {
            size: 0,
            etag,
            content_type: None,
            user_metadata: opts.user_metadata.clone(),
            sse: opts.sse.clone(),
            replica_index: 0,
        })
    }

    async fn remove_object(&self, key: &str) -> anyhow::Result<()> {
        self.client.delete_object().bucket(&self.bucket).key(key).send().await?;
        Ok(())
    }

    async fn remove_objects(&self, keys: &[String]) -> anyhow::Result<Vec<(String, Option<String>)>> {
        use aws_sdk_s3::types::{Delete, ObjectIdentifier};
        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(1000) {
            let ids: Result<Vec<_>, _> = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect();
            let ids = ids?;
            let out = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(Delete::builder().set_objects(Some(ids)).build()?)
                .send()
                .await?;
            for deleted in out.deleted() {
                if let Some(key) = deleted.key() {
                    results.push((key.to_string(), None));
                }
            }
            for err in out.errors() {
                results.push((
                    err.key().unwrap_or_default().to_string(),
                    Some(err.message().unwrap_or("unknown error").to_string()),
                ));
            }
        }
        Ok(results)
    }

    async fn create_multipart_upload(&self, key: &str, opts: &PutOptions) -> anyhow::Result<String> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(opts.content_type.clone());
        for (k, v) in &opts.user_metadata {
            req = req.metadata(k, v);
        }
        if let Some(sse) = &opts.sse.0 {
            req = req.server_side_encryption(sse.as_str().into());
        }
        let out = req.send().await?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("CreateMultipartUpload response missing upload id"))
    }

    async fn upload_part(
        &self,
        key: &str,
        backend_upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> anyhow::Result<PartInfo> {
        let size = body.len() as u64;
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(backend_upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await?;
        Ok(PartInfo {
            part_number,
            etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            size,
        })
    }

    async fn copy_object_part(
        &self,
        key: &str,
        backend_upload_id: &str,
        part_number: u16,
        src_key: &str,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<PartInfo> {
        let copy_source = format!("{}/{}", self.bucket, src_key);
        let mut req = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(backend_upload_id)
            .part_number(part_number as i32)
            .copy_source(&copy_source);
        if let Some(range) = &range {
            req = req.copy_source_range(format!("bytes={}-{}", range.start, range.end.saturating_sub(1)));
        }
        let out = req.send().await?;
        let etag = out
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        Ok(PartInfo {
            part_number,
            etag,
            size: 0,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        backend_upload_id: &str,
        parts: &[PartInfo],
    ) -> anyhow::Result<ObjectInfo> {
        let completed_parts: Vec<_> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(backend_upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await?;
        Ok(ObjectInfo {
            size: 0,
            etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            content_type: None,
            user_metadata: HashMap::new(),
            sse: SseMarker(None),
            replica_index: 0,
        })
    }

    async fn abort_multipart_upload(&self, key: &str, backend_upload_id: &str) -> anyhow::Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(backend_upload_id)
            .send()
            .await?;
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: Option<&str>) -> anyhow::Result<MultipartUploadListing> {
        let mut req = self.client.list_multipart_uploads().bucket(&self.bucket);
        if let Some(prefix) = prefix {
            req = req.prefix(prefix);
        }
        let out = req.send().await?;
        let uploads = out
            .uploads()
            .iter()
            .map(|u| MultipartUploadSummary {
                key: u.key().unwrap_or_default().to_string(),
                upload_id: u.upload_id().unwrap_or_default().to_string(),
            })
            .collect();
        Ok(MultipartUploadListing {
            uploads,
            is_truncated: out.is_truncated().unwrap_or(false),
        })
    }
}

/// Runtime object owning one authenticated S3 client, the remote bucket
/// name, the replica id, and the atomic online flag the Health Prober
/// drives.
pub struct ReplicaClient {
    pub id: ReplicaId,
    pub bucket: String,
    pub backend: Box<dyn ReplicaBackend>,
    online: AtomicU32,
}

impl ReplicaClient {
    pub fn new(replica: &Replica, backend: Box<dyn ReplicaBackend>) -> Self {
        Self {
            id: replica.id(),
            bucket: replica.bucket.clone(),
            backend,
            online: AtomicU32::new(0),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed) == 1
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online as u32, Ordering::Relaxed);
    }

    /// Startup probe: `BucketExists` with a 1/s retry on
    /// `XMinioServerNotInitialized`, tolerating at most
    /// `STARTUP_PROBE_MAX_ATTEMPTS` attempts before giving up.
    pub async fn wait_until_ready(&self) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.bucket_exists().await {
                Ok(true) => {
                    self.set_online(true);
                    return Ok(());
                }
                Ok(false) => {
                    return Err(anyhow::anyhow!(
                        "replica {} does not have bucket {}",
                        self.id,
                        self.bucket
                    ))
                }
                Err(e) => {
                    let retryable = e.to_string().contains("XMinioServerNotInitialized");
                    if retryable && attempt < STARTUP_PROBE_MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    if attempt >= STARTUP_PROBE_MAX_ATTEMPTS {
                        return Err(e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// In-memory `ReplicaBackend` used by unit and integration tests, and by
/// anything built with the `testing` feature. Kept behind a feature rather
/// than `#[cfg(test)]` so it is visible both to inline unit tests and to the
/// integration tests under `tests/`.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct State {
        bucket_exists: Option<anyhow::Result<bool>>,
        objects: HashMap<String, (Bytes, ObjectInfo)>,
        fail_put: bool,
        fail_copy: bool,
        fail_delete: bool,
        fail_complete: bool,
        uploads: HashMap<String, Vec<PartInfo>>,
        upload_keys: HashMap<String, String>,
        next_upload_id: u64,
    }

    impl std::fmt::Debug for State {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("State").finish_non_exhaustive()
        }
    }

    /// A controllable mock: clone the handle to flip failure modes from a
    /// test while the backend itself is owned by a `ReplicaClient`.
    #[derive(Clone)]
    pub struct MockControl(std::sync::Arc<Mutex<State>>);

    pub struct MockBackend {
        state: std::sync::Arc<Mutex<State>>,
    }

    pub fn mock_backend() -> (MockBackend, MockControl) {
        let state = std::sync::Arc::new(Mutex::new(State {
            bucket_exists: Some(Ok(true)),
            ..Default::default()
        }));
        (
            MockBackend { state: state.clone() },
            MockControl(state),
        )
    }

    impl MockControl {
        pub fn set_bucket_exists_result(&self, result: anyhow::Result<bool>) {
            self.0.lock().unwrap().bucket_exists = Some(result);
        }

        pub fn set_fail_put(&self, fail: bool) {
            self.0.lock().unwrap().fail_put = fail;
        }

        pub fn set_fail_copy(&self, fail: bool) {
            self.0.lock().unwrap().fail_copy = fail;
        }

        pub fn set_fail_delete(&self, fail: bool) {
            self.0.lock().unwrap().fail_delete = fail;
        }

        pub fn set_fail_complete(&self, fail: bool) {
            self.0.lock().unwrap().fail_complete = fail;
        }

        pub fn seed_object(&self, key: &str, body: Bytes, info: ObjectInfo) {
            self.0.lock().unwrap().objects.insert(key.to_string(), (body, info));
        }

        pub fn get_object_sync(&self, key: &str) -> Option<(Bytes, ObjectInfo)> {
            self.0.lock().unwrap().objects.get(key).cloned()
        }

        pub fn has_object(&self, key: &str) -> bool {
            self.0.lock().unwrap().objects.contains_key(key)
        }
    }

    #[async_trait]
    impl ReplicaBackend for MockBackend {
        async fn bucket_exists(&self) -> anyhow::Result<bool> {
            let mut state = self.state.lock().unwrap();
            match state.bucket_exists.take() {
                Some(Ok(v)) => {
                    state.bucket_exists = Some(Ok(v));
                    Ok(v)
                }
                Some(Err(e)) => Err(e),
                None => Ok(true),
            }
        }

        async fn list_objects_v2(
            &self,
            prefix: Option<&str>,
            _continuation_token: Option<&str>,
            _max_keys: i32,
        ) -> anyhow::Result<ObjectListing> {
            let state = self.state.lock().unwrap();
            let objects = state
                .objects
                .iter()
                .filter(|(k, _)| prefix.map(|p| k.starts_with(p)).unwrap_or(true))
                .map(|(k, (body, info))| ListedObject {
                    key: k.clone(),
                    size: body.len() as u64,
                    etag: info.etag.clone(),
                    last_modified: None,
                })
                .collect();
            Ok(ObjectListing {
                objects,
                next_continuation_token: None,
                is_truncated: false,
            })
        }

        async fn stat_object(&self, key: &str) -> anyhow::Result<ObjectInfo> {
            self.state
                .lock()
                .unwrap()
                .objects
                .get(key)
                .map(|(_, info)| info.clone())
                .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {key}"))
        }

        async fn get_object(
            &self,
            key: &str,
            _range: Option<Range<u64>>,
        ) -> anyhow::Result<(BoxStream<'static, anyhow::Result<Bytes>>, ObjectInfo)> {
            let (body, info) = self
                .state
                .lock()
                .unwrap()
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {key}"))?;
            let stream = futures::stream::once(async move { Ok(body) });
            Ok((Box::pin(stream), info))
        }

        async fn put_object(
            &self,
            key: &str,
            body: Bytes,
            opts: &PutOptions,
        ) -> anyhow::Result<ObjectInfo> {
            let mut state = self.state.lock().unwrap();
            if state.fail_put {
                anyhow::bail!("mock put_object failure");
            }
            let etag = format!("{:x}", md5_like(&body));
            let info = ObjectInfo {
                size: body.len() as u64,
                etag,
                content_type: opts.content_type.clone(),
                user_metadata: opts.user_metadata.clone(),
                sse: opts.sse.clone(),
                replica_index: 0,
            };
            state.objects.insert(key.to_string(), (body, info.clone()));
            Ok(info)
        }

        async fn copy_object(
            &self,
            src_key: &str,
            dst_key: &str,
            opts: &CopyOptions,
        ) -> anyhow::Result<ObjectInfo> {
            let mut state = self.state.lock().unwrap();
            if state.fail_copy {
                anyhow::bail!("mock copy_object failure");
            }
            let (body, mut info) = state
                .objects
                .get(src_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {src_key}"))?;
            if let Some(expected) = &opts.copy_source_if_match {
                if &info.etag != expected {
                    anyhow::bail!("PreconditionFailed: ETag mismatch");
                }
            }
            if opts.metadata_directive_replace {
                info.user_metadata = opts.user_metadata.clone();
            }
            state.objects.insert(dst_key.to_string(), (body, info.clone()));
            Ok(info)
        }

        async fn remove_object(&self, key: &str) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_delete {
                anyhow::bail!("mock remove_object failure");
            }
            state.objects.remove(key);
            Ok(())
        }

        async fn remove_objects(&self, keys: &[String]) -> anyhow::Result<Vec<(String, Option<String>)>> {
            let mut state = self.state.lock().unwrap();
            let mut results = Vec::new();
            for key in keys {
                if state.fail_delete {
                    results.push((key.clone(), Some("mock remove_objects failure".to_string())));
                } else {
                    state.objects.remove(key);
                    results.push((key.clone(), None));
                }
            }
            Ok(results)
        }

        async fn create_multipart_upload(&self, key: &str, _opts: &PutOptions) -> anyhow::Result<String> {
            let mut state = self.state.lock().unwrap();
            state.next_upload_id += 1;
            let id = format!("mock-upload-{}", state.next_upload_id);
            state.uploads.insert(id.clone(), Vec::new());
            state.upload_keys.insert(id.clone(), key.to_string());
            Ok(id)
        }

        async fn upload_part(
            &self,
            _key: &str,
            backend_upload_id: &str,
            part_number: u16,
            body: Bytes,
        ) -> anyhow::Result<PartInfo> {
            let mut state = self.state.lock().unwrap();
            let etag = format!("{:x}", md5_like(&body));
            let part = PartInfo {
                part_number,
                etag,
                size: body.len() as u64,
            };
            state
                .uploads
                .get_mut(backend_upload_id)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {backend_upload_id}"))?
                .push(part.clone());
            Ok(part)
        }

        async fn copy_object_part(
            &self,
            _key: &str,
            backend_upload_id: &str,
            part_number: u16,
            src_key: &str,
            _range: Option<Range<u64>>,
        ) -> anyhow::Result<PartInfo> {
            let mut state = self.state.lock().unwrap();
            let (body, _) = state
                .objects
                .get(src_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("NoSuchKey: {src_key}"))?;
            let part = PartInfo {
                part_number,
                etag: format!("{:x}", md5_like(&body)),
                size: body.len() as u64,
            };
            state
                .uploads
                .get_mut(backend_upload_id)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {backend_upload_id}"))?
                .push(part.clone());
            Ok(part)
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            backend_upload_id: &str,
            parts: &[PartInfo],
        ) -> anyhow::Result<ObjectInfo> {
            let mut state = self.state.lock().unwrap();
            if state.fail_complete {
                anyhow::bail!("mock complete_multipart_upload failure");
            }
            state
                .uploads
                .remove(backend_upload_id)
                .ok_or_else(|| anyhow::anyhow!("NoSuchUpload: {backend_upload_id}"))?;
            state.upload_keys.remove(backend_upload_id);
            let size: u64 = parts.iter().map(|p| p.size).sum();
            let etag = format!("{:x}-{}", md5_like(key.as_bytes()), parts.len());
            let info = ObjectInfo {
                size,
                etag,
                content_type: None,
                user_metadata: HashMap::new(),
                sse: SseMarker(None),
                replica_index: 0,
            };
            state.objects.insert(key.to_string(), (Bytes::new(), info.clone()));
            Ok(info)
        }

        async fn abort_multipart_upload(&self, _key: &str, backend_upload_id: &str) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.uploads.remove(backend_upload_id);
            state.upload_keys.remove(backend_upload_id);
            Ok(())
        }

        async fn list_multipart_uploads(&self, prefix: Option<&str>) -> anyhow::Result<MultipartUploadListing> {
            let state = self.state.lock().unwrap();
            let uploads = state
                .upload_keys
                .iter()
                .filter(|(_, key)| prefix.map(|p| key.starts_with(p)).unwrap_or(true))
                .map(|(upload_id, key)| MultipartUploadSummary {
                    key: key.clone(),
                    upload_id: upload_id.clone(),
                })
                .collect();
            Ok(MultipartUploadListing {
                uploads,
                is_truncated: false,
            })
        }
    }

    fn md5_like(data: &[u8]) -> u128 {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        u128::from_be_bytes(bytes)
    }

    pub fn mock_replica_client(name: &str, online: bool) -> (std::sync::Arc<ReplicaClient>, MockControl) {
        let (backend, control) = mock_backend();
        let replica = Replica {
            endpoint: format!("http://{name}.example.com"),
            bucket: name.to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            session_token: None,
        };
        let client = ReplicaClient::new(&replica, Box::new(backend));
        client.set_online(online);
        (std::sync::Arc::new(client), control)
    }
}
