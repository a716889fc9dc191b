//! End-to-end scenarios over the Mirrored Object Pipeline, backed by the
//! in-memory `ReplicaBackend` mock so no network or real S3-compatible
//! server is needed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use radio::bucket::{MirrorBinding, MirrorBindings};
use radio::journal::HealJournal;
use radio::lock::testing::{multi_node_lock, single_node_lock};
use radio::multipart::MultipartRegistry;
use radio::pipeline::{CopyObjectRequest, Pipeline, PutObjectRequest};
use radio::replica::testing::mock_replica_client;
use radio::types::PartInfo;
use tokio_util::sync::CancellationToken;

fn body_stream(bytes: Vec<u8>) -> impl futures::Stream<Item = anyhow::Result<Bytes>> + Send + Unpin + 'static {
    stream::iter(vec![Ok(Bytes::from(bytes))])
}

struct Harness {
    pipeline: Pipeline,
    bindings: Arc<MirrorBindings>,
    journal: Arc<HealJournal>,
    ctl0: radio::replica::testing::MockControl,
    ctl1: radio::replica::testing::MockControl,
}

fn make_pipeline(bucket: &str) -> Harness {
    let (r0, ctl0) = mock_replica_client("r0", true);
    let (r1, ctl1) = mock_replica_client("r1", true);
    let mut map = HashMap::new();
    map.insert(
        bucket.to_string(),
        MirrorBinding {
            name: bucket.to_string(),
            replicas: [r0, r1],
        },
    );
    let bindings = Arc::new(MirrorBindings::from_map_for_tests(map));
    let lock = single_node_lock();
    let journal_dir = tempdir::TempDir::new("radio-pipeline-test").unwrap();
    let journal = HealJournal::spawn(journal_dir.path().to_path_buf(), CancellationToken::new());
    let registry = Arc::new(MultipartRegistry::new());
    let pipeline = Pipeline::new(Arc::clone(&bindings), lock, Arc::clone(&journal), registry);
    Harness {
        pipeline,
        bindings,
        journal,
        ctl0,
        ctl1,
    }
}

#[tokio::test]
async fn happy_put_then_get() {
    let h = make_pipeline("b");
    let body = vec![0x41u8; 1024];

    let info = h
        .pipeline
        .put_object("b", "k", body_stream(body.clone()), PutObjectRequest::default())
        .await
        .unwrap();

    assert_eq!(info.size, 1024);
    let tag = info.radio_tag().expect("radio-tag must be set").as_str().to_string();
    assert!(uuid::Uuid::parse_str(&tag).is_ok());

    let (r0_body, r0_info) = h.ctl0.get_object_sync("k").unwrap();
    let (r1_body, r1_info) = h.ctl1.get_object_sync("k").unwrap();
    assert_eq!(r0_body, Bytes::from(body.clone()));
    assert_eq!(r1_body, Bytes::from(body));
    assert_eq!(r0_info.user_metadata.get("radio-tag"), r1_info.user_metadata.get("radio-tag"));

    let (mut stream, fetched) = h.pipeline.get_object_n_info("b", "k").await.unwrap();
    assert_eq!(fetched.size, 1024);
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, vec![0x41u8; 1024]);
}

#[tokio::test]
async fn one_replica_down_on_put_is_journaled_and_replays() {
    let h = make_pipeline("b");
    h.ctl1.set_fail_put(true);

    let info = h
        .pipeline
        .put_object("b", "k2", body_stream(vec![0x42; 10]), PutObjectRequest::default())
        .await
        .unwrap();
    assert_eq!(info.size, 10);
    assert!(h.ctl0.has_object("k2"));
    assert!(!h.ctl1.has_object("k2"));

    let r1_id = h.bindings.get("b").unwrap().replicas[1].id.clone();
    let entry = h.journal.read_latest("r1", "b", "k2").await.expect("journal entry must exist before ack");
    assert_eq!(entry.err_client_id, r1_id);

    // GET must skip the replica known to be divergent for this object.
    let fetched = h.pipeline.get_object_info("b", "k2", radio::lock::LockMode::Shared).await.unwrap();
    assert_eq!(fetched.replica_index, 0);

    h.ctl1.set_fail_put(false);
    radio::journal::replay_now(&h.journal, &h.bindings).await;
    assert!(h.ctl1.has_object("k2"));
    assert!(h.journal.read_latest("r1", "b", "k2").await.is_none());
}

#[tokio::test]
async fn copy_same_key_metadata_update_touches_both_replicas() {
    let h = make_pipeline("b");
    h.pipeline
        .put_object("b", "k", body_stream(vec![1, 2, 3]), PutObjectRequest::default())
        .await
        .unwrap();

    let mut new_meta = HashMap::new();
    new_meta.insert("x-tag".to_string(), "updated".to_string());
    let req = CopyObjectRequest {
        user_metadata: new_meta,
        ..Default::default()
    };
    let info = h.pipeline.copy_object("b", "k", "b", "k", req).await.unwrap();
    assert_eq!(info.user_metadata.get("x-tag"), Some(&"updated".to_string()));

    let (_, r0_info) = h.ctl0.get_object_sync("k").unwrap();
    let (_, r1_info) = h.ctl1.get_object_sync("k").unwrap();
    assert_eq!(r0_info.user_metadata.get("x-tag"), Some(&"updated".to_string()));
    assert_eq!(r1_info.user_metadata.get("x-tag"), Some(&"updated".to_string()));
}

#[tokio::test]
async fn copy_source_if_match_rejects_a_diverged_replica() {
    let h = make_pipeline("b");
    h.pipeline
        .put_object("b", "k", body_stream(vec![1, 2, 3]), PutObjectRequest::default())
        .await
        .unwrap();

    // r1 silently diverged: its stored ETag no longer matches what r0 (and
    // the gateway's own source read) believes the object's ETag to be. The
    // forced `copy-source-if-match` must reject the copy on r1 specifically,
    // while r0 still succeeds and becomes the source of truth.
    let (body1, mut info1) = h.ctl1.get_object_sync("k").unwrap();
    info1.etag = "stale-etag".to_string();
    h.ctl1.seed_object("k", body1, info1);

    let dst_info = h.pipeline.copy_object("b", "k", "b", "k2", CopyObjectRequest::default()).await.unwrap();
    assert!(h.ctl0.has_object("k2"));
    assert!(!h.ctl1.has_object("k2"));

    let r1_id = h.bindings.get("b").unwrap().replicas[1].id.clone();
    let entry = h.journal.read_latest("r1", "b", "k2").await.expect("diverged replica must be journaled");
    assert_eq!(entry.err_client_id, r1_id);
    assert_eq!(entry.etag, Some(dst_info.etag));
}

#[tokio::test]
async fn copy_with_mismatched_caller_supplied_etag_mutates_neither_replica() {
    let h = make_pipeline("b");
    h.pipeline
        .put_object("b", "k", body_stream(vec![1, 2, 3]), PutObjectRequest::default())
        .await
        .unwrap();

    let req = CopyObjectRequest {
        expected_source_etag: Some("not-the-real-etag".to_string()),
        ..Default::default()
    };
    let err = h.pipeline.copy_object("b", "k", "b", "k2", req).await.unwrap_err();
    assert!(err.is_precondition());

    assert!(!h.ctl0.has_object("k2"));
    assert!(!h.ctl1.has_object("k2"));
}

#[tokio::test]
async fn multipart_one_replica_failing_complete_journals_put() {
    let h = make_pipeline("b");
    let upload_id = h.pipeline.new_multipart_upload("b", "big", PutObjectRequest::default()).await.unwrap();

    let part1 = h
        .pipeline
        .put_object_part("b", "big", &upload_id, 1, body_stream(vec![0xAA; 16]))
        .await
        .unwrap();
    let part2 = h
        .pipeline
        .put_object_part("b", "big", &upload_id, 2, body_stream(vec![0xBB; 16]))
        .await
        .unwrap();

    h.ctl1.set_fail_complete(true);
    let parts: Vec<PartInfo> = vec![part1, part2];
    let info = h
        .pipeline
        .complete_multipart_upload("b", "big", &upload_id, parts)
        .await
        .unwrap();
    assert!(info.size > 0);
    assert!(h.ctl0.has_object("big"));

    // The registry entry must be gone regardless of which replicas
    // succeeded: a further part upload against the same id now fails.
    let err = h
        .pipeline
        .put_object_part("b", "big", &upload_id, 3, body_stream(vec![0xCC; 4]))
        .await
        .unwrap_err();
    assert!(matches!(err, radio::error::GatewayError::InvalidUploadId { .. }));

    let r1_id = h.bindings.get("b").unwrap().replicas[1].id.clone();
    let entry = h.journal.read_latest("r1", "b", "big").await.expect("failed replica must be journaled");
    assert_eq!(entry.err_client_id, r1_id);
    assert_eq!(entry.op, radio::types::JournalOp::PutObject);
}

#[tokio::test]
async fn concurrent_writers_same_key_are_serialized_by_the_namespace_lock() {
    let (r0, _ctl0) = mock_replica_client("r0", true);
    let (r1, _ctl1) = mock_replica_client("r1", true);
    let mut map = HashMap::new();
    map.insert(
        "b".to_string(),
        MirrorBinding {
            name: "b".to_string(),
            replicas: [r0, r1],
        },
    );
    let bindings = Arc::new(MirrorBindings::from_map_for_tests(map));
    let lock = multi_node_lock(3);
    let journal_dir = tempdir::TempDir::new("radio-pipeline-concurrency-test").unwrap();
    let journal = HealJournal::spawn(journal_dir.path().to_path_buf(), CancellationToken::new());
    let registry = Arc::new(MultipartRegistry::new());
    let pipeline = Arc::new(Pipeline::new(bindings, lock, journal, registry));

    let p1 = pipeline.clone();
    let p2 = pipeline.clone();
    let first = tokio::spawn(async move { p1.put_object("b", "k3", body_stream(vec![1; 4]), PutObjectRequest::default()).await });
    let second = tokio::spawn(async move { p2.put_object("b", "k3", body_stream(vec![2; 4]), PutObjectRequest::default()).await });

    let (a, b) = tokio::join!(first, second);
    a.unwrap().unwrap();
    b.unwrap().unwrap();
}

