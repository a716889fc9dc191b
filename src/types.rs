//! Shared domain types passed between the pipeline, the replica clients and
//! the heal journal.

use std::collections::HashMap;

use crate::ids::RadioTag;

/// Index of a replica within a Mirror Binding. The only cross-node-stable
/// identifier used at runtime; 0 or 1 for the two-way mirrors this gateway
/// supports.
pub type ReplicaIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum JournalOp {
    PutObject,
    CopyObject,
    DeleteObject,
}

impl std::fmt::Display for JournalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JournalOp::PutObject => "PutObject",
            JournalOp::CopyObject => "CopyObject",
            JournalOp::DeleteObject => "DeleteObject",
        };
        f.write_str(s)
    }
}

/// Server-side encryption marker carried alongside object metadata. The
/// gateway treats this opaquely: it is recorded and replayed, never
/// interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SseMarker(pub Option<String>);

/// Gateway-native view of an object, annotated with the replica index it
/// was served from so a subsequent body read can target the same replica.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: String,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub sse: SseMarker,
    pub replica_index: ReplicaIndex,
}

impl ObjectInfo {
    pub fn radio_tag(&self) -> Option<RadioTag> {
        self.user_metadata
            .get(crate::ids::RADIO_TAG_KEY)
            .cloned()
            .map(RadioTag::from)
    }
}

/// One page of a listing, passed through verbatim from whichever replica
/// answered first.
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectListing {
    pub objects: Vec<ListedObject>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// A single backend part, as returned from PutObjectPart/CopyObjectPart.
#[derive(Debug, Clone)]
pub struct PartInfo {
    pub part_number: u16,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct MultipartUploadSummary {
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone)]
pub struct MultipartUploadListing {
    pub uploads: Vec<MultipartUploadSummary>,
    pub is_truncated: bool,
}
