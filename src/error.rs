//! Error taxonomy for the gateway.
//!
//! Each variant corresponds to one of the kinds described in the design's
//! error handling section: configuration failures are fatal at startup,
//! precondition failures are surfaced to the client verbatim, replica and
//! lock failures are distinguished so the pipeline can apply the
//! write-error reduction and journaling rules around them.

use std::io;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A precondition supplied by the caller did not hold (ETag mismatch on
    /// copy, missing bucket, ...). Surfaced to the client verbatim.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Neither eligible replica could serve a read.
    #[error("backend down: no eligible replica for {bucket}/{object}")]
    BackendDown { bucket: String, object: String },

    /// A logical multipart upload id is not present in the registry.
    #[error("invalid upload id {upload_id} for {bucket}/{object}")]
    InvalidUploadId {
        bucket: String,
        object: String,
        upload_id: String,
    },

    /// The namespace lock could not be acquired before the deadline, or a
    /// majority of peers could not be reached.
    #[error("lock unavailable for {bucket}/{object}: {reason}")]
    LockUnavailable {
        bucket: String,
        object: String,
        reason: String,
    },

    /// A bucket name that isn't part of the running configuration.
    #[error("unknown bucket {0}")]
    UnknownBucket(String),

    /// Source and destination replica counts differ on a copy (can only
    /// happen if two buckets are misconfigured relative to each other).
    #[error("unexpected: source and destination replica counts differ")]
    Unexpected,

    /// Error returned by a replica's S3-compatible backend.
    #[error("replica error: {0}")]
    Replica(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, GatewayError::Precondition(_))
    }
}
