//! `radio`: an S3-compatible object-storage mirroring gateway.
//!
//! One logical S3 endpoint per configured bucket, fanned out to exactly two
//! remote replicas (the [`bucket`]/[`replica`] modules), reconciled via a
//! durable heal journal ([`journal`]) and coordinated across peer nodes by a
//! distributed namespace lock ([`lock`]). [`pipeline`] is the seam the S3
//! front-end talks to; everything else is a collaborator it orchestrates.

pub mod bucket;
pub mod config;
pub mod duplicator;
pub mod error;
pub mod health;
pub mod ids;
pub mod journal;
pub mod lock;
pub mod metrics;
pub mod multipart;
pub mod pipeline;
pub mod reducer;
pub mod replica;
pub mod types;
