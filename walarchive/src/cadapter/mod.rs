//! Object store adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `ObjectBackend` provider interface and `ObjectClient`,
//!   which runs the multipart orchestration shared by every provider
//! - `plan`: chunk planning against provider limits
//! - `session`: multipart upload state machine
//! - `location`: bucket/prefix locations parsed from URLs
//! - `s3`: S3-compatible backend (also GCS through its XML API)
//! - `localfs`: local directory backend
//!
pub mod client;
pub mod localfs;
pub mod location;
pub mod plan;
pub mod s3;
pub mod session;

pub use client::{ClientConfig, ObjectBackend, ObjectClient, ObjectReader, PartMetadata};
pub use location::StorageLocation;
pub use plan::{ChunkPlan, PartSpan, ProviderLimits, plan_chunks};
pub use session::{MultipartSession, SessionState};
