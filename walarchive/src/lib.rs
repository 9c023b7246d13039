// Library crate for walarchive: WAL segment catalog plus object store adapters
// used by the backup pipeline.

pub mod archiver;
pub mod cadapter;
pub mod error;
pub mod meta;

pub use error::{ArchiveError, CatalogError, StoreError};
