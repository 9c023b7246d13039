//! WAL segment metadata
//!
//! Responsibilities:
//! - Keep the catalog of segments already shipped to the object store, so the
//!   backup pipeline can tell what still needs archiving.
//! - Offer resumable, position-based scans and crash-safe record deletion.
//!
//! Submodules:
//! - `record`: the `WalRecord` type and its line encoding
//! - `catalog`: the append-only catalog file
pub mod catalog;
pub mod record;

pub use catalog::{CatalogScan, WalCatalog};
pub use record::{Compression, WalRecord};
