//! Archive pipeline glue
//!
//! Ships WAL segment files to the object store and records them in the
//! catalog once the upload succeeded. A segment is cataloged only after its
//! object is complete, so the catalog never lists a segment the store lacks.
//!
//! Submodules:
//! - `demo`: end-to-end run against a local directory backend
pub mod demo;

use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::cadapter::client::{ObjectBackend, ObjectClient};
use crate::error::ArchiveError;
use crate::meta::{Compression, WalCatalog, WalRecord};

/// Key prefix under which segments are stored.
pub const WALS_PREFIX: &str = "wals/";

pub struct WalArchiver<B: ObjectBackend> {
    client: ObjectClient<B>,
    catalog: WalCatalog,
}

impl<B: ObjectBackend> WalArchiver<B> {
    pub fn new(client: ObjectClient<B>, catalog: WalCatalog) -> Self {
        Self { client, catalog }
    }

    pub fn client(&self) -> &ObjectClient<B> {
        &self.client
    }

    pub fn catalog(&self) -> &WalCatalog {
        &self.catalog
    }

    pub fn object_key(name: &str) -> String {
        format!("{WALS_PREFIX}{name}")
    }

    /// Upload the segment at `path` and append its record to the catalog.
    pub async fn archive_file(
        &self,
        path: &Path,
        compression: Option<Compression>,
    ) -> Result<WalRecord, ArchiveError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let record = WalRecord::new(name, size, time, compression);
        // nothing is uploaded for a segment the catalog could not list
        record.check()?;

        self.client
            .upload_object(file, &Self::object_key(&record.name), size)
            .await?;

        let catalog = self.catalog.clone();
        let appended = record.clone();
        tokio::task::spawn_blocking(move || catalog.append_records([&appended])).await??;
        info!(name = %record.name, size, "archived WAL segment");
        Ok(record)
    }

    /// Names already present in the catalog.
    pub async fn archived_names(&self) -> Result<HashSet<String>, ArchiveError> {
        let catalog = self.catalog.clone();
        let names = tokio::task::spawn_blocking(move || {
            catalog
                .records(0)?
                .map(|r| r.map(|r| r.name))
                .collect::<Result<HashSet<_>, _>>()
        })
        .await??;
        Ok(names)
    }

    /// Delete the segment object, then drop its catalog record.
    pub async fn remove(&self, record: &WalRecord) -> Result<bool, ArchiveError> {
        self.client
            .delete_objects(&[Self::object_key(&record.name)])
            .await?;
        let catalog = self.catalog.clone();
        let record = record.clone();
        let removed = tokio::task::spawn_blocking(move || catalog.delete_record(&record)).await??;
        Ok(removed)
    }
}
