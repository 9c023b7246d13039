//! Local directory backend, used as a mock object store.
//!
//! Keys map to files under `root`. Multipart uploads stage each part as a
//! file under `root/.multipart/<upload-id>/` and are concatenated on
//! completion.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use super::client::{ObjectBackend, ObjectReader, PartMetadata, validate_parts};
use super::plan::ProviderLimits;
use crate::error::{StoreError, StoreResult};

const STAGING_DIR: &str = ".multipart";

pub struct LocalFsBackend {
    root: PathBuf,
    limits: ProviderLimits,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_limits(root, ProviderLimits::gcs())
    }

    pub fn with_limits<P: AsRef<Path>>(root: P, limits: ProviderLimits) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            limits,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn staging_for(&self, upload_id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload_id)
    }

    /// All object keys under the root, `/` separated.
    async fn walk_keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if rel.is_empty() && name == STAGING_DIR {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

/// Present flat keys as a directory listing: keys directly under `prefix`,
/// plus one `<prefix><name><delimiter>` entry per deeper level.
pub(crate) fn list_level<I>(keys: I, prefix: &str, delimiter: &str) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        match rest.find(delimiter).filter(|_| !delimiter.is_empty()) {
            Some(idx) => {
                out.insert(format!("{prefix}{}", &rest[..idx + delimiter.len()]));
            }
            None => {
                out.insert(key);
            }
        }
    }
    out.into_iter().collect()
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    type Upload = String;

    fn limits(&self) -> ProviderLimits {
        self.limits
    }

    async fn check_connectivity(&self) -> StoreResult<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::Connectivity {
                source: format!("{} is not a directory", self.root.display()).into(),
            }),
            Err(e) => Err(StoreError::Connectivity {
                source: Box::new(e),
            }),
        }
    }

    async fn list_objects(&self, prefix: &str, delimiter: &str) -> StoreResult<Vec<String>> {
        let keys = self.walk_keys().await?;
        Ok(list_level(keys, prefix, delimiter))
    }

    async fn get_object(&self, key: &str) -> StoreResult<Option<ObjectReader>> {
        match fs::File::open(self.path_for(key)).await {
            Ok(f) => Ok(Some(Box::pin(f))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(path).await?;
        f.write_all(&body).await?;
        f.flush().await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, _key: &str) -> StoreResult<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_for(&upload_id)).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload: &String,
        _key: &str,
        body: Bytes,
        part_number: u32,
    ) -> StoreResult<PartMetadata> {
        let path = self.staging_for(upload).join(part_number.to_string());
        let mut f = fs::File::create(path).await?;
        f.write_all(&body).await?;
        f.flush().await?;
        let e_tag = format!("{:x}", md5::compute(&body));
        Ok(PartMetadata::new(part_number, Some(e_tag)))
    }

    async fn complete_multipart_upload(
        &self,
        upload: &String,
        key: &str,
        parts: &[PartMetadata],
    ) -> StoreResult<()> {
        validate_parts(key, parts)?;
        let staging = self.staging_for(upload);
        let mut missing = Vec::new();
        for part in parts {
            if fs::metadata(staging.join(part.part_number.to_string()))
                .await
                .is_err()
            {
                missing.push(part.part_number);
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::IncompleteUpload {
                key: key.to_string(),
                missing,
            });
        }

        let dest = self.path_for(key);
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).await?;
        }
        let assembling = staging.join("assembled");
        let mut out = fs::File::create(&assembling).await?;
        for part in parts {
            let mut src = fs::File::open(staging.join(part.part_number.to_string())).await?;
            tokio::io::copy(&mut src, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        fs::rename(&assembling, &dest).await?;
        fs::remove_dir_all(&staging).await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload: &String, _key: &str) -> StoreResult<()> {
        match fs::remove_dir_all(self.staging_for(upload)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            match fs::remove_file(self.path_for(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(key = %key, error = %e, "failed to delete object"),
            }
        }
        Ok(())
    }
}
