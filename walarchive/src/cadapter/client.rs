//! High-level object store client
//!
//! `ObjectBackend` is the per-provider capability set. `ObjectClient` wraps a
//! backend and implements everything that is the same for every provider:
//! the connectivity probe and the multipart upload orchestration.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::plan::{ProviderLimits, plan_chunks};
use super::session::MultipartSession;
use crate::error::{StoreError, StoreResult};

/// Readable body of a downloaded object.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Metadata a backend returns for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMetadata {
    pub part_number: u32,
    /// Content tag assigned by the provider, when it has one.
    pub e_tag: Option<String>,
}

impl PartMetadata {
    pub fn new(part_number: u32, e_tag: Option<String>) -> Self {
        Self {
            part_number,
            e_tag,
        }
    }
}

/// Provider capability interface. Keys are relative to the backend's
/// configured location.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Opaque handle of an in-progress multipart upload, passed back
    /// unchanged on every later call for that upload.
    type Upload: Clone + Send + Sync + 'static;

    fn limits(&self) -> ProviderLimits;

    async fn check_connectivity(&self) -> StoreResult<()>;

    /// Keys and pseudo-directories (ending in `delimiter`) directly under
    /// `prefix`, sorted.
    async fn list_objects(&self, prefix: &str, delimiter: &str) -> StoreResult<Vec<String>>;

    /// `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> StoreResult<Option<ObjectReader>>;

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()>;

    async fn create_multipart_upload(&self, key: &str) -> StoreResult<Self::Upload>;

    async fn upload_part(
        &self,
        upload: &Self::Upload,
        key: &str,
        body: Bytes,
        part_number: u32,
    ) -> StoreResult<PartMetadata>;

    /// `parts` is sorted by part number. Implementations must reject gaps and
    /// disorder before committing, see [`validate_parts`].
    async fn complete_multipart_upload(
        &self,
        upload: &Self::Upload,
        key: &str,
        parts: &[PartMetadata],
    ) -> StoreResult<()>;

    async fn abort_multipart_upload(&self, upload: &Self::Upload, key: &str) -> StoreResult<()>;

    /// Best-effort batch delete.
    async fn delete_objects(&self, keys: &[String]) -> StoreResult<()>;
}

/// Check that `parts` are numbered exactly 1..=n in order.
pub fn validate_parts(key: &str, parts: &[PartMetadata]) -> StoreResult<()> {
    for (idx, part) in parts.iter().enumerate() {
        let expected = idx as u32 + 1;
        if part.part_number != expected {
            return Err(StoreError::InvalidPart {
                key: key.to_string(),
                reason: format!(
                    "expected part {expected} at index {idx}, found part {}",
                    part.part_number
                ),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of parts uploaded concurrently.
    pub jobs: usize,
    /// Objects larger than this go through multipart upload.
    pub multipart_threshold: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            jobs: 2,
            multipart_threshold: 8 * 1024 * 1024, // 8MB
        }
    }
}

pub struct ObjectClient<B: ObjectBackend> {
    backend: Arc<B>,
    config: ClientConfig,
}

impl<B: ObjectBackend> ObjectClient<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ClientConfig::default())
    }

    pub fn with_config(backend: B, config: ClientConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Swap in a freshly built backend handle, e.g. after credentials rotate.
    /// Uploads already in flight keep the handle they started with.
    pub fn replace_backend(&mut self, backend: B) {
        self.backend = Arc::new(backend);
    }

    /// Health check. Errors are logged, never returned.
    pub async fn test_connectivity(&self) -> bool {
        match self.backend.check_connectivity().await {
            Ok(()) => true,
            Err(e) => {
                error!("Can't connect to cloud provider: {e}");
                false
            }
        }
    }

    pub async fn list_objects(&self, prefix: &str, delimiter: &str) -> StoreResult<Vec<String>> {
        self.backend.list_objects(prefix, delimiter).await
    }

    pub async fn get_object(&self, key: &str) -> StoreResult<Option<ObjectReader>> {
        self.backend.get_object(key).await
    }

    pub async fn put_object(&self, key: &str, body: impl Into<Bytes>) -> StoreResult<()> {
        self.backend.put_object(key, body.into()).await
    }

    pub async fn delete_objects(&self, keys: &[String]) -> StoreResult<()> {
        self.backend.delete_objects(keys).await
    }

    /// Upload `size` bytes from `reader`, in one request when the object is
    /// small enough and as a multipart upload otherwise.
    pub async fn upload_object<R>(&self, mut reader: R, key: &str, size: u64) -> StoreResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        if size > self.config.multipart_threshold {
            return self.upload_large_object(reader, key, size).await;
        }
        let mut body = vec![0u8; size as usize];
        reader.read_exact(&mut body).await?;
        self.backend.put_object(key, Bytes::from(body)).await
    }

    /// Copy an object into a local file. Returns `false` if it does not exist.
    pub async fn download_object(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let Some(mut body) = self.backend.get_object(key).await? else {
            return Ok(false);
        };
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let copied = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        debug!(key, bytes = copied, dest = %dest.display(), "downloaded object");
        Ok(true)
    }

    /// Multipart upload of `total_size` bytes read from `reader`.
    ///
    /// Parts are read in order and handed to at most `jobs` concurrent
    /// workers. After the first failure no new part is dispatched; in-flight
    /// parts are awaited, the upload is aborted once and `UploadFailed` is
    /// returned.
    pub async fn upload_large_object<R>(
        &self,
        mut reader: R,
        key: &str,
        total_size: u64,
    ) -> StoreResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let plan = plan_chunks(total_size, &self.backend.limits())?;
        debug!(
            key,
            total_size,
            chunk_size = plan.chunk_size,
            parts = plan.part_count,
            "planned multipart upload"
        );

        let session = Arc::new(MultipartSession::create(self.backend.clone(), key).await?);
        let workers = Arc::new(Semaphore::new(self.config.jobs.max(1)));
        let mut tasks: JoinSet<StoreResult<()>> = JoinSet::new();
        let mut failure: Option<StoreError> = None;

        for part in plan.parts() {
            // A worker releases its permit only after the session saw its result.
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    failure = Some(StoreError::provider("acquire upload worker", e));
                    break;
                }
            };
            // Finished workers, including ones that panicked, are collected
            // here so their failure stops dispatch too.
            while let Some(joined) = tasks.try_join_next() {
                note_failure(&mut failure, joined);
            }
            if failure.is_some() || session.has_failed().await {
                break;
            }
            let mut body = vec![0u8; part.len as usize];
            if let Err(e) = reader.read_exact(&mut body).await {
                failure = Some(e.into());
                break;
            }
            let session = session.clone();
            tasks.spawn(async move {
                let _permit = permit;
                session.upload_part(part.number, Bytes::from(body)).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            note_failure(&mut failure, joined);
        }

        let cause = match failure {
            Some(cause) => cause,
            None => match session.complete(plan.part_count).await {
                Ok(()) => {
                    info!(key, total_size, parts = plan.part_count, "multipart upload completed");
                    return Ok(());
                }
                Err(e) => e,
            },
        };

        warn!(key, error = %cause, "aborting multipart upload");
        if let Err(e) = session.abort().await {
            warn!(key, error = %e, "failed to abort multipart upload");
        }
        Err(StoreError::UploadFailed {
            key: key.to_string(),
            source: Box::new(cause),
        })
    }
}

/// Keep the first part failure, log the rest.
fn note_failure(first: &mut Option<StoreError>, joined: Result<StoreResult<()>, JoinError>) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => StoreError::provider("upload part task", e),
    };
    match first {
        None => *first = Some(err),
        Some(_) => warn!(error = %err, "additional part upload failure"),
    }
}
