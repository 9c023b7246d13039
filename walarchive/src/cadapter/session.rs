//! Multipart upload session shared by the part workers of one upload.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::client::{ObjectBackend, PartMetadata};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Created,
    Uploading,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Uploading => "uploading",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    /// Set while a complete or abort call is talking to the provider.
    finishing: bool,
    failed: bool,
    parts: BTreeMap<u32, PartMetadata>,
}

impl SessionInner {
    fn ensure_open(&self, key: &str) -> StoreResult<()> {
        if self.state.is_terminal() {
            return Err(StoreError::SessionFinished {
                key: key.to_string(),
                state: self.state.to_string(),
            });
        }
        if self.finishing {
            return Err(StoreError::SessionFinished {
                key: key.to_string(),
                state: "finishing".to_string(),
            });
        }
        Ok(())
    }
}

/// One multipart upload: Created -> Uploading -> Completed, or Aborted from
/// Created/Uploading. Complete and abort may each succeed at most once and
/// exclude each other.
pub struct MultipartSession<B: ObjectBackend> {
    backend: Arc<B>,
    key: String,
    upload: B::Upload,
    inner: Mutex<SessionInner>,
}

impl<B: ObjectBackend> MultipartSession<B> {
    pub async fn create(backend: Arc<B>, key: impl Into<String>) -> StoreResult<Self> {
        let key = key.into();
        let upload = backend.create_multipart_upload(&key).await?;
        debug!(key = %key, "created multipart upload");
        Ok(Self {
            backend,
            key,
            upload,
            inner: Mutex::new(SessionInner::default()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload(&self) -> &B::Upload {
        &self.upload
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Whether any part upload has failed.
    pub async fn has_failed(&self) -> bool {
        self.inner.lock().await.failed
    }

    /// Part numbers recorded so far, ascending.
    pub async fn part_numbers(&self) -> Vec<u32> {
        self.inner.lock().await.parts.keys().copied().collect()
    }

    /// Upload one part and record its metadata. A failure marks the session
    /// as failed and is returned to the caller.
    pub async fn upload_part(&self, part_number: u32, body: Bytes) -> StoreResult<()> {
        {
            let inner = self.inner.lock().await;
            inner.ensure_open(&self.key)?;
            if part_number == 0 || inner.parts.contains_key(&part_number) {
                return Err(StoreError::InvalidPart {
                    key: self.key.clone(),
                    reason: format!("part {part_number} is invalid or already uploaded"),
                });
            }
        }

        let len = body.len();
        let result = self
            .backend
            .upload_part(&self.upload, &self.key, body, part_number)
            .await
            .and_then(|meta| {
                if meta.part_number == part_number {
                    Ok(meta)
                } else {
                    Err(StoreError::InvalidPart {
                        key: self.key.clone(),
                        reason: format!(
                            "provider returned part {} for part {part_number}",
                            meta.part_number
                        ),
                    })
                }
            });

        let mut inner = self.inner.lock().await;
        match result {
            // The session was aborted while this part was in flight.
            Ok(_) if inner.state.is_terminal() => Err(StoreError::SessionFinished {
                key: self.key.clone(),
                state: inner.state.to_string(),
            }),
            Ok(meta) => {
                inner.state = SessionState::Uploading;
                inner.parts.insert(part_number, meta);
                debug!(key = %self.key, part_number, len, "uploaded part");
                Ok(())
            }
            Err(e) => {
                inner.failed = true;
                Err(e)
            }
        }
    }

    /// Finish the upload. Parts `1..=expected_parts` must all be present; they
    /// are handed to the provider sorted by part number. If the provider
    /// rejects the completion the session stays open so it can be aborted.
    pub async fn complete(&self, expected_parts: u32) -> StoreResult<()> {
        let parts = {
            let mut inner = self.inner.lock().await;
            inner.ensure_open(&self.key)?;
            let missing: Vec<u32> = (1..=expected_parts)
                .filter(|n| !inner.parts.contains_key(n))
                .collect();
            if !missing.is_empty() {
                return Err(StoreError::IncompleteUpload {
                    key: self.key.clone(),
                    missing,
                });
            }
            if inner.parts.len() != expected_parts as usize {
                return Err(StoreError::InvalidPart {
                    key: self.key.clone(),
                    reason: format!(
                        "{} parts recorded, {expected_parts} expected",
                        inner.parts.len()
                    ),
                });
            }
            inner.finishing = true;
            inner.parts.values().cloned().collect::<Vec<_>>()
        };

        let result = self
            .backend
            .complete_multipart_upload(&self.upload, &self.key, &parts)
            .await;

        let mut inner = self.inner.lock().await;
        inner.finishing = false;
        if result.is_ok() {
            inner.state = SessionState::Completed;
        }
        result
    }

    /// Release provider-side storage of the incomplete upload. The session
    /// ends up Aborted even when the provider call fails.
    pub async fn abort(&self) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.ensure_open(&self.key)?;
            inner.finishing = true;
        }

        let result = self
            .backend
            .abort_multipart_upload(&self.upload, &self.key)
            .await;

        let mut inner = self.inner.lock().await;
        inner.finishing = false;
        inner.state = SessionState::Aborted;
        warn!(key = %self.key, parts = inner.parts.len(), "multipart upload aborted");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::localfs::LocalFsBackend;

    /// Accepts everything; part uploads wait until the gate is opened.
    #[derive(Default)]
    struct GatedBackend {
        gate: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ObjectBackend for GatedBackend {
        type Upload = ();

        fn limits(&self) -> crate::cadapter::ProviderLimits {
            crate::cadapter::ProviderLimits::default()
        }

        async fn check_connectivity(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn list_objects(&self, _prefix: &str, _delimiter: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_object(&self, _key: &str) -> StoreResult<Option<crate::cadapter::ObjectReader>> {
            Ok(None)
        }

        async fn put_object(&self, _key: &str, _body: Bytes) -> StoreResult<()> {
            Ok(())
        }

        async fn create_multipart_upload(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn upload_part(
            &self,
            _upload: &(),
            _key: &str,
            _body: Bytes,
            part_number: u32,
        ) -> StoreResult<PartMetadata> {
            self.gate.notified().await;
            Ok(PartMetadata::new(part_number, None))
        }

        async fn complete_multipart_upload(
            &self,
            _upload: &(),
            _key: &str,
            _parts: &[PartMetadata],
        ) -> StoreResult<()> {
            Ok(())
        }

        async fn abort_multipart_upload(&self, _upload: &(), _key: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn delete_objects(&self, _keys: &[String]) -> StoreResult<()> {
            Ok(())
        }
    }

    async fn session(dir: &std::path::Path) -> MultipartSession<LocalFsBackend> {
        let backend = Arc::new(LocalFsBackend::new(dir));
        MultipartSession::create(backend, "wal/0001").await.unwrap()
    }

    #[tokio::test]
    async fn test_out_of_order_parts_complete_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let s = session(tmp.path()).await;
        assert_eq!(s.state().await, SessionState::Created);

        s.upload_part(2, Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(s.state().await, SessionState::Uploading);
        s.upload_part(1, Bytes::from_static(b"hello ")).await.unwrap();
        assert_eq!(s.part_numbers().await, vec![1, 2]);

        s.complete(2).await.unwrap();
        assert_eq!(s.state().await, SessionState::Completed);
        assert_eq!(std::fs::read(tmp.path().join("wal/0001")).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_complete_requires_every_part() {
        let tmp = tempfile::tempdir().unwrap();
        let s = session(tmp.path()).await;
        s.upload_part(1, Bytes::from_static(b"a")).await.unwrap();
        s.upload_part(3, Bytes::from_static(b"c")).await.unwrap();

        match s.complete(3).await {
            Err(StoreError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![2]),
            other => panic!("unexpected {other:?}"),
        }
        // still open, so it can be aborted
        s.abort().await.unwrap();
        assert_eq!(s.state().await, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_duplicate_part_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let s = session(tmp.path()).await;
        s.upload_part(1, Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(
            s.upload_part(1, Bytes::from_static(b"b")).await,
            Err(StoreError::InvalidPart { .. })
        ));
        assert!(s.upload_part(0, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_states_are_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let s = session(tmp.path()).await;
        s.upload_part(1, Bytes::from_static(b"a")).await.unwrap();
        s.complete(1).await.unwrap();

        assert!(matches!(
            s.complete(1).await,
            Err(StoreError::SessionFinished { .. })
        ));
        assert!(matches!(s.abort().await, Err(StoreError::SessionFinished { .. })));
        assert!(s.upload_part(2, Bytes::from_static(b"b")).await.is_err());
        assert_eq!(s.state().await, SessionState::Completed);

        let aborted = session(tmp.path()).await;
        aborted.abort().await.unwrap();
        assert!(matches!(
            aborted.abort().await,
            Err(StoreError::SessionFinished { .. })
        ));
        assert!(matches!(
            aborted.complete(0).await,
            Err(StoreError::SessionFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_part_finishing_after_abort_is_not_recorded() {
        let backend = Arc::new(GatedBackend::default());
        let s = Arc::new(MultipartSession::create(backend.clone(), "wal/0002").await.unwrap());

        let worker = tokio::spawn({
            let s = s.clone();
            async move { s.upload_part(1, Bytes::from_static(b"late")).await }
        });
        // let the worker get past the open check and block in the provider
        tokio::task::yield_now().await;
        s.abort().await.unwrap();
        backend.gate.notify_one();

        assert!(matches!(
            worker.await.unwrap(),
            Err(StoreError::SessionFinished { .. })
        ));
        assert!(s.part_numbers().await.is_empty());
        assert_eq!(s.state().await, SessionState::Aborted);
    }
}
