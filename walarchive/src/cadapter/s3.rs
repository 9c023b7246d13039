//! S3 backend built on aws-sdk-s3. Also serves GCS-style locations through
//! the GCS XML interoperability endpoint, which speaks the same multipart
//! protocol.

use std::fmt::Debug;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use super::client::{ObjectBackend, ObjectReader, PartMetadata, validate_parts};
use super::location::StorageLocation;
use super::plan::ProviderLimits;
use crate::error::{StoreError, StoreResult};

/// Endpoint of the GCS XML API.
pub const GCS_XML_ENDPOINT: &str = "https://storage.googleapis.com";
/// DeleteObjects accepts at most this many keys per request.
const MAX_DELETE_BATCH: usize = 1000;

/// S3 backend options
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Retries for part and single-shot uploads.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds, doubled on every attempt.
    pub initial_retry_delay_ms: u64,
    /// Custom endpoint (MinIO, GCS interop, ...). `None` uses AWS.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub limits: ProviderLimits,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay_ms: 100,
            endpoint_url: None,
            region: None,
            limits: ProviderLimits::s3(),
        }
    }
}

impl S3Config {
    /// Settings for a GCS bucket accessed with HMAC keys.
    pub fn gcs_interop() -> Self {
        Self {
            endpoint_url: Some(GCS_XML_ENDPOINT.to_string()),
            region: Some("auto".to_string()),
            ..Self::default()
        }
    }
}

/// Handle of an S3 multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Upload {
    pub upload_id: String,
}

pub struct S3Backend {
    client: Client,
    location: StorageLocation,
    config: S3Config,
}

impl S3Backend {
    /// Wrap an already configured client.
    pub fn new(client: Client, location: StorageLocation, config: S3Config) -> Self {
        Self {
            client,
            location,
            config,
        }
    }

    /// Build a client from the environment (credentials, profile) plus the
    /// endpoint and region overrides in `config`.
    pub async fn connect(location: StorageLocation, config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;
        Self::new(Client::new(&conf), location, config)
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn bucket(&self) -> &str {
        self.location.bucket()
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn execute_with_retry<T, F, Fut, E, R>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SdkError<E, R>>>,
        E: std::error::Error + Send + Sync + 'static,
        R: Debug + Send + Sync + 'static,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        return Err(sdk_error(operation_name, e));
                    }
                    let delay_ms = retry_delay_ms(self.config.initial_retry_delay_ms, attempt);
                    debug!(operation = operation_name, attempt, error = %e, "retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

/// Exponential backoff for the given 1-based attempt, saturating at `u64::MAX`.
fn retry_delay_ms(initial_ms: u64, attempt: u32) -> u64 {
    initial_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Transport-level failures are connectivity errors, everything else is a
/// provider error for `operation`.
fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    if matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    ) {
        StoreError::Connectivity {
            source: Box::new(err),
        }
    } else {
        StoreError::provider(operation, err)
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    type Upload = S3Upload;

    fn limits(&self) -> ProviderLimits {
        self.config.limits
    }

    async fn check_connectivity(&self) -> StoreResult<()> {
        // Only reachability matters here, a missing bucket still proves it.
        match self.client.head_bucket().bucket(self.bucket()).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(()),
            Err(e) => Err(StoreError::Connectivity {
                source: Box::new(e),
            }),
        }
    }

    async fn list_objects(&self, prefix: &str, delimiter: &str) -> StoreResult<Vec<String>> {
        let full_prefix = self.location.join(prefix);
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(self.bucket())
                .prefix(&full_prefix)
                .set_continuation_token(token.take());
            if !delimiter.is_empty() {
                req = req.delimiter(delimiter);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| sdk_error("list_objects_v2", e))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    entries.push(self.location.relative(key).to_string());
                }
            }
            for common in resp.common_prefixes() {
                if let Some(p) = common.prefix() {
                    entries.push(self.location.relative(p).to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn get_object(&self, key: &str) -> StoreResult<Option<ObjectReader>> {
        let resp = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(self.location.join(key))
            .send()
            .await;
        match resp {
            Ok(o) => Ok(Some(Box::pin(o.body.into_async_read()))),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => Ok(None),
            Err(e) => Err(sdk_error("get_object", e)),
        }
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        let full_key = self.location.join(key);
        let checksum = Self::md5_base64(&body);
        let operation = || async {
            self.client
                .put_object()
                .bucket(self.bucket())
                .key(&full_key)
                .content_md5(checksum.clone())
                .body(ByteStream::from(body.clone()))
                .send()
                .await
        };
        self.execute_with_retry(operation, "put_object").await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> StoreResult<S3Upload> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(self.location.join(key))
            .send()
            .await
            .map_err(|e| sdk_error("create_multipart_upload", e))?;
        let upload_id = create.upload_id().ok_or_else(|| {
            StoreError::provider("create_multipart_upload", "response carries no upload id")
        })?;
        Ok(S3Upload {
            upload_id: upload_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        upload: &S3Upload,
        key: &str,
        body: Bytes,
        part_number: u32,
    ) -> StoreResult<PartMetadata> {
        let full_key = self.location.join(key);
        let checksum = Self::md5_base64(&body);
        let number = i32::try_from(part_number).map_err(|_| StoreError::InvalidPart {
            key: key.to_string(),
            reason: format!("part number {part_number} out of range"),
        })?;

        let operation = || async {
            self.client
                .upload_part()
                .bucket(self.bucket())
                .key(&full_key)
                .upload_id(&upload.upload_id)
                .part_number(number)
                .content_md5(checksum.clone())
                .body(ByteStream::from(body.clone()))
                .send()
                .await
        };

        let resp = self.execute_with_retry(operation, "upload_part").await?;
        Ok(PartMetadata::new(
            part_number,
            resp.e_tag().map(|s| s.to_string()),
        ))
    }

    async fn complete_multipart_upload(
        &self,
        upload: &S3Upload,
        key: &str,
        parts: &[PartMetadata],
    ) -> StoreResult<()> {
        validate_parts(key, parts)?;
        let completed_parts = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .set_e_tag(p.e_tag.clone())
                    .build()
            })
            .collect::<Vec<_>>();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(self.location.join(key))
            .upload_id(&upload.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_error("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload: &S3Upload, key: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(self.location.join(key))
            .upload_id(&upload.upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<()> {
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| {
                    ObjectIdentifier::builder()
                        .key(self.location.join(k))
                        .build()
                        .map_err(|e| StoreError::provider("delete_objects", e))
                })
                .collect::<StoreResult<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StoreError::provider("delete_objects", e))?;

            let resp = self
                .client
                .delete_objects()
                .bucket(self.bucket())
                .delete(delete)
                .send()
                .await
                .map_err(|e| sdk_error("delete_objects", e))?;
            for err in resp.errors() {
                warn!(
                    key = err.key().unwrap_or_default(),
                    code = err.code().unwrap_or_default(),
                    message = err.message().unwrap_or_default(),
                    "failed to delete object"
                );
            }
        }
        Ok(())
    }
}
