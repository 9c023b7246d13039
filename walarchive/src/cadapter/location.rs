//! Object store locations: bucket plus key prefix, parsed from a URL.

use std::fmt;

use crate::error::{StoreError, StoreResult};

/// Console URL prefix of GCS-style locations.
pub const GCS_CONSOLE_URL: &str = "https://console.cloud.google.com/storage/browser";
const S3_SCHEME: &str = "s3://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    bucket: String,
    prefix: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> StoreResult<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(StoreError::Configuration("bucket name is empty".to_string()));
        }
        Ok(Self {
            bucket,
            prefix: prefix.into(),
        })
    }

    /// Parse either a console URL
    /// (`https://console.cloud.google.com/storage/browser/<bucket>/<prefix...>`)
    /// or an `s3://<bucket>/<prefix...>` URL. No network access happens here.
    pub fn parse(url: &str) -> StoreResult<Self> {
        let rest = if let Some(rest) = url.strip_prefix(S3_SCHEME) {
            rest
        } else if let Some(rest) = url.strip_prefix(GCS_CONSOLE_URL) {
            match rest.strip_prefix('/') {
                Some(rest) => rest,
                None if rest.is_empty() => rest,
                None => {
                    return Err(StoreError::Configuration(format!(
                        "storage URL {url} is malformed. Should start with '{GCS_CONSOLE_URL}/'"
                    )));
                }
            }
        } else {
            return Err(StoreError::Configuration(format!(
                "storage URL {url} is malformed. Should start with '{GCS_CONSOLE_URL}' or '{S3_SCHEME}'"
            )));
        };

        let path = rest.split(['?', '#']).next().unwrap_or_default();
        let mut segments = path.split('/');
        let bucket = segments.next().unwrap_or_default();
        if bucket.is_empty() {
            return Err(StoreError::Configuration(format!(
                "storage URL {url} is malformed. Bucket name not found"
            )));
        }
        let prefix = segments.collect::<Vec<_>>().join("/");
        Self::new(bucket, prefix)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full object key for `key` relative to this location.
    pub fn join(&self, key: &str) -> String {
        let base = self.prefix.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        match (base.is_empty(), key.is_empty()) {
            (true, _) => key.to_string(),
            (false, true) => format!("{base}/"),
            (false, false) => format!("{base}/{key}"),
        }
    }

    /// Inverse of [`StorageLocation::join`]; keys outside the prefix are
    /// returned unchanged.
    pub fn relative<'a>(&self, full_key: &'a str) -> &'a str {
        let base = self.prefix.trim_end_matches('/');
        if base.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(full_key)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}
