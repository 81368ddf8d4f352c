//! Object store access for the sync pipeline: listing and fetching source files.

use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use ttsync_core::SourceFile;

pub const CRATE_NAME: &str = "ttsync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The listing call itself failed. Fatal to a run: nothing has been
    /// processed yet and the watermark must not move.
    #[error("listing objects under {prefix:?}: {message}")]
    Access { prefix: String, message: String },
    /// A single object could not be retrieved. Recoverable at the per-file
    /// boundary.
    #[error("fetching object {key}: {message}")]
    Fetch { key: String, message: String },
}

/// Listing and retrieval surface the pipeline needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects under the configured prefix whose key ends with `suffix` and
    /// whose last-modified time is strictly after `newer_than`. An empty
    /// store yields an empty vec, not an error. No ordering is guaranteed
    /// beyond what the store returns.
    async fn list_newer(
        &self,
        newer_than: DateTime<Utc>,
        suffix: &str,
    ) -> Result<Vec<SourceFile>, StoreError>;

    /// Full byte content of one object.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// S3-backed implementation using the default AWS credential chain.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    pub async fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    pub async fn with_endpoint(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: &str,
    ) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Explicit client, for tests against stubbed SDK configs.
    pub fn with_client(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_newer(
        &self,
        newer_than: DateTime<Utc>,
        suffix: &str,
    ) -> Result<Vec<SourceFile>, StoreError> {
        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| StoreError::Access {
                prefix: self.prefix.clone(),
                message: e.to_string(),
            })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if !key.ends_with(suffix) {
                    continue;
                }
                let Some(modified) = object.last_modified() else {
                    continue;
                };
                let Some(modified) =
                    DateTime::from_timestamp(modified.secs(), modified.subsec_nanos())
                else {
                    continue;
                };
                if modified <= newer_than {
                    continue;
                }
                out.push(SourceFile {
                    key: key.to_string(),
                    last_modified: modified,
                    byte_size: object.size().unwrap_or(0).max(0) as u64,
                });
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        debug!(
            count = out.len(),
            bucket = %self.bucket,
            %newer_than,
            "listed candidate objects"
        );
        Ok(out)
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Fetch {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Fetch {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes()
            .to_vec();

        debug!(key, bytes = bytes.len(), "fetched object");
        Ok(bytes)
    }
}

/// In-memory store for tests and fixture-driven local runs. Records the
/// `newer_than` bound of the most recent listing so callers can assert on
/// watermark propagation.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Vec<(SourceFile, Vec<u8>)>>,
    listing_error: Mutex<Option<String>>,
    last_listed_since: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, last_modified: DateTime<Utc>, bytes: &[u8]) {
        self.objects.lock().expect("lock poisoned").push((
            SourceFile {
                key: key.to_string(),
                last_modified,
                byte_size: bytes.len() as u64,
            },
            bytes.to_vec(),
        ));
    }

    /// Make the next listing call fail, simulating an unreachable store.
    pub fn fail_listing(&self, message: &str) {
        *self.listing_error.lock().expect("lock poisoned") = Some(message.to_string());
    }

    /// The `newer_than` bound passed to the most recent `list_newer` call.
    pub fn last_listed_since(&self) -> Option<DateTime<Utc>> {
        *self.last_listed_since.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_newer(
        &self,
        newer_than: DateTime<Utc>,
        suffix: &str,
    ) -> Result<Vec<SourceFile>, StoreError> {
        *self.last_listed_since.lock().expect("lock poisoned") = Some(newer_than);
        if let Some(message) = self.listing_error.lock().expect("lock poisoned").clone() {
            return Err(StoreError::Access {
                prefix: String::new(),
                message,
            });
        }
        Ok(self
            .objects
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(file, _)| file.key.ends_with(suffix) && file.last_modified > newer_than)
            .map(|(file, _)| file.clone())
            .collect())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|(file, _)| file.key == key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::Fetch {
                key: key.to_string(),
                message: "object not found".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn listing_filters_by_suffix_and_strict_watermark() {
        let store = MemoryStore::new();
        store.insert("data/a.csv", ts(10), b"x");
        store.insert("data/b.csv", ts(12), b"y");
        store.insert("data/readme.txt", ts(12), b"z");

        let listed = store.list_newer(ts(10), ".csv").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "data/b.csv");
        assert_eq!(store.last_listed_since(), Some(ts(10)));
    }

    #[tokio::test]
    async fn empty_store_lists_empty_not_error() {
        let store = MemoryStore::new();
        let listed = store.list_newer(ts(0), ".csv").await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn listing_failure_is_access_error() {
        let store = MemoryStore::new();
        store.fail_listing("connection refused");
        let err = store.list_newer(ts(0), ".csv").await.unwrap_err();
        assert!(matches!(err, StoreError::Access { .. }));
    }

    #[tokio::test]
    async fn fetching_missing_object_is_fetch_error() {
        let store = MemoryStore::new();
        let err = store.fetch("data/missing.csv").await.unwrap_err();
        assert!(matches!(err, StoreError::Fetch { .. }));
    }

    #[tokio::test]
    async fn fetch_returns_stored_bytes() {
        let store = MemoryStore::new();
        store.insert("data/a.csv", ts(10), b"terminal_id,year\n1,2026\n");
        let bytes = store.fetch("data/a.csv").await.unwrap();
        assert_eq!(bytes, b"terminal_id,year\n1,2026\n");
    }
}
