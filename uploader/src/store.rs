//! The S3-compatible multipart protocol, as the uploader needs it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::retry::RetryError;

/// Remote side of a multipart upload.
///
/// Implementations classify their failures into `RetryError::Retryable` and
/// `RetryError::NonRetryable`; retrying is left to the caller.
#[async_trait]
pub trait PartStore: Send + Sync + 'static {
    /// Start a multipart upload for `key` and return its upload id.
    async fn create_upload(&self, key: &str) -> Result<String, RetryError>;

    /// Upload one part (1-based `part_number`) and return its etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, RetryError>;

    /// Merge the uploaded parts. `etags` is ordered by part number, starting at 1.
    ///
    /// `timeout` bounds this one request; merging large objects can outlast
    /// the timeout used for the other calls.
    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        etags: Vec<String>,
        timeout: Duration,
    ) -> Result<(), RetryError>;

    /// Discard the upload and every part uploaded so far. An upload the store
    /// no longer knows about counts as aborted.
    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<(), RetryError>;

    /// Size of the stored object, `None` if it does not exist.
    async fn object_size(&self, key: &str) -> Result<Option<u64>, RetryError>;
}
