//! Multipart upload session: initiate, collect part etags, complete or abort.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, UploadError};
use crate::retry::{with_retry, RetryConfig};
use crate::store::PartStore;

/// A successfully uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub number: u32,
    pub etag: String,
    pub bytes: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    InProgress,
    Completed,
    Aborted,
    Failed,
}

/// How hard the session tries to finish a transfer.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryConfig,
    /// First completion window: the wait before checking whether a failed
    /// completion was merged anyway, and the timeout of the retried request.
    pub completion_grace: Duration,
}

impl SessionOptions {
    /// Stores backed by POSIX filesystems merge parts slowly; allow them at
    /// least a minute, plus 5 s per GiB.
    pub fn for_file(file_size: u64, retry: RetryConfig) -> Self {
        let gib = file_size.div_ceil(1024 * 1024 * 1024);
        Self {
            retry,
            completion_grace: Duration::from_secs((gib * 5).max(60)),
        }
    }
}

/// One multipart upload on the remote store.
///
/// Parts are recorded as they finish; `complete` only goes to the store once
/// every planned part has an etag. Terminal states are never left.
pub struct UploadSession<S> {
    store: Arc<S>,
    key: String,
    upload_id: String,
    planned_parts: u32,
    parts: BTreeMap<u32, PartResult>,
    state: SessionState,
    options: SessionOptions,
    cancel: CancellationToken,
}

impl<S: PartStore> UploadSession<S> {
    /// Create a new multipart upload for the given key.
    pub async fn initiate(
        store: Arc<S>,
        key: &str,
        planned_parts: u32,
        options: SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (upload_id, _) = with_retry(
            "create_multipart_upload",
            |_| store.create_upload(key),
            &options.retry,
            cancel,
        )
        .await
        .map_err(|failure| failure.into_remote_error("create_multipart_upload"))?;

        log::info!("Initiated multipart upload: UploadId={}", upload_id);

        Ok(Self {
            store,
            key: key.to_string(),
            upload_id,
            planned_parts,
            parts: BTreeMap::new(),
            state: SessionState::InProgress,
            options,
            cancel: cancel.clone(),
        })
    }

    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartResult> {
        self.parts.values()
    }

    /// Store a part's result. A later result for the same part replaces the
    /// earlier one.
    pub fn record(&mut self, result: PartResult) {
        if let Some(previous) = self.parts.insert(result.number, result) {
            log::debug!("Part {}: result replaced", previous.number);
        }
    }

    /// Part numbers missing from, and not belonging to, the plan.
    fn coverage_gaps(&self) -> (Vec<u32>, Vec<u32>) {
        let missing = (1..=self.planned_parts)
            .filter(|n| !self.parts.contains_key(n))
            .collect();
        let unexpected = self
            .parts
            .keys()
            .copied()
            .filter(|n| *n == 0 || *n > self.planned_parts)
            .collect();
        (missing, unexpected)
    }

    /// Complete the multipart upload.
    ///
    /// A transient failure is not taken at face value: the store may still be
    /// merging the parts. After the completion window the object is probed,
    /// and a size equal to `expected_size` counts as completed. The window
    /// starts at `completion_grace`, doubles on every failed attempt and also
    /// bounds the next completion request.
    pub async fn complete(&mut self, expected_size: u64) -> Result<()> {
        if self.state != SessionState::InProgress {
            return Err(UploadError::Config(format!(
                "cannot complete upload {} in state {:?}",
                self.upload_id, self.state
            )));
        }
        let (missing, unexpected) = self.coverage_gaps();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(UploadError::IncompleteParts {
                missing,
                unexpected,
            });
        }

        let etags: Vec<String> = self.parts.values().map(|p| p.etag.clone()).collect();
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut window = self.options.completion_grace;
        let mut attempt = 0;
        log::info!("Sending complete_multipart_upload request ({} parts)", etags.len());

        let last_error = loop {
            attempt += 1;
            let err = match self
                .store
                .complete_upload(&self.key, &self.upload_id, etags.clone(), window)
                .await
            {
                Ok(()) => {
                    self.mark_completed();
                    return Ok(());
                }
                Err(err) => err,
            };
            log::warn!(
                "complete_multipart_upload failed (attempt {}/{}): {:#}",
                attempt,
                max_attempts,
                err
            );

            if !err.is_retryable() {
                // after a timed-out attempt the store may have merged the
                // parts and forgotten the upload id
                if attempt > 1 {
                    log::info!("Checking object state immediately");
                    if self.merged(expected_size).await {
                        self.mark_completed();
                        return Ok(());
                    }
                }
                break err;
            }

            log::info!(
                "Waiting {:?} before checking object state to see if merge has completed",
                window
            );
            self.pause(window).await?;
            if self.merged(expected_size).await {
                self.mark_completed();
                return Ok(());
            }
            if attempt >= max_attempts {
                break err;
            }
            window = window.saturating_mul(2);
            log::info!("Increasing completion timeout to {:?} and retrying", window);
        };

        self.state = SessionState::Failed;
        Err(UploadError::Remote {
            operation: "complete_multipart_upload",
            part: None,
            attempts: attempt,
            source: last_error.into_inner(),
        })
    }

    fn mark_completed(&mut self) {
        self.state = SessionState::Completed;
        log::info!("Completed multipart upload: UploadId={}", self.upload_id);
    }

    /// Sleep unless the transfer is cancelled first.
    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn merged(&self, expected_size: u64) -> bool {
        match self.store.object_size(&self.key).await {
            Ok(Some(size)) if size == expected_size => {
                log::info!("HeadObject confirms multipart upload merge has completed");
                true
            }
            Ok(size) => {
                log::info!(
                    "HeadObject reports {:?} bytes after failed completion",
                    size
                );
                false
            }
            Err(err) => {
                log::info!("head_object failed after failed completion: {:#}", err);
                false
            }
        }
    }

    /// Abort the multipart upload.
    ///
    /// Releases uploaded parts on the store. Calling it again, or after the
    /// upload completed, does nothing. A failed completion is cleaned up on
    /// the store but stays `Failed`.
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            SessionState::Aborted | SessionState::Completed => return Ok(()),
            SessionState::InProgress | SessionState::Failed => {}
        }

        self.store
            .abort_upload(&self.key, &self.upload_id)
            .await
            .map_err(|err| UploadError::Remote {
                operation: "abort_multipart_upload",
                part: None,
                attempts: 1,
                source: err.into_inner(),
            })?;

        if self.state == SessionState::InProgress {
            self.state = SessionState::Aborted;
        }
        log::warn!(
            "Aborted multipart upload: {} (UploadId={})",
            self.key,
            self.upload_id
        );
        Ok(())
    }
}

/// Fetch the remote object size, retrying transient failures.
pub async fn remote_size<S: PartStore>(
    store: &S,
    key: &str,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    with_retry("head_object", |_| store.object_size(key), retry, cancel)
        .await
        .map(|(size, _)| size)
        .map_err(|failure| failure.into_remote_error("head_object"))
}
