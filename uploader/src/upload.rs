//! Drives one transfer: plan, initiate, upload parts, complete or abort, verify.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::TransferSpec;
use crate::error::{Result, UploadError};
use crate::multipart::{remote_size, SessionOptions, SessionState, UploadSession};
use crate::plan::PartPlan;
use crate::pool::{upload_parts, PoolConfig};
use crate::progress::{format_duration, Progress};
use crate::retry::RetryConfig;
use crate::store::PartStore;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub upload_id: String,
    pub parts: u32,
    pub bytes: u64,
    /// Attempts beyond the first, summed over all parts.
    pub retries: u32,
    pub elapsed: Duration,
}

impl UploadSummary {
    pub fn mb_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            f64::INFINITY
        }
    }
}

/// Knobs that production leaves at their defaults.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Backoff settings; `max_attempts` comes from `TransferSpec::max_retries`.
    pub retry: RetryConfig,
    /// Overrides the size-derived wait before probing a timed-out completion.
    pub completion_grace: Option<Duration>,
}

/// Upload `spec.source` to `spec.key`.
///
/// The source is sized and planned before the store is contacted. Any failure
/// after initiation aborts the upload before the error is returned.
pub async fn run<S: PartStore>(
    store: Arc<S>,
    spec: &TransferSpec,
    options: &UploadOptions,
    shutdown: &CancellationToken,
) -> Result<UploadSummary> {
    let metadata = tokio::fs::metadata(&spec.source)
        .await
        .map_err(|source| UploadError::Source {
            path: spec.source.clone(),
            source,
        })?;
    if !metadata.is_file() {
        return Err(UploadError::Source {
            path: spec.source.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }

    let file_size = metadata.len();
    let plan = PartPlan::new(file_size, spec.chunk_size)?;
    log::info!("Uploading to bucket: {}; key: {}", spec.bucket, spec.key);
    log::info!(
        "File size: {} bytes; will upload in {} parts of up to {} bytes each",
        file_size,
        plan.part_count(),
        plan.chunk_size
    );

    let retry = RetryConfig {
        max_attempts: spec.max_retries,
        ..options.retry.clone()
    };
    let mut session_options = SessionOptions::for_file(file_size, retry.clone());
    if let Some(grace) = options.completion_grace {
        session_options.completion_grace = grace;
    }

    let started = std::time::Instant::now();
    let mut session = UploadSession::initiate(
        store.clone(),
        &spec.key,
        plan.part_count(),
        session_options,
        shutdown,
    )
    .await?;

    let progress = Arc::new(Progress::new(file_size, plan.part_count()));
    let pool = PoolConfig {
        workers: spec.workers,
        retry: retry.clone(),
    };
    if let Err(err) = upload_parts(
        &mut session,
        &spec.source,
        &plan.parts,
        &pool,
        progress,
        shutdown,
    )
    .await
    {
        log::error!("Upload interrupted: {}", err);
        abort_quietly(&mut session).await;
        return Err(err);
    }

    if let Err(err) = session.complete(file_size).await {
        // still in progress: cancelled or never submitted
        if session.state() == SessionState::InProgress {
            log::error!("Completion interrupted: {}", err);
            abort_quietly(&mut session).await;
        }
        return Err(err);
    }

    // the completion call succeeding is not proof enough on stores that
    // merge asynchronously
    let remote = remote_size(store.as_ref(), &spec.key, &retry, &CancellationToken::new()).await?;
    match remote {
        Some(size) if size == file_size => {
            log::info!(
                "Verified upload: remote object size {} bytes matches local file size",
                size
            );
        }
        Some(size) => {
            log::error!(
                "Size mismatch: remote object is {} bytes, but local file is {} bytes",
                size,
                file_size
            );
            return Err(UploadError::SizeMismatch {
                expected: file_size,
                actual: size,
            });
        }
        None => {
            return Err(UploadError::SizeMismatch {
                expected: file_size,
                actual: 0,
            });
        }
    }

    let summary = UploadSummary {
        upload_id: session.upload_id().to_string(),
        parts: plan.part_count(),
        bytes: session.parts().map(|p| p.bytes).sum(),
        retries: session.parts().map(|p| p.attempts - 1).sum(),
        elapsed: started.elapsed(),
    };
    log::info!(
        "Upload Speed {:.2} MB/s, Duration {}, {} retried attempts",
        summary.mb_per_sec(),
        format_duration(summary.elapsed),
        summary.retries
    );
    Ok(summary)
}

async fn abort_quietly<S: PartStore>(session: &mut UploadSession<S>) {
    if let Err(err) = session.abort().await {
        log::error!(
            "Could not abort UploadId {} ({:?}): {:#}",
            session.upload_id(),
            session.state(),
            anyhow::Error::from(err)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MIB;
    use crate::store::testing::{Call, Fail, MemoryStore};
    use std::io::Write;
    use std::path::PathBuf;

    fn options() -> UploadOptions {
        UploadOptions {
            retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter_factor: 0.0,
            },
            completion_grace: Some(Duration::ZERO),
        }
    }

    fn spec(source: PathBuf, chunk_size: Option<u64>, workers: usize) -> TransferSpec {
        TransferSpec {
            source,
            bucket: "network-volume".into(),
            key: "inputs/clip.mp4".into(),
            content_type: Some("video/mp4".into()),
            chunk_size,
            workers,
            max_retries: 5,
        }
    }

    fn source_file(size: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_twelve_mib_in_three_parts() {
        let store = Arc::new(MemoryStore::new());
        let file = source_file(12 * MIB);
        let spec = spec(file.path().to_path_buf(), Some(5 * MIB), 1);

        let summary = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.parts, 3);
        assert_eq!(summary.bytes, 12 * MIB);
        assert_eq!(store.object("inputs/clip.mp4"), Some(12 * MIB));

        let calls = store.calls();
        assert_eq!(
            &calls[..4],
            &[Call::Create, Call::Part(1), Call::Part(2), Call::Part(3)]
        );
        match &calls[4] {
            Call::Complete(etags) => {
                assert_eq!(etags.len(), 3);
                assert!(etags[2].ends_with(&format!("-{}\"", 2 * MIB)));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(calls[5], Call::Head);
        assert!(!calls.contains(&Call::Abort));
    }

    #[tokio::test]
    async fn test_exhausted_part_aborts_upload() {
        let store = Arc::new(MemoryStore::new());
        store.fail_part(1, [Fail::Transient; 5]);
        let file = source_file(5 * MIB);
        let spec = spec(file.path().to_path_buf(), None, 4);

        let err = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::ExhaustedRetries {
                part: 1,
                attempts: 5,
                ..
            }
        ));
        assert_eq!(store.part_attempts(1), 5);
        let calls = store.calls();
        assert_eq!(calls.last(), Some(&Call::Abort));
        assert!(!calls.iter().any(|c| matches!(c, Call::Complete(_))));
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.object("inputs/clip.mp4"), None);
    }

    #[tokio::test]
    async fn test_chunk_below_floor_fails_before_network() {
        let store = Arc::new(MemoryStore::new());
        let file = source_file(12 * MIB);
        let spec = spec(file.path().to_path_buf(), Some(3 * MIB), 1);

        let err = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Config(_)));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_fails_before_network() {
        let store = Arc::new(MemoryStore::new());
        let file = tempfile::NamedTempFile::new().unwrap();
        let spec = spec(file.path().to_path_buf(), None, 1);

        let err = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::EmptyFile));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_network() {
        let store = Arc::new(MemoryStore::new());
        let spec = spec(PathBuf::from("/nonexistent/clip.mp4"), None, 1);

        let err = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Source { .. }));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_upload_with_retries() {
        let store = Arc::new(MemoryStore::new());
        store.fail_part(2, [Fail::Transient; 2]);
        store.fail_part(4, [Fail::Transient]);
        let file = source_file(23 * MIB + 5);
        let spec = spec(file.path().to_path_buf(), Some(5 * MIB), 3);

        let summary = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.parts, 5);
        assert_eq!(store.object("inputs/clip.mp4"), Some(23 * MIB + 5));
        assert_eq!(store.part_attempts(2), 3);
        assert_eq!(store.part_attempts(4), 2);
        assert_eq!(summary.retries, 3);
    }

    #[tokio::test]
    async fn test_rejected_completion_is_not_aborted() {
        let store = Arc::new(MemoryStore::new());
        store.fail_complete([Fail::Permanent], false);
        let file = source_file(MIB);
        let spec = spec(file.path().to_path_buf(), None, 1);

        let err = run(store.clone(), &spec, &options(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Remote {
                operation: "complete_multipart_upload",
                ..
            }
        ));
        assert!(!store.calls().contains(&Call::Abort));
    }

    #[tokio::test]
    async fn test_cancel_during_completion_wait_aborts() {
        let store = Arc::new(MemoryStore::new());
        store.fail_complete([Fail::Transient], false);
        let file = source_file(MIB);
        let spec = spec(file.path().to_path_buf(), None, 1);
        let shutdown = CancellationToken::new();
        let slow = UploadOptions {
            completion_grace: Some(Duration::from_secs(3600)),
            ..options()
        };

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = run(store.clone(), &spec, &slow, &shutdown).await.unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(store.calls().last(), Some(&Call::Abort));
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_is_aborted() {
        let store = Arc::new(MemoryStore::new());
        let file = source_file(MIB);
        let spec = spec(file.path().to_path_buf(), None, 1);
        let shutdown = CancellationToken::new();
        // every attempt fails, so the cancellation lands during backoff
        store.fail_part(1, [Fail::Transient; 5]);
        let slow = UploadOptions {
            retry: RetryConfig {
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                ..options().retry
            },
            ..options()
        };

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = run(store.clone(), &spec, &slow, &shutdown).await.unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(store.calls().last(), Some(&Call::Abort));
        assert_eq!(store.part_attempts(1), 1);
    }
}
