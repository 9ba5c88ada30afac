//! Bounded pool of upload workers.
//!
//! Workers pull part descriptors from a shared queue and send their results
//! back over a channel; the coordinating task is the only one that touches the
//! session. The first part that fails for good stops the dispatch of new parts;
//! parts already on the wire are allowed to finish.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UploadError};
use crate::multipart::{PartResult, UploadSession};
use crate::plan::PartDescriptor;
use crate::progress::Progress;
use crate::retry::{with_retry, RetryConfig};
use crate::store::PartStore;

/// Everything a worker needs besides the part itself.
struct PartContext<S> {
    store: Arc<S>,
    source: PathBuf,
    key: String,
    upload_id: String,
    retry: RetryConfig,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

pub struct PoolConfig {
    pub workers: usize,
    pub retry: RetryConfig,
}

/// Upload every part into `session`.
///
/// Returns once all dispatched parts have resolved. On failure the error of
/// the first part that gave up is returned and the session is left for the
/// caller to abort. `shutdown` stops dispatch like a failure does and yields
/// `UploadError::Cancelled`.
pub async fn upload_parts<S: PartStore>(
    session: &mut UploadSession<S>,
    source: &Path,
    parts: &[PartDescriptor],
    config: &PoolConfig,
    progress: Arc<Progress>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let cancel = shutdown.child_token();
    let ctx = Arc::new(PartContext {
        store: session.store(),
        source: source.to_path_buf(),
        key: session.key().to_string(),
        upload_id: session.upload_id().to_string(),
        retry: config.retry.clone(),
        progress,
        cancel: cancel.clone(),
    });
    let queue = Arc::new(Mutex::new(parts.iter().copied().collect::<VecDeque<_>>()));
    let workers = config.workers.clamp(1, parts.len().max(1));
    let (tx, mut rx) = mpsc::channel(workers);

    log::info!("Uploading {} parts with {} workers", parts.len(), workers);

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        tasks.spawn(worker(ctx.clone(), queue.clone(), tx.clone()));
    }
    drop(tx);

    let mut first_error = None;
    while let Some(outcome) = rx.recv().await {
        match outcome {
            Ok(result) => session.record(result),
            Err(UploadError::Cancelled) => {}
            Err(err) => {
                if first_error.is_none() {
                    log::error!("{}; no further parts will be dispatched", err);
                    cancel.cancel();
                    first_error = Some(err);
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    if shutdown.is_cancelled() {
        return Err(UploadError::Cancelled);
    }
    Ok(())
}

async fn worker<S: PartStore>(
    ctx: Arc<PartContext<S>>,
    queue: Arc<Mutex<VecDeque<PartDescriptor>>>,
    tx: mpsc::Sender<Result<PartResult>>,
) {
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let Some(part) = next else { break };

        let outcome = upload_part(&ctx, part).await;
        let failed = outcome.is_err();
        if tx.send(outcome).await.is_err() || failed {
            break;
        }
    }
}

async fn upload_part<S: PartStore>(ctx: &PartContext<S>, part: PartDescriptor) -> Result<PartResult> {
    log::debug!(
        "Part {}: reading bytes {}-{}",
        part.number,
        part.offset,
        part.end()
    );
    let data = read_range(&ctx.source, part.offset, part.length)
        .await
        .map_err(|source| UploadError::Source {
            path: ctx.source.clone(),
            source,
        })?;

    let label = format!("Part {}", part.number);
    let (etag, attempts) = with_retry(
        &label,
        |_| {
            ctx.store
                .upload_part(&ctx.key, &ctx.upload_id, part.number, data.clone())
        },
        &ctx.retry,
        &ctx.cancel,
    )
    .await
    .map_err(|failure| failure.into_part_error(part.number))?;

    ctx.progress.part_done(part.number, part.length);
    Ok(PartResult {
        number: part.number,
        etag,
        bytes: part.length,
        attempts,
    })
}

/// Read `length` bytes at `offset` through a handle of our own.
async fn read_range(path: &Path, offset: u64, length: u64) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
