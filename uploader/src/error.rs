use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a transfer.
///
/// Transient transport failures never show up here: they stay inside the
/// retry loop as `RetryError::Retryable` and only surface, once exhausted, as
/// `ExhaustedRetries`.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source file is empty; nothing to upload")]
    EmptyFile,

    #[error("cannot read source {}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} rejected by remote store{} after {attempts} attempt(s)", part_suffix(.part))]
    Remote {
        operation: &'static str,
        part: Option<u32>,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("part {part}: exceeded max retries ({attempts} attempts)")]
    ExhaustedRetries {
        part: u32,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot complete upload: missing parts {missing:?}, unexpected parts {unexpected:?}")]
    IncompleteParts {
        missing: Vec<u32>,
        unexpected: Vec<u32>,
    },

    #[error("remote object is {actual} bytes but local file is {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("upload cancelled")]
    Cancelled,
}

fn part_suffix(part: &Option<u32>) -> String {
    part.map(|p| format!(" for part {p}")).unwrap_or_default()
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
