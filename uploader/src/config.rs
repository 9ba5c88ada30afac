//! Layered configuration: command line, then config file, then environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::error::{Result, UploadError};
use crate::plan::check_chunk_size;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Keys accepted in the YAML config file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(alias = "file_path")]
    pub file: Option<PathBuf>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub chunk_size: Option<u64>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub content_type: Option<String>,
    pub timeout: Option<u64>,
    pub quiet: Option<bool>,
}

/// Environment variables, read without prefix.
#[derive(Debug, Default, Deserialize)]
pub struct EnvConfig {
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub aws_region: Option<String>,
    pub max_retries: Option<u32>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        envy::from_env::<EnvConfig>()
            .map_err(|err| UploadError::Config(format!("invalid environment: {err}")))
    }
}

/// What to upload and where. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub source: PathBuf,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub chunk_size: Option<u64>,
    pub workers: usize,
    /// Attempts per request, including the first one.
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub transfer: TransferSpec,
    pub s3: S3Config,
    pub quiet: bool,
}

/// Load the YAML config file.
///
/// Without an explicit path, `config.yaml` in the working directory is used
/// when it exists.
pub fn load_file(path: Option<&Path>) -> Result<FileConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(FileConfig::default());
            }
            default
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|err| {
        UploadError::Config(format!("cannot read config file {}: {err}", path.display()))
    })?;
    if contents.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|err| {
        UploadError::Config(format!("invalid config file {}: {err}", path.display()))
    })
}

/// Merge the three sources into one `Settings`, first value wins:
/// command line, config file, environment, defaults.
pub fn resolve(cli: &Cli, file: FileConfig, env: EnvConfig) -> Result<Settings> {
    let source = cli.file.clone().or(file.file);
    let bucket = cli.bucket.clone().or(file.bucket);
    let key = cli.key.clone().or(file.key);
    let region = cli
        .region
        .clone()
        .or(file.region)
        .or(env.s3_region)
        .or(env.aws_region);
    let endpoint = cli.endpoint.clone().or(file.endpoint).or(env.s3_endpoint);
    let access_key = cli
        .access_key
        .clone()
        .or(file.access_key)
        .or(env.aws_access_key_id);
    let secret_key = cli
        .secret_key
        .clone()
        .or(file.secret_key)
        .or(env.aws_secret_access_key);
    let content_type = cli.content_type.clone().or(file.content_type);
    let chunk_size = cli.chunk_size.or(file.chunk_size);
    let max_retries = cli
        .max_retries
        .or(file.max_retries)
        .or(env.max_retries)
        .unwrap_or(DEFAULT_MAX_RETRIES);
    let workers = cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
    let timeout = cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
    let quiet = cli.quiet || file.quiet.unwrap_or(false);

    let missing: Vec<&str> = [
        ("bucket", bucket.is_none()),
        ("key", key.is_none()),
        ("file", source.is_none()),
        ("region", region.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect();
    if !missing.is_empty() {
        return Err(UploadError::Config(format!(
            "missing required values: {}",
            missing.join(", ")
        )));
    }

    let (Some(access_key), Some(secret_key)) = (non_empty(access_key), non_empty(secret_key))
    else {
        return Err(UploadError::Config(
            "access_key and secret_key are required (set via config, CLI, or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY)"
                .into(),
        ));
    };

    if let Some(size) = chunk_size {
        check_chunk_size(size)?;
    }
    if max_retries < 1 {
        return Err(UploadError::Config("max_retries must be >= 1".into()));
    }
    if workers < 1 {
        return Err(UploadError::Config("workers must be >= 1".into()));
    }
    if timeout < 1 {
        return Err(UploadError::Config("timeout must be >= 1 second".into()));
    }

    Ok(Settings {
        transfer: TransferSpec {
            source: source.unwrap_or_default(),
            bucket: bucket.unwrap_or_default(),
            key: key.unwrap_or_default(),
            content_type,
            chunk_size,
            workers,
            max_retries,
        },
        s3: S3Config {
            endpoint: non_empty(endpoint),
            region: region.unwrap_or_default(),
            access_key,
            secret_key,
            timeout: Duration::from_secs(timeout),
        },
        quiet,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
