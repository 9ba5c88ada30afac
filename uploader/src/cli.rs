use clap::Parser;
use std::path::PathBuf;

/// Every flag is optional here: missing values are filled from the config
/// file and the environment, see `config::resolve`.
#[derive(Debug, Default, Parser)]
#[command(about = "Multipart upload a large file to S3 with retries and logging.")]
pub struct Cli {
    /// Path to config YAML (default: config.yaml in the working directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// S3 bucket name
    #[arg(short, long)]
    pub bucket: Option<String>,
    /// Size of each chunk in bytes (default: smallest of 5 MiB, 10 MiB, 20 MiB, ... giving at most 10000 parts)
    #[arg(short, long)]
    pub chunk_size: Option<u64>,
    /// Path of local file to upload
    #[arg(short, long)]
    pub file: Option<PathBuf>,
    /// Object key in S3
    #[arg(short, long)]
    pub key: Option<String>,
    /// AWS Access Key ID (default: AWS_ACCESS_KEY_ID environment variable)
    #[arg(short, long, alias = "access_key")]
    pub access_key: Option<String>,
    /// AWS Secret Access Key (default: AWS_SECRET_ACCESS_KEY environment variable)
    #[arg(short, long, alias = "secret_key")]
    pub secret_key: Option<String>,
    /// S3 API endpoint URL (default: S3_ENDPOINT environment variable)
    #[arg(short, long)]
    pub endpoint: Option<String>,
    /// S3 region name (default: S3_REGION or AWS_REGION environment variable)
    #[arg(short, long)]
    pub region: Option<String>,
    /// Content-Type to set on the uploaded object
    #[arg(long)]
    pub content_type: Option<String>,
    /// Only emit warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
    /// Maximum number of attempts for each request (default: MAX_RETRIES environment variable, or 5)
    #[arg(short, long)]
    pub max_retries: Option<u32>,
    /// Number of parallel upload workers (default: 4)
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Per-request timeout in seconds (default: 600)
    #[arg(long)]
    pub timeout: Option<u64>,
}
