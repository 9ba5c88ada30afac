use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli;
mod config;
mod error;
mod multipart;
mod plan;
mod pool;
mod progress;
mod retry;
mod s3;
mod store;
mod upload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Cli::parse();
    let file = config::load_file(args.config.as_deref())?;
    let env = config::EnvConfig::from_env()?;
    let settings = config::resolve(&args, file, env)?;

    let level = if settings.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let transfer = &settings.transfer;
    let store = s3::S3Store::new(
        &settings.s3,
        &transfer.bucket,
        transfer.content_type.as_deref(),
    )?;
    log::info!(
        "Region: {}; endpoint: {}",
        settings.s3.region,
        settings.s3.endpoint.as_deref().unwrap_or("AWS default")
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; waiting for in-flight parts before aborting");
            on_signal.cancel();
        }
    });

    let summary = upload::run(
        Arc::new(store),
        transfer,
        &upload::UploadOptions::default(),
        &shutdown,
    )
    .await?;
    log::info!(
        "Uploaded {} bytes in {} parts to {} (UploadId={})",
        summary.bytes,
        summary.parts,
        transfer.key,
        summary.upload_id
    );
    Ok(())
}
