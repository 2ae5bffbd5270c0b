//! AMI worker: registers pipelines, imports images and runs ML processing
//! jobs from the command line.

use ami_worker::commands;
use ami_worker::config::{CliArgs, Command, WorkerConfig};
use ami_worker::import;
use anyhow::{Context, Result};
use clap::Parser;
use storage::StorageManager;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ami_worker=info,ami_pipeline=info,storage=info,common=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    let config = WorkerConfig::load(&args)?;

    if let Some(parent) = config.database.path.parent() {
        common::platform::ensure_db_directory(parent)
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    info!("Opening database at {:?}", config.database.path);
    let storage = StorageManager::new(&config.database.path)
        .with_context(|| format!("Failed to open database at {:?}", config.database.path))?;

    match &args.command {
        Command::Register => {
            let pipelines = commands::register(&storage, &config)?;
            info!("Registered {} pipelines", pipelines.len());
        }
        Command::ImportImages { file } => {
            let summary = import::import_file(&storage, file)?;
            storage.flush()?;
            info!(
                "Imported {} images and {} collections",
                summary.images, summary.collections
            );
        }
        Command::Process(process_args) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling the in-flight batch...");
                    on_interrupt.cancel();
                }
            });

            let outcome = commands::process(&storage, &config, process_args, &cancel).await?;
            let report = &outcome.report;
            info!(
                "Done: {} of {} images selected, {} batches, {} detections, {} classifications, \
                 {} records created, {} detections updated",
                report.selected_images,
                report.total_images,
                report.batches,
                report.detections,
                report.classifications,
                report.created,
                report.updated_detections
            );
            if !outcome.warnings.is_empty() {
                warn!("Job finished with {} warnings", outcome.warnings.len());
            }
        }
    }

    Ok(())
}
