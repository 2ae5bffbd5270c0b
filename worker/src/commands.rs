//! Subcommand implementations.

use crate::config::{ProcessArgs, WorkerConfig};
use ami_pipeline::{JobOptions, JobReport, PipelineClient, PipelineJob};
use anyhow::{Context, Result};
use common::logging::{JobLogger, LogLevel, MemoryJobLogger};
use common::models::Pipeline;
use std::time::Duration;
use storage::StorageManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Saves every configured pipeline and registers its declared algorithms.
pub fn register(storage: &StorageManager, config: &WorkerConfig) -> Result<Vec<Pipeline>> {
    let mut pipelines = Vec::with_capacity(config.pipelines.len());
    for pipeline_config in &config.pipelines {
        let (pipeline, algorithms) = pipeline_config
            .register(storage)
            .with_context(|| format!("Failed to register pipeline {}", pipeline_config.name))?;
        info!("{} uses {} algorithms", pipeline, algorithms.len());
        pipelines.push(pipeline);
    }
    storage.flush()?;
    Ok(pipelines)
}

/// Finds a stored pipeline by slug, registering it from the configuration
/// on first use.
pub fn resolve_pipeline(
    storage: &StorageManager,
    config: &WorkerConfig,
    slug: &str,
) -> Result<Pipeline> {
    if let Some(pipeline) = storage.get_pipeline_by_slug(slug)? {
        return Ok(pipeline);
    }
    let pipeline_config = config
        .pipeline(slug)
        .with_context(|| format!("Unknown pipeline '{}'", slug))?;
    let (pipeline, _) = pipeline_config.register(storage)?;
    Ok(pipeline)
}

/// Result of a `process` run along with the job's log.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub report: JobReport,
    pub warnings: Vec<String>,
}

/// Runs the pipeline named in `args`, stopping when `cancel` fires.
pub async fn process(
    storage: &StorageManager,
    config: &WorkerConfig,
    args: &ProcessArgs,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome> {
    let pipeline = resolve_pipeline(storage, config, &args.pipeline)?;
    let source = args.image_source()?;
    let client = PipelineClient::with_timeout(Duration::from_secs(config.request_timeout_secs));
    let options = JobOptions {
        skip_processed: !args.all,
        batch_size: args.batch_size,
    };
    let job = MemoryJobLogger::new();

    info!("Processing {} with pipeline {}", source, pipeline);
    let result = PipelineJob::new(storage, &client, pipeline)
        .with_options(options)
        .run(&source, Some(&job as &dyn JobLogger), cancel)
        .await;
    storage.flush()?;

    let report = result.context("Pipeline job failed")?;
    Ok(ProcessOutcome {
        report,
        warnings: job.messages(LogLevel::Warn),
    })
}
