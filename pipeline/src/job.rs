//! End-to-end processing run: select, submit in batches, merge.

use crate::client::PipelineClient;
use crate::error::{PipelineError, Result};
use crate::merge::ResultMerger;
use crate::selector::{collect_images, ImageSource};
use common::logging::{self, JobLogger, JobStatus};
use common::models::Pipeline;
use serde::{Deserialize, Serialize};
use storage::StorageManager;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Leave out images the pipeline has already fully processed.
    pub skip_processed: bool,
    /// Images per request. `None` sends everything in one request.
    pub batch_size: Option<usize>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            skip_processed: true,
            batch_size: None,
        }
    }
}

/// Totals of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub total_images: usize,
    pub selected_images: usize,
    pub batches: usize,
    /// Detections returned by the service.
    pub detections: usize,
    /// Classifications returned by the service.
    pub classifications: usize,
    /// Records created by merging.
    pub created: usize,
    pub updated_detections: usize,
}

/// Runs one pipeline over one image source.
pub struct PipelineJob<'a> {
    storage: &'a StorageManager,
    client: &'a PipelineClient,
    pipeline: Pipeline,
    options: JobOptions,
}

impl<'a> PipelineJob<'a> {
    pub fn new(storage: &'a StorageManager, client: &'a PipelineClient, pipeline: Pipeline) -> Self {
        Self {
            storage,
            client,
            pipeline,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Processes `source`, reporting status transitions to `job`.
    ///
    /// Batches merged before a failure or cancellation stay merged. A batch
    /// whose request was cancelled is never merged.
    pub async fn run(
        &self,
        source: &ImageSource,
        job: Option<&dyn JobLogger>,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        set_status(job, JobStatus::Started);
        let result = self.run_batches(source, job, cancel).await;

        match &result {
            Ok(report) => {
                logging::info(
                    job,
                    &format!(
                        "Processed {} of {} images in {} batches",
                        report.selected_images, report.total_images, report.batches
                    ),
                );
                set_status(job, JobStatus::Success);
            }
            Err(PipelineError::Cancelled) => set_status(job, JobStatus::Cancelled),
            Err(e) => {
                logging::warn(job, &format!("Pipeline job failed: {}", e));
                set_status(job, JobStatus::Failure);
            }
        }
        result
    }

    async fn run_batches(
        &self,
        source: &ImageSource,
        job: Option<&dyn JobLogger>,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        let collected = collect_images(
            self.storage,
            source,
            Some(&self.pipeline),
            self.options.skip_processed,
            job,
        )?;

        let mut report = JobReport {
            total_images: collected.total,
            selected_images: collected.images.len(),
            ..JobReport::default()
        };
        if collected.images.is_empty() {
            logging::info(job, "No images to process");
            return Ok(report);
        }

        let batch_size = self
            .options
            .batch_size
            .filter(|size| *size > 0)
            .unwrap_or(collected.images.len());
        let merger = ResultMerger::new(self.storage);

        for batch in collected.images.chunks(batch_size) {
            let response = self
                .client
                .submit_cancellable(&self.pipeline, batch, job, cancel)
                .await?;
            let outcome = merger.merge(&response, job)?;

            report.batches += 1;
            report.detections += response.detections.len();
            report.classifications += response.classification_count();
            report.created += outcome.created.len();
            report.updated_detections += outcome.updated_detections;
        }
        Ok(report)
    }
}

fn set_status(job: Option<&dyn JobLogger>, status: JobStatus) {
    tracing::debug!("Job status: {:?}", status);
    if let Some(job) = job {
        job.set_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::logging::MemoryJobLogger;
    use common::models::SourceImage;
    use common::DeploymentId;

    #[tokio::test]
    async fn test_empty_selection_skips_submission() {
        let storage = StorageManager::temporary().unwrap();
        let client = PipelineClient::new();
        // No endpoint: any submission attempt would fail.
        let (pipeline, _) = storage.save_pipeline(Pipeline::new("Moth Detector")).unwrap();
        let job = MemoryJobLogger::new();

        let report = PipelineJob::new(&storage, &client, pipeline)
            .run(
                &ImageSource::Deployment(DeploymentId::new("empty")),
                Some(&job),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.batches, 0);
        assert_eq!(report.total_images, 0);
        assert_eq!(job.status(), Some(JobStatus::Success));
    }

    #[tokio::test]
    async fn test_configuration_error_marks_failure() {
        let storage = StorageManager::temporary().unwrap();
        storage
            .save_source_image(&SourceImage::new("img_1", "dep_1", "a.jpg", Utc::now()))
            .unwrap();
        let client = PipelineClient::new();
        let (pipeline, _) = storage.save_pipeline(Pipeline::new("Moth Detector")).unwrap();
        let job = MemoryJobLogger::new();

        let err = PipelineJob::new(&storage, &client, pipeline)
            .run(
                &ImageSource::Deployment(DeploymentId::new("dep_1")),
                Some(&job),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(job.status(), Some(JobStatus::Failure));
    }
}
