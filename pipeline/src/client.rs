//! HTTP client for the external inference service.

use crate::error::{PipelineError, Result, TransportError};
use crate::schemas::{PipelineRequest, PipelineResponse};
use common::logging::{self, JobLogger};
use common::models::{Pipeline, SourceImage};
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest error body kept in a `TransportError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Sends batches of images to a pipeline's endpoint.
///
/// Retries and backoff are left to the caller.
#[derive(Debug, Clone)]
pub struct PipelineClient {
    client: Client,
}

impl Default for PipelineClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("ami-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    /// A client whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("ami-pipeline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Submits `images` to the pipeline's endpoint and waits for the full
    /// response.
    ///
    /// # Errors
    ///
    /// `PipelineError::Configuration` if the pipeline has no endpoint URL,
    /// `PipelineError::Transport` on any network, status or body failure.
    pub async fn submit(
        &self,
        pipeline: &Pipeline,
        images: &[SourceImage],
        job: Option<&dyn JobLogger>,
    ) -> Result<PipelineResponse> {
        let endpoint = endpoint_of(pipeline)?;
        let request = PipelineRequest::new(pipeline.slug.clone(), images);
        logging::info(
            job,
            &format!("Sending {} images to ML backend {}", images.len(), pipeline.slug),
        );

        let response = self.send(endpoint, &request).await?;
        log_results(&response, job);
        Ok(response)
    }

    /// Like [`PipelineClient::submit`], but gives up as soon as `cancel`
    /// fires.
    ///
    /// The in-flight request is dropped, which aborts the connection, and
    /// `PipelineError::Cancelled` is returned. A response is only returned
    /// once its body has been read completely.
    pub async fn submit_cancellable(
        &self,
        pipeline: &Pipeline,
        images: &[SourceImage],
        job: Option<&dyn JobLogger>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResponse> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                logging::warn(job, &format!("Request to ML backend {} was cancelled", pipeline.slug));
                Err(PipelineError::Cancelled)
            }
            result = self.submit(pipeline, images, job) => result,
        }
    }

    async fn send(&self, url: &str, request: &PipelineRequest) -> Result<PipelineResponse> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
        let parsed: PipelineResponse =
            serde_json::from_slice(&bytes).map_err(|e| TransportError::MalformedBody {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(empty) = parsed
            .detections
            .iter()
            .flat_map(|d| d.classifications.iter())
            .find(|c| c.scores.is_empty())
        {
            return Err(TransportError::MalformedBody {
                url: url.to_string(),
                reason: format!("classification '{}' has no scores", empty.classification),
            }
            .into());
        }

        Ok(parsed)
    }
}

fn endpoint_of(pipeline: &Pipeline) -> Result<&str> {
    pipeline.endpoint_url().ok_or_else(|| {
        PipelineError::Configuration(format!(
            "no endpoint URL configured for pipeline {}",
            pipeline
        ))
    })
}

fn log_results(response: &PipelineResponse, job: Option<&dyn JobLogger>) {
    let detections = response.detections.len();
    let classifications = response.classification_count();
    logging::debug(
        job,
        &format!(
            "Results from {}: {} detections, {} classifications",
            response.pipeline, detections, classifications
        ),
    );
    if detections > 0 {
        logging::info(job, &format!("Found {} detections", detections));
    }
    if classifications > 0 {
        logging::info(job, &format!("Found {} classifications", classifications));
    }
}
