//! Pipeline declarations loaded from configuration files.

use crate::error::Result;
use crate::registry::AlgorithmRegistry;
use common::models::{Algorithm, Pipeline, PipelineStage};
use common::ProjectId;
use serde::{Deserialize, Serialize};
use storage::StorageManager;

fn default_version() -> u32 {
    1
}

/// One `[[pipelines]]` entry of the worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub version_name: String,
    /// Derived from `name` when absent.
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Names of the algorithms the pipeline is known to run.
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub projects: Vec<ProjectId>,
}

impl PipelineConfig {
    pub fn to_pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new(self.name.clone()).with_version(self.version);
        if let Some(slug) = &self.slug {
            pipeline = pipeline.with_slug(slug.clone());
        }
        if let Some(url) = &self.endpoint_url {
            pipeline = pipeline.with_endpoint_url(url.clone());
        }
        if !self.stages.is_empty() {
            pipeline = pipeline.with_stages(self.stages.clone());
        }
        pipeline.description = self.description.clone();
        pipeline.version_name = self.version_name.clone();
        pipeline.projects = self.projects.clone();
        pipeline
    }

    /// Upserts the pipeline and registers its declared algorithms.
    pub fn register(&self, storage: &StorageManager) -> Result<(Pipeline, Vec<Algorithm>)> {
        let (pipeline, created) = storage.save_pipeline(self.to_pipeline())?;
        if created {
            tracing::info!("Registered pipeline {}", pipeline);
        } else {
            tracing::info!("Updated pipeline {}", pipeline);
        }
        let algorithms = AlgorithmRegistry::new(storage).declare(&pipeline, &self.algorithms)?;
        Ok((pipeline, algorithms))
    }
}
