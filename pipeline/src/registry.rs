//! Which algorithms a pipeline is known to use.

use crate::error::Result;
use common::logging::{self, JobLogger};
use common::models::{Algorithm, Pipeline};
use common::{AlgorithmId, PipelineId};
use storage::StorageManager;

/// Append-only view of the pipeline → algorithm registrations.
#[derive(Clone, Copy)]
pub struct AlgorithmRegistry<'a> {
    storage: &'a StorageManager,
}

impl<'a> AlgorithmRegistry<'a> {
    pub fn new(storage: &'a StorageManager) -> Self {
        Self { storage }
    }

    pub fn is_registered(&self, pipeline: &PipelineId, algorithm: &AlgorithmId) -> Result<bool> {
        Ok(self.storage.is_algorithm_registered(pipeline, algorithm)?)
    }

    /// Returns `true` if the algorithm was not registered before.
    pub fn register(&self, pipeline: &PipelineId, algorithm: &AlgorithmId) -> Result<bool> {
        Ok(self.storage.register_algorithm(pipeline, algorithm)?)
    }

    pub fn registered_algorithms(&self, pipeline: &PipelineId) -> Result<Vec<Algorithm>> {
        Ok(self.storage.pipeline_algorithms(pipeline)?)
    }

    /// Registers every algorithm the pipeline does not know yet, warning for
    /// each one. Returns the newly registered algorithms.
    pub fn register_all<'b, I>(
        &self,
        pipeline: &Pipeline,
        algorithms: I,
        job: Option<&dyn JobLogger>,
    ) -> Result<Vec<Algorithm>>
    where
        I: IntoIterator<Item = &'b Algorithm>,
    {
        let mut added = Vec::new();
        for algorithm in algorithms {
            if self.register(&pipeline.id, &algorithm.id)? {
                logging::warn(
                    job,
                    &format!(
                        "Added unregistered algorithm {} to pipeline {}",
                        algorithm.name, pipeline
                    ),
                );
                added.push(algorithm.clone());
            }
        }
        Ok(added)
    }

    /// Registers algorithms a pipeline declares up front, creating them by
    /// name when needed.
    pub fn declare(&self, pipeline: &Pipeline, names: &[String]) -> Result<Vec<Algorithm>> {
        let mut declared = Vec::with_capacity(names.len());
        for name in names {
            let (algorithm, created) = self.storage.get_or_create_algorithm(name)?;
            if created {
                tracing::info!("Created algorithm {} declared by pipeline {}", name, pipeline);
            }
            self.register(&pipeline.id, &algorithm.id)?;
            declared.push(algorithm);
        }
        Ok(declared)
    }
}
