//! Pipelines, algorithms and the pipeline → algorithm registry relation.

use crate::storage_manager::{abort, compound_key, dangling, relation_prefix, StorageManager};
use common::models::{Algorithm, Pipeline};
use common::{AlgorithmId, DbError, DbResult, PipelineId};
use sled::transaction::TransactionResult;
use sled::Transactional;
use std::collections::HashSet;
use tracing::debug;

fn version_key(name: &str, version: u32) -> Vec<u8> {
    compound_key(&[name.as_bytes(), &version.to_be_bytes()])
}

impl StorageManager {
    // --- Pipelines ---

    pub fn get_pipeline(&self, id: &PipelineId) -> DbResult<Option<Pipeline>> {
        Self::get_record(&self.pipelines, id.as_bytes())
    }

    pub fn get_pipeline_by_slug(&self, slug: &str) -> DbResult<Option<Pipeline>> {
        match self.pipeline_slugs.get(slug.as_bytes())? {
            Some(id) => Self::get_record(&self.pipelines, &id),
            None => Ok(None),
        }
    }

    /// All pipelines ordered by name, then version.
    pub fn list_pipelines(&self) -> DbResult<Vec<Pipeline>> {
        let mut pipelines: Vec<Pipeline> = Self::all_records(&self.pipelines)?;
        pipelines.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(pipelines)
    }

    /// Inserts a pipeline, or updates the one with the same name and version.
    ///
    /// An updated pipeline keeps its stored id and creation time. A missing
    /// slug is derived from the name.
    ///
    /// # Errors
    ///
    /// `DbError::ConstraintViolation` if the slug belongs to a different
    /// pipeline; `DbError::InvalidOperation` if no slug can be derived.
    pub fn save_pipeline(&self, mut pipeline: Pipeline) -> DbResult<(Pipeline, bool)> {
        pipeline.ensure_slug();
        if pipeline.slug.is_empty() {
            return Err(DbError::InvalidOperation(format!(
                "cannot derive a slug for pipeline '{}'",
                pipeline.name
            )));
        }
        let version_key = version_key(&pipeline.name, pipeline.version);

        let outcome: TransactionResult<(Pipeline, bool), DbError> =
            (&self.pipelines, &self.pipeline_slugs, &self.pipeline_versions).transaction(
                |(pipelines, slugs, versions)| {
                    let mut record = pipeline.clone();
                    let existing_id = versions.get(&version_key)?;
                    let created = existing_id.is_none();

                    if let Some(existing_id) = existing_id {
                        let bytes = pipelines
                            .get(&existing_id)?
                            .ok_or_else(|| abort(dangling(&existing_id)))?;
                        let existing: Pipeline = bincode::deserialize(&bytes).map_err(abort)?;
                        record.id = existing.id;
                        record.created_at = existing.created_at;
                        if existing.slug != record.slug {
                            slugs.remove(existing.slug.as_bytes())?;
                        }
                    }

                    if let Some(owner) = slugs.get(record.slug.as_bytes())? {
                        if owner.as_ref() != record.id.as_bytes() {
                            return Err(abort(DbError::ConstraintViolation(format!(
                                "slug '{}' is already used by another pipeline",
                                record.slug
                            ))));
                        }
                    }

                    let bytes = bincode::serialize(&record).map_err(abort)?;
                    slugs.insert(record.slug.as_bytes(), record.id.as_bytes())?;
                    versions.insert(version_key.as_slice(), record.id.as_bytes())?;
                    pipelines.insert(record.id.as_bytes(), bytes)?;
                    Ok((record, created))
                },
            );

        Ok(outcome?)
    }

    /// Finds the pipeline with `slug`, creating a bare one named after the
    /// slug when none exists.
    ///
    /// A created pipeline takes the lowest version not yet used by a pipeline
    /// of the same name.
    pub fn get_or_create_pipeline_by_slug(&self, slug: &str) -> DbResult<(Pipeline, bool)> {
        let outcome: TransactionResult<(Pipeline, bool), DbError> =
            (&self.pipelines, &self.pipeline_slugs, &self.pipeline_versions).transaction(
                |(pipelines, slugs, versions)| {
                    if let Some(id) = slugs.get(slug.as_bytes())? {
                        let bytes = pipelines.get(&id)?.ok_or_else(|| abort(dangling(&id)))?;
                        let pipeline: Pipeline = bincode::deserialize(&bytes).map_err(abort)?;
                        return Ok((pipeline, false));
                    }

                    let mut pipeline = Pipeline::new(slug).with_slug(slug);
                    while versions
                        .get(version_key(&pipeline.name, pipeline.version))?
                        .is_some()
                    {
                        pipeline.version = pipeline.version.checked_add(1).ok_or_else(|| {
                            abort(DbError::ConstraintViolation(format!(
                                "no free version left for pipeline '{}'",
                                pipeline.name
                            )))
                        })?;
                    }

                    let bytes = bincode::serialize(&pipeline).map_err(abort)?;
                    slugs.insert(pipeline.slug.as_bytes(), pipeline.id.as_bytes())?;
                    versions.insert(
                        version_key(&pipeline.name, pipeline.version),
                        pipeline.id.as_bytes(),
                    )?;
                    pipelines.insert(pipeline.id.as_bytes(), bytes)?;
                    Ok((pipeline, true))
                },
            );

        let (pipeline, created) = outcome?;
        if created {
            debug!(slug = %pipeline.slug, version = pipeline.version, "Created pipeline");
        }
        Ok((pipeline, created))
    }

    // --- Pipeline → algorithm registry ---

    /// Adds `algorithm` to the pipeline's registered set.
    ///
    /// Returns `true` if it was not registered before.
    pub fn register_algorithm(
        &self,
        pipeline: &PipelineId,
        algorithm: &AlgorithmId,
    ) -> DbResult<bool> {
        let key = compound_key(&[pipeline.as_bytes(), algorithm.as_bytes()]);
        let previous = self.pipeline_algorithms.insert(key, &[] as &[u8])?;
        Ok(previous.is_none())
    }

    pub fn is_algorithm_registered(
        &self,
        pipeline: &PipelineId,
        algorithm: &AlgorithmId,
    ) -> DbResult<bool> {
        let key = compound_key(&[pipeline.as_bytes(), algorithm.as_bytes()]);
        Ok(self.pipeline_algorithms.contains_key(key)?)
    }

    /// Ids of the algorithms registered to a pipeline.
    pub fn pipeline_algorithm_ids(&self, pipeline: &PipelineId) -> DbResult<HashSet<AlgorithmId>> {
        let prefix = relation_prefix(pipeline.as_bytes());
        self.pipeline_algorithms
            .scan_prefix(&prefix)
            .keys()
            .map(|key| -> DbResult<AlgorithmId> {
                let key = key?;
                Ok(AlgorithmId::new(
                    String::from_utf8_lossy(&key[prefix.len()..]).into_owned(),
                ))
            })
            .collect()
    }

    /// Algorithms registered to a pipeline, in id order.
    pub fn pipeline_algorithms(&self, pipeline: &PipelineId) -> DbResult<Vec<Algorithm>> {
        Self::related_records(&self.pipeline_algorithms, &self.algorithms, pipeline.as_bytes())
    }

    // --- Algorithms ---

    /// Finds the algorithm called `name` or atomically creates it.
    pub fn get_or_create_algorithm(&self, name: &str) -> DbResult<(Algorithm, bool)> {
        Self::find_or_create(
            &self.algorithms,
            &self.algorithm_names,
            name.as_bytes(),
            || Algorithm::new(name),
            |algorithm| algorithm.id.as_bytes().to_vec(),
        )
    }

    pub fn get_algorithm(&self, id: &AlgorithmId) -> DbResult<Option<Algorithm>> {
        Self::get_record(&self.algorithms, id.as_bytes())
    }

    pub fn get_algorithm_by_name(&self, name: &str) -> DbResult<Option<Algorithm>> {
        match self.algorithm_names.get(name.as_bytes())? {
            Some(id) => Self::get_record(&self.algorithms, &id),
            None => Ok(None),
        }
    }

    pub fn list_algorithms(&self) -> DbResult<Vec<Algorithm>> {
        Self::all_records(&self.algorithms)
    }

    pub fn count_algorithms(&self) -> usize {
        self.algorithms.len()
    }
}
