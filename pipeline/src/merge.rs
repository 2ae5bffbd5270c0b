//! Folding inference responses into the store.
//!
//! Merging is idempotent on detections: the same response merged twice finds
//! the detections created by the first merge. Classifications are appended
//! on every merge and are not deduplicated.

use crate::error::{PipelineError, Result};
use crate::registry::AlgorithmRegistry;
use crate::schemas::{algorithm_name, ClassificationResponse, DetectionResponse, PipelineResponse};
use chrono::Utc;
use common::logging::{self, JobLogger};
use common::models::{
    Algorithm, Classification, Detection, Occurrence, Pipeline, SourceImage, TaxaList, Taxon,
};
use common::{AlgorithmId, ClassificationId, SourceImageId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use storage::{DetectionDraft, StorageManager};
use tracing::debug;

/// A record that did not exist before the merge.
#[derive(Debug, Clone, PartialEq)]
pub enum CreatedRecord {
    Pipeline(Pipeline),
    Algorithm(Algorithm),
    TaxaList(TaxaList),
    Taxon(Taxon),
    Detection(Detection),
    Classification(Classification),
    Occurrence(Occurrence),
}

/// The type of a [`CreatedRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Pipeline,
    Algorithm,
    TaxaList,
    Taxon,
    Detection,
    Classification,
    Occurrence,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Pipeline => "pipeline",
            RecordKind::Algorithm => "algorithm",
            RecordKind::TaxaList => "taxa list",
            RecordKind::Taxon => "taxon",
            RecordKind::Detection => "detection",
            RecordKind::Classification => "classification",
            RecordKind::Occurrence => "occurrence",
        };
        f.write_str(name)
    }
}

impl CreatedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CreatedRecord::Pipeline(_) => RecordKind::Pipeline,
            CreatedRecord::Algorithm(_) => RecordKind::Algorithm,
            CreatedRecord::TaxaList(_) => RecordKind::TaxaList,
            CreatedRecord::Taxon(_) => RecordKind::Taxon,
            CreatedRecord::Detection(_) => RecordKind::Detection,
            CreatedRecord::Classification(_) => RecordKind::Classification,
            CreatedRecord::Occurrence(_) => RecordKind::Occurrence,
        }
    }
}

/// State gathered while walking one response.
#[derive(Debug, Default)]
pub struct MergeAccumulator {
    created: Vec<CreatedRecord>,
    updated_detections: usize,
    touched_images: Vec<SourceImageId>,
    seen_images: HashSet<SourceImageId>,
    algorithms_used: Vec<Algorithm>,
    seen_algorithms: HashSet<AlgorithmId>,
}

impl MergeAccumulator {
    pub fn created(&mut self, record: CreatedRecord) {
        self.created.push(record);
    }

    pub fn updated_detection(&mut self) {
        self.updated_detections += 1;
    }

    pub fn touch_image(&mut self, id: &SourceImageId) {
        if self.seen_images.insert(id.clone()) {
            self.touched_images.push(id.clone());
        }
    }

    pub fn use_algorithm(&mut self, algorithm: &Algorithm) {
        if self.seen_algorithms.insert(algorithm.id.clone()) {
            self.algorithms_used.push(algorithm.clone());
        }
    }

    pub fn touched_images(&self) -> &[SourceImageId] {
        &self.touched_images
    }

    pub fn algorithms_used(&self) -> &[Algorithm] {
        &self.algorithms_used
    }

    fn finish(self, pipeline: Pipeline, registered_algorithms: Vec<Algorithm>) -> MergeOutcome {
        MergeOutcome {
            pipeline,
            created: self.created,
            updated_detections: self.updated_detections,
            touched_images: self.touched_images,
            registered_algorithms,
        }
    }
}

/// What a merge changed.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub pipeline: Pipeline,
    /// Newly created records, in creation order.
    pub created: Vec<CreatedRecord>,
    /// Existing detections whose crop path was backfilled.
    pub updated_detections: usize,
    pub touched_images: Vec<SourceImageId>,
    /// Algorithms added to the pipeline's registry by this merge.
    pub registered_algorithms: Vec<Algorithm>,
}

impl MergeOutcome {
    pub fn count(&self, kind: RecordKind) -> usize {
        self.created.iter().filter(|r| r.kind() == kind).count()
    }

    pub fn created_detections(&self) -> impl Iterator<Item = &Detection> {
        self.created.iter().filter_map(|r| match r {
            CreatedRecord::Detection(d) => Some(d),
            _ => None,
        })
    }

    pub fn created_classifications(&self) -> impl Iterator<Item = &Classification> {
        self.created.iter().filter_map(|r| match r {
            CreatedRecord::Classification(c) => Some(c),
            _ => None,
        })
    }
}

/// Writes pipeline responses into a [`StorageManager`].
pub struct ResultMerger<'a> {
    storage: &'a StorageManager,
    registry: AlgorithmRegistry<'a>,
}

impl<'a> ResultMerger<'a> {
    pub fn new(storage: &'a StorageManager) -> Self {
        Self {
            storage,
            registry: AlgorithmRegistry::new(storage),
        }
    }

    /// Merges one response.
    ///
    /// The response is checked completely before anything is written. Once
    /// writing starts, a failure leaves the records merged so far in place.
    ///
    /// # Errors
    ///
    /// - `PipelineError::ContractViolation` for an entry without an algorithm
    ///   name or a classification without scores
    /// - `PipelineError::Lookup` for an unknown source image
    /// - `PipelineError::Storage` if the database fails
    pub fn merge(
        &self,
        response: &PipelineResponse,
        job: Option<&dyn JobLogger>,
    ) -> Result<MergeOutcome> {
        let images = self.validate(response)?;
        logging::info(job, "Saving results");

        let mut acc = MergeAccumulator::default();
        let pipeline = self.resolve_pipeline(&response.pipeline, &mut acc, job)?;

        for detection_resp in &response.detections {
            let image = images.get(&detection_resp.source_image_id).ok_or_else(|| {
                PipelineError::Lookup(format!("source image {}", detection_resp.source_image_id))
            })?;
            acc.touch_image(&image.id);

            let mut detection = self.merge_detection(detection_resp, image, &mut acc)?;
            for classification in &detection_resp.classifications {
                self.merge_classification(&mut detection, image, classification, &mut acc)?;
            }
        }

        for image_id in acc.touched_images() {
            self.storage.refresh_source_image(image_id)?;
        }

        let registered = self
            .registry
            .register_all(&pipeline, acc.algorithms_used(), job)?;

        let outcome = acc.finish(pipeline, registered);
        if !outcome.created.is_empty() {
            logging::info(job, &format!("Created {} objects", outcome.created.len()));
        }
        Ok(outcome)
    }

    /// Checks the response contract and loads every referenced image.
    fn validate(&self, response: &PipelineResponse) -> Result<HashMap<String, SourceImage>> {
        response.validate()?;

        let mut images = HashMap::new();
        for detection in &response.detections {
            if images.contains_key(&detection.source_image_id) {
                continue;
            }
            let id = SourceImageId::new(detection.source_image_id.as_str());
            let image = self
                .storage
                .get_source_image(&id)?
                .ok_or_else(|| PipelineError::Lookup(format!("source image {}", id)))?;
            images.insert(detection.source_image_id.clone(), image);
        }
        Ok(images)
    }

    fn resolve_pipeline(
        &self,
        slug: &str,
        acc: &mut MergeAccumulator,
        job: Option<&dyn JobLogger>,
    ) -> Result<Pipeline> {
        let (pipeline, created) = self.storage.get_or_create_pipeline_by_slug(slug)?;
        if created {
            logging::warn(
                job,
                &format!(
                    "Pipeline choice returned by the ML backend was not recognized! {}",
                    pipeline
                ),
            );
            if pipeline.version > 1 {
                logging::warn(
                    job,
                    &format!(
                        "A pipeline named '{}' already exists, registered '{}' as version {}",
                        pipeline.name, pipeline.slug, pipeline.version
                    ),
                );
            }
            acc.created(CreatedRecord::Pipeline(pipeline.clone()));
        }
        Ok(pipeline)
    }

    fn resolve_algorithm(
        &self,
        name: Option<&str>,
        acc: &mut MergeAccumulator,
    ) -> Result<Algorithm> {
        let name = name.ok_or_else(|| {
            PipelineError::ContractViolation("no algorithm was specified in the results".to_string())
        })?;
        let (algorithm, created) = self.storage.get_or_create_algorithm(name)?;
        if created {
            acc.created(CreatedRecord::Algorithm(algorithm.clone()));
        }
        acc.use_algorithm(&algorithm);
        Ok(algorithm)
    }

    fn merge_detection(
        &self,
        response: &DetectionResponse,
        image: &SourceImage,
        acc: &mut MergeAccumulator,
    ) -> Result<Detection> {
        let algorithm = self.resolve_algorithm(algorithm_name(&response.algorithm), acc)?;
        let crop_path = response
            .crop_image_url
            .as_deref()
            .filter(|url| !url.is_empty());
        let draft = DetectionDraft {
            bbox: response.bbox.into(),
            detection_time: response.timestamp,
            path: crop_path.map(str::to_string),
        };

        let (detection, created) =
            self.storage
                .get_or_create_detection(image, &algorithm.id, &draft)?;
        if created {
            debug!("Created new detection {} on image {}", detection.id, image);
            acc.created(CreatedRecord::Detection(detection.clone()));
            return Ok(detection);
        }

        if let Some(path) = crop_path {
            if let Some(updated) = self.storage.backfill_detection_path(&detection.id, path)? {
                debug!("Updated existing detection {} with crop {}", updated.id, path);
                acc.updated_detection();
                return Ok(updated);
            }
        }
        Ok(detection)
    }

    fn merge_classification(
        &self,
        detection: &mut Detection,
        image: &SourceImage,
        response: &ClassificationResponse,
        acc: &mut MergeAccumulator,
    ) -> Result<()> {
        let algorithm = self.resolve_algorithm(algorithm_name(&response.algorithm), acc)?;

        let (taxa_list, created) = self
            .storage
            .get_or_create_taxa_list(&TaxaList::name_for_algorithm(&algorithm.name))?;
        if created {
            acc.created(CreatedRecord::TaxaList(taxa_list.clone()));
        }

        let (taxon, created) = self.storage.get_or_create_taxon(&response.classification)?;
        if created {
            acc.created(CreatedRecord::Taxon(taxon.clone()));
        }
        self.storage.add_taxon_to_list(&taxa_list.id, &taxon.id)?;

        let score = response.score().ok_or_else(|| {
            PipelineError::ContractViolation(format!(
                "classification '{}' has no scores",
                response.classification
            ))
        })?;
        let classification = Classification {
            id: ClassificationId::generate(),
            detection_id: detection.id.clone(),
            taxon_id: taxon.id.clone(),
            algorithm_id: algorithm.id.clone(),
            score,
            timestamp: Utc::now(),
        };
        self.storage.insert_classification(&classification)?;
        acc.created(CreatedRecord::Classification(classification));

        // One occurrence per detection until tracking exists; the first
        // classification sets its determination.
        if detection.occurrence_id.is_none() {
            let (linked, occurrence) = self.storage.ensure_occurrence(&detection.id, || {
                Occurrence::from_source_image(image, &taxon, score)
            })?;
            *detection = linked;
            if let Some(occurrence) = occurrence {
                acc.created(CreatedRecord::Occurrence(occurrence));
            }
        }
        Ok(())
    }
}
