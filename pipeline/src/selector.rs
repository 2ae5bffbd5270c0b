//! Deciding which images still need inference for a pipeline.

use crate::error::{PipelineError, Result};
use common::logging::{self, JobLogger};
use common::models::{Pipeline, SourceImage};
use common::{AlgorithmId, CollectionId, DbError, DbResult, DeploymentId, SourceImageId};
use std::collections::HashSet;
use storage::StorageManager;
use tracing::debug;

/// Outcome of checking one image against a pipeline's registered algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// No detection from any of the pipeline's algorithms.
    FirstTime,
    /// A detection from the pipeline has no classification at all.
    Unclassified,
    /// Detections are classified, but some not by the pipeline's algorithms.
    NeedsReclassification,
    AlreadyProcessed,
}

impl Selection {
    pub fn needs_processing(self) -> bool {
        !matches!(self, Selection::AlreadyProcessed)
    }
}

/// Classifies one image against the `registered` algorithm set.
pub fn select_image(
    storage: &StorageManager,
    image: &SourceImage,
    registered: &HashSet<AlgorithmId>,
) -> DbResult<Selection> {
    let detections: Vec<_> = storage
        .detections_for_image(&image.id)?
        .into_iter()
        .filter(|d| registered.contains(&d.detection_algorithm_id))
        .collect();

    if detections.is_empty() {
        return Ok(Selection::FirstTime);
    }

    let mut classifications = Vec::with_capacity(detections.len());
    for detection in &detections {
        classifications.push(storage.classifications_for_detection(&detection.id)?);
    }

    if classifications.iter().any(Vec::is_empty) {
        return Ok(Selection::Unclassified);
    }

    let unclassified_by_pipeline = classifications
        .iter()
        .any(|found| !found.iter().any(|c| registered.contains(&c.algorithm_id)));
    if unclassified_by_pipeline {
        return Ok(Selection::NeedsReclassification);
    }

    Ok(Selection::AlreadyProcessed)
}

/// Lazily yields the images that still need inference by `pipeline`.
///
/// The registered algorithm set is read once, when this is called. Source
/// order is preserved.
pub fn filter_processed_images<'a, I>(
    storage: &'a StorageManager,
    pipeline: &'a Pipeline,
    images: I,
) -> DbResult<impl Iterator<Item = DbResult<SourceImage>> + 'a>
where
    I: IntoIterator<Item = SourceImage>,
    I::IntoIter: 'a,
{
    let registered = storage.pipeline_algorithm_ids(&pipeline.id)?;

    Ok(images.into_iter().filter_map(move |image| {
        let selection = match select_image(storage, &image, &registered) {
            Ok(selection) => selection,
            Err(e) => return Some(Err(e)),
        };
        match selection {
            Selection::FirstTime => {
                debug!("Image {} has no existing detections from pipeline {}", image, pipeline);
            }
            Selection::Unclassified => {
                debug!(
                    "Image {} has existing detections with no classifications from pipeline {}",
                    image, pipeline
                );
            }
            Selection::NeedsReclassification => {
                tracing::warn!(
                    "Image {} has existing detections that haven't been classified by the pipeline {}, \
                     but detections cannot be reclassified yet. Processing the image from scratch.",
                    image,
                    pipeline
                );
            }
            Selection::AlreadyProcessed => {
                debug!(
                    "Image {} has existing detections classified by the pipeline {}, skipping",
                    image, pipeline
                );
                return None;
            }
        }
        Some(Ok(image))
    }))
}

/// Where the images of a processing run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Images(Vec<SourceImageId>),
    Collection(CollectionId),
    Deployment(DeploymentId),
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Images(ids) => write!(f, "{} selected images", ids.len()),
            ImageSource::Collection(id) => write!(f, "collection {}", id),
            ImageSource::Deployment(id) => write!(f, "deployment {}", id),
        }
    }
}

/// Images picked for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedImages {
    pub images: Vec<SourceImage>,
    /// Number of images in the source before filtering.
    pub total: usize,
}

/// Resolves `source` into images, dropping already processed ones when
/// `skip_processed` is set and a pipeline is given.
pub fn collect_images(
    storage: &StorageManager,
    source: &ImageSource,
    pipeline: Option<&Pipeline>,
    skip_processed: bool,
    job: Option<&dyn JobLogger>,
) -> Result<CollectedImages> {
    let images = match source {
        ImageSource::Images(ids) if ids.is_empty() => {
            return Err(PipelineError::Configuration(
                "must specify a collection, a deployment or a list of images".to_string(),
            ));
        }
        ImageSource::Images(ids) => {
            let mut images = Vec::with_capacity(ids.len());
            for id in ids {
                let image = storage
                    .get_source_image(id)?
                    .ok_or_else(|| PipelineError::Lookup(format!("source image {}", id)))?;
                images.push(image);
            }
            images
        }
        ImageSource::Collection(id) => storage.images_in_collection(id).map_err(|e| match e {
            DbError::NotFound(what) => PipelineError::Lookup(what),
            other => other.into(),
        })?,
        ImageSource::Deployment(id) => storage.images_for_deployment(id)?,
    };
    let total_images = images.len();

    let images = match pipeline {
        Some(pipeline) if skip_processed => {
            logging::info(
                job,
                &format!(
                    "Filtering images that have already been processed by pipeline {}",
                    pipeline
                ),
            );
            filter_processed_images(storage, pipeline, images)?.collect::<DbResult<Vec<_>>>()?
        }
        _ => {
            logging::info(job, "NOT filtering images that have already been processed");
            images
        }
    };

    logging::info(
        job,
        &format!("Found {} out of {} images to process", images.len(), total_images),
    );
    Ok(CollectedImages {
        images,
        total: total_images,
    })
}
