//! Wire types exchanged with the inference service.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use common::models::{BoundingBox, SourceImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceImageRequest {
    pub id: String,
    pub url: String,
}

impl From<&SourceImage> for SourceImageRequest {
    fn from(image: &SourceImage) -> Self {
        Self {
            id: image.id.to_string(),
            url: image.public_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRequest {
    /// Slug of the pipeline to run.
    pub pipeline: String,
    pub source_images: Vec<SourceImageRequest>,
}

impl PipelineRequest {
    pub fn new(slug: impl Into<String>, images: &[SourceImage]) -> Self {
        Self {
            pipeline: slug.into(),
            source_images: images.iter().map(SourceImageRequest::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<BBox> for BoundingBox {
    fn from(bbox: BBox) -> Self {
        BoundingBox::new(bbox.x1, bbox.y1, bbox.x2, bbox.y2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResponse {
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Taxon label.
    pub classification: String,
    #[serde(default)]
    pub scores: Vec<f64>,
}

impl ClassificationResponse {
    /// Highest reported confidence, `None` when no score was reported.
    pub fn score(&self) -> Option<f64> {
        self.scores.iter().copied().reduce(f64::max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionResponse {
    pub source_image_id: String,
    #[serde(default)]
    pub algorithm: Option<String>,
    pub bbox: BBox,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub crop_image_url: Option<String>,
    #[serde(default)]
    pub classifications: Vec<ClassificationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineResponse {
    /// Slug echoed back by the service.
    pub pipeline: String,
    #[serde(default)]
    pub detections: Vec<DetectionResponse>,
}

impl PipelineResponse {
    pub fn classification_count(&self) -> usize {
        self.detections.iter().map(|d| d.classifications.len()).sum()
    }

    /// Checks the contract rules that need no database access.
    ///
    /// Every detection and classification must name its algorithm and every
    /// classification must carry at least one score.
    pub fn validate(&self) -> Result<()> {
        for (i, detection) in self.detections.iter().enumerate() {
            if algorithm_name(&detection.algorithm).is_none() {
                return Err(PipelineError::ContractViolation(format!(
                    "detection #{} for source image {} has no algorithm",
                    i, detection.source_image_id
                )));
            }
            for (j, classification) in detection.classifications.iter().enumerate() {
                if algorithm_name(&classification.algorithm).is_none() {
                    return Err(PipelineError::ContractViolation(format!(
                        "classification #{} of detection #{} has no algorithm",
                        j, i
                    )));
                }
                if classification.scores.is_empty() {
                    return Err(PipelineError::ContractViolation(format!(
                        "classification '{}' of detection #{} has no scores",
                        classification.classification, i
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The algorithm name of a response entry, ignoring blank values.
pub(crate) fn algorithm_name(algorithm: &Option<String>) -> Option<&str> {
    algorithm
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
}
