//! Data models for the storage layer.
//!
//! Every record is stored as a bincode value keyed by its identifier.
//! Relations that are sets (pipeline algorithms, taxa list members, image
//! detections) live in separate index trees owned by `storage`, so the records
//! here only carry single-valued links.

use crate::{
    AlgorithmId, ClassificationId, CollectionId, DeploymentId, DetectionId, EventId,
    OccurrenceId, PipelineId, ProjectId, SourceImageId, TaxaListId, TaxonId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Pipeline Configuration ---

/// A named, versioned pipeline pointing at one external inference endpoint.
///
/// The algorithms a pipeline is known to use are kept by the registry, not on
/// this record.
///
/// # Examples
///
/// ```
/// use common::models::Pipeline;
///
/// let pipeline = Pipeline::new("Moth Detector").with_endpoint_url("http://ml:2000/pipeline/process");
/// assert_eq!(pipeline.slug, "moth-detector");
/// assert_eq!(pipeline.version, 1);
/// assert!(pipeline.endpoint_url().is_some());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Unique identifier for this pipeline.
    pub id: PipelineId,
    /// Human readable name; unique together with `version`.
    pub name: String,
    /// URL-safe unique handle sent to the inference service.
    pub slug: String,
    pub description: String,
    pub version: u32,
    pub version_name: String,
    /// Inference endpoint; `None` means the pipeline cannot be submitted to.
    pub endpoint_url: Option<String>,
    /// Ordered display stages. The backend may process data in any way.
    pub stages: Vec<PipelineStage>,
    pub projects: Vec<ProjectId>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Creates version 1 of a pipeline with a slug derived from `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: PipelineId::generate(),
            slug: crate::slugify(&name),
            name,
            description: String::new(),
            version: 1,
            version_name: String::new(),
            endpoint_url: None,
            stages: default_stages(),
            projects: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn with_stages(mut self, stages: Vec<PipelineStage>) -> Self {
        self.stages = stages;
        self
    }

    /// Fills in the slug from the name when it was left empty.
    pub fn ensure_slug(&mut self) {
        if self.slug.trim().is_empty() {
            self.slug = crate::slugify(&self.name);
        }
    }

    /// The configured endpoint, ignoring blank values.
    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{} ({})", self.name, self.version, self.slug)
    }
}

/// A display stage of a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<StageParam>,
}

/// A named parameter shown for a pipeline stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageParam {
    pub key: String,
    pub name: String,
    #[serde(with = "json_value", default)]
    pub value: serde_json::Value,
}

/// Stages assigned to a pipeline that declares none.
pub fn default_stages() -> Vec<PipelineStage> {
    Vec::new()
}

/// Serializes `serde_json::Value` as a JSON string so it survives bincode.
mod json_value {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &serde_json::Value, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            return value.serialize(serializer);
        }
        let json_string = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
        json_string.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            return serde_json::Value::deserialize(deserializer);
        }
        let json_string = String::deserialize(deserializer)?;
        serde_json::from_str(&json_string).map_err(serde::de::Error::custom)
    }
}

// --- Algorithms ---

/// A model or procedure that produced a detection or classification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Algorithm {
    pub id: AlgorithmId,
    /// Lookup key when merging inference results.
    pub name: String,
    pub version: u32,
    /// Free-form description.
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Algorithm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: AlgorithmId::generate(),
            name: name.into(),
            version: 1,
            label: None,
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

// --- Source Images ---

/// A frame captured by a field deployment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceImage {
    pub id: SourceImageId,
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    /// Storage key relative to `public_base_url`, or an absolute URL.
    pub path: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Recomputed by the storage layer on every save.
    #[serde(default)]
    pub detections_count: u32,
}

impl SourceImage {
    pub fn new(
        id: impl Into<SourceImageId>,
        deployment_id: impl Into<DeploymentId>,
        path: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_id: deployment_id.into(),
            event_id: None,
            project_id: None,
            path: path.into(),
            public_base_url: None,
            timestamp,
            width: None,
            height: None,
            size: None,
            detections_count: 0,
        }
    }

    /// URL the inference service fetches this image from.
    ///
    /// # Examples
    ///
    /// ```
    /// use common::models::SourceImage;
    ///
    /// let mut image = SourceImage::new("img_1", "dep_1", "/2023/07/frame.jpg", chrono::Utc::now());
    /// image.public_base_url = Some("https://cdn.example.org/ami/".to_string());
    /// assert_eq!(image.public_url(), "https://cdn.example.org/ami/2023/07/frame.jpg");
    /// ```
    pub fn public_url(&self) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        match self.public_base_url.as_deref() {
            Some(base) if !base.is_empty() => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.path.trim_start_matches('/')
            ),
            _ => self.path.clone(),
        }
    }
}

impl std::fmt::Display for SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.id, self.path)
    }
}

/// A named, ordered set of source images.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceImageCollection {
    pub id: CollectionId,
    pub name: String,
    pub image_ids: Vec<SourceImageId>,
}

// --- Detections & Classifications ---

/// Bounding box corners in image pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).abs()
    }

    /// Exact key used for detection deduplication.
    ///
    /// Coordinates are compared bit for bit, so `10.0` and `10.000001` are
    /// different boxes.
    pub fn key(&self) -> String {
        format!(
            "{:016x}:{:016x}:{:016x}:{:016x}",
            self.x1.to_bits(),
            self.y1.to_bits(),
            self.x2.to_bits(),
            self.y2.to_bits()
        )
    }
}

/// One bounding box within one source image, produced by one algorithm.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: DetectionId,
    pub source_image_id: SourceImageId,
    pub detection_algorithm_id: AlgorithmId,
    pub bbox: BoundingBox,
    /// Capture time, copied from the source image.
    pub timestamp: DateTime<Utc>,
    /// Time reported by the inference service.
    pub detection_time: Option<DateTime<Utc>>,
    /// Crop-image reference; empty until the service reports one.
    pub path: Option<String>,
    pub occurrence_id: Option<OccurrenceId>,
}

impl Detection {
    pub fn has_path(&self) -> bool {
        self.path.as_deref().is_some_and(|path| !path.is_empty())
    }
}

/// A taxon label and confidence attached to one detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Classification {
    pub id: ClassificationId,
    pub detection_id: DetectionId,
    pub taxon_id: TaxonId,
    pub algorithm_id: AlgorithmId,
    pub score: f64,
    /// Merge time.
    pub timestamp: DateTime<Utc>,
}

// --- Taxonomy ---

/// Taxonomic rank. `Unknown` marks provisional taxa created from labels never
/// seen before.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxonRank {
    Order,
    Superfamily,
    Family,
    Subfamily,
    Tribe,
    Subtribe,
    Genus,
    Species,
    #[default]
    Unknown,
}

/// A named taxonomic unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Taxon {
    pub id: TaxonId,
    /// Unique across the store.
    pub name: String,
    pub rank: TaxonRank,
    pub created_at: DateTime<Utc>,
}

impl Taxon {
    pub fn new(name: impl Into<String>, rank: TaxonRank) -> Self {
        Self {
            id: TaxonId::generate(),
            name: name.into(),
            rank,
            created_at: Utc::now(),
        }
    }
}

/// A named grouping of taxa; members are stored as a relation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaxaList {
    pub id: TaxaListId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl TaxaList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaxaListId::generate(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }

    /// Name of the list tracking labels returned by one classification algorithm.
    pub fn name_for_algorithm(algorithm_name: &str) -> String {
        format!("Taxa returned by {}", algorithm_name)
    }
}

// --- Occurrences ---

/// One physical organism sighting derived from a detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub event_id: Option<EventId>,
    pub deployment_id: DeploymentId,
    pub project_id: Option<ProjectId>,
    pub determination_id: TaxonId,
    pub determination_score: f64,
    pub created_at: DateTime<Utc>,
}

impl Occurrence {
    /// An occurrence located where `image` was captured.
    pub fn from_source_image(image: &SourceImage, determination: &Taxon, score: f64) -> Self {
        Self {
            id: OccurrenceId::generate(),
            event_id: image.event_id.clone(),
            deployment_id: image.deployment_id.clone(),
            project_id: image.project_id.clone(),
            determination_id: determination.id.clone(),
            determination_score: score,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_slug_derivation() {
        let mut pipeline = Pipeline::new("Quebec & Vermont Moths").with_slug("");
        assert_eq!(pipeline.slug, "");
        pipeline.ensure_slug();
        assert_eq!(pipeline.slug, "quebec-vermont-moths");

        let pipeline = Pipeline::new("Moths").with_slug("custom");
        assert_eq!(pipeline.slug, "custom");
    }

    #[test]
    fn test_blank_endpoint_is_unconfigured() {
        let pipeline = Pipeline::new("p").with_endpoint_url("   ");
        assert!(pipeline.endpoint_url().is_none());
    }

    #[test]
    fn test_public_url_passes_absolute_paths_through() {
        let image = SourceImage::new("1", "d", "https://s3/bucket/a.jpg", Utc::now());
        assert_eq!(image.public_url(), "https://s3/bucket/a.jpg");
    }

    #[test]
    fn test_bbox_key_is_exact() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let c = BoundingBox::new(0.0, 0.0, 10.0, 10.000001);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.width(), 10.0);
    }

    #[test]
    fn test_stage_params_survive_bincode() {
        let stage = PipelineStage {
            key: "classifier".to_string(),
            name: "Species classifier".to_string(),
            params: vec![StageParam {
                key: "threshold".to_string(),
                name: "Threshold".to_string(),
                value: serde_json::json!(0.6),
            }],
        };
        let bytes = bincode::serialize(&stage).unwrap();
        let back: PipelineStage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, stage);
    }

    #[test]
    fn test_taxon_rank_serialization() {
        assert_eq!(serde_json::to_string(&TaxonRank::Unknown).unwrap(), "\"UNKNOWN\"");
        assert_eq!(TaxonRank::default(), TaxonRank::Unknown);
    }

    #[test]
    fn test_taxa_list_name() {
        assert_eq!(
            TaxaList::name_for_algorithm("species-net"),
            "Taxa returned by species-net"
        );
    }
}
