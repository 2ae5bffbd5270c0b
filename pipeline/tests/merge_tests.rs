//! Merge behavior of inference responses against a real database.

use chrono::{TimeZone, Utc};
use common::logging::{LogLevel, MemoryJobLogger};
use common::models::{Pipeline, SourceImage, TaxaList, TaxonRank};
use common::{DbResult, DeploymentId, SourceImageId};
use ami_pipeline::{
    filter_processed_images, select_image, AlgorithmRegistry, CreatedRecord, PipelineError,
    PipelineResponse, RecordKind, ResultMerger, Selection,
};
use serde_json::json;
use storage::StorageManager;
use tempfile::TempDir;

fn create_temp_db() -> (StorageManager, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage =
        StorageManager::new(temp_dir.path().join("test_db")).expect("Failed to create storage");
    (storage, temp_dir)
}

fn setup(storage: &StorageManager) -> (Pipeline, SourceImage) {
    let (pipeline, _) = storage
        .save_pipeline(
            Pipeline::new("Moth Detector")
                .with_slug("mothdetector")
                .with_endpoint_url("http://localhost:2000/process"),
        )
        .unwrap();
    let mut image = SourceImage::new(
        "img_1",
        "dep_1",
        "2023/07/14/a.jpg",
        Utc.with_ymd_and_hms(2023, 7, 14, 2, 30, 0).unwrap(),
    );
    image.event_id = Some("night-2023-07-13".into());
    image.project_id = Some("project-1".into());
    let image = storage.save_source_image(&image).unwrap();
    (pipeline, image)
}

fn moth_response(crop_image_url: Option<&str>) -> PipelineResponse {
    serde_json::from_value(json!({
        "pipeline": "mothdetector",
        "detections": [{
            "source_image_id": "img_1",
            "algorithm": "yolo-v5",
            "bbox": {"x1": 0.0, "y1": 0.0, "x2": 10.0, "y2": 10.0},
            "timestamp": "2023-07-20T10:00:00Z",
            "crop_image_url": crop_image_url,
            "classifications": [{
                "algorithm": "species-net",
                "classification": "Bombyx mori",
                "scores": [0.2, 0.91]
            }]
        }]
    }))
    .unwrap()
}

#[test]
fn test_mothdetector_first_merge() {
    println!("\n🧪 Testing first merge of a mothdetector response...");
    let (storage, _temp) = create_temp_db();
    let (pipeline, image) = setup(&storage);
    let job = MemoryJobLogger::new();

    let outcome = ResultMerger::new(&storage)
        .merge(&moth_response(None), Some(&job))
        .unwrap();

    assert_eq!(outcome.pipeline.id, pipeline.id);
    assert_eq!(outcome.count(RecordKind::Pipeline), 0);
    assert_eq!(outcome.count(RecordKind::Algorithm), 2);
    assert_eq!(outcome.count(RecordKind::TaxaList), 1);
    assert_eq!(outcome.count(RecordKind::Taxon), 1);
    assert_eq!(outcome.count(RecordKind::Detection), 1);
    assert_eq!(outcome.count(RecordKind::Classification), 1);
    assert_eq!(outcome.count(RecordKind::Occurrence), 1);
    assert_eq!(outcome.touched_images, vec![image.id.clone()]);

    let taxon = storage.get_taxon_by_name("Bombyx mori").unwrap().unwrap();
    assert_eq!(taxon.rank, TaxonRank::Unknown);

    let detection = outcome.created_detections().next().unwrap().clone();
    assert_eq!(detection.bbox.x2, 10.0);
    assert_eq!(detection.timestamp, image.timestamp);
    assert_eq!(
        detection.detection_time,
        Some(Utc.with_ymd_and_hms(2023, 7, 20, 10, 0, 0).unwrap())
    );
    assert_eq!(detection.path, None);

    let classification = outcome.created_classifications().next().unwrap();
    assert_eq!(classification.score, 0.91);
    assert_eq!(classification.taxon_id, taxon.id);

    let occurrence = outcome
        .created
        .iter()
        .find_map(|r| match r {
            CreatedRecord::Occurrence(o) => Some(o.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(occurrence.determination_id, taxon.id);
    assert_eq!(occurrence.determination_score, 0.91);
    assert_eq!(occurrence.deployment_id, DeploymentId::new("dep_1"));
    assert_eq!(occurrence.event_id, image.event_id);
    assert_eq!(occurrence.project_id, image.project_id);

    let stored = storage.get_detection(&detection.id).unwrap().unwrap();
    assert_eq!(stored.occurrence_id, Some(occurrence.id));

    let refreshed = storage.get_source_image(&image.id).unwrap().unwrap();
    assert_eq!(refreshed.detections_count, 1);

    let list = storage
        .get_taxa_list_by_name(&TaxaList::name_for_algorithm("species-net"))
        .unwrap()
        .unwrap();
    assert_eq!(storage.taxa_in_list(&list.id).unwrap().len(), 1);

    assert!(job
        .messages(LogLevel::Info)
        .iter()
        .any(|m| m == "Created 7 objects"));
    println!("✅ First merge created the expected records");
}

#[test]
fn test_observed_algorithms_are_registered() {
    let (storage, _temp) = create_temp_db();
    let (pipeline, _) = setup(&storage);
    let job = MemoryJobLogger::new();

    let outcome = ResultMerger::new(&storage)
        .merge(&moth_response(None), Some(&job))
        .unwrap();

    assert_eq!(outcome.registered_algorithms.len(), 2);
    let registry = AlgorithmRegistry::new(&storage);
    for name in ["yolo-v5", "species-net"] {
        let algorithm = storage.get_algorithm_by_name(name).unwrap().unwrap();
        assert!(registry.is_registered(&pipeline.id, &algorithm.id).unwrap());
    }
    assert_eq!(job.messages(LogLevel::Warn).len(), 2);

    let again = ResultMerger::new(&storage)
        .merge(&moth_response(None), None)
        .unwrap();
    assert!(again.registered_algorithms.is_empty());
}

#[test]
fn test_resubmission_reuses_detection_and_backfills_crop() {
    println!("\n🧪 Testing re-submission with a crop image URL...");
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    let merger = ResultMerger::new(&storage);

    let first = merger.merge(&moth_response(None), None).unwrap();
    let detection_id = first.created_detections().next().unwrap().id.clone();

    let second = merger
        .merge(&moth_response(Some("http://x/crop.png")), None)
        .unwrap();
    assert_eq!(second.count(RecordKind::Detection), 0);
    assert_eq!(second.updated_detections, 1);
    assert_eq!(storage.count_detections(), 1);

    let detection = storage.get_detection(&detection_id).unwrap().unwrap();
    assert_eq!(detection.path.as_deref(), Some("http://x/crop.png"));

    // A later crop URL never replaces an existing path.
    let third = merger
        .merge(&moth_response(Some("http://y/other.png")), None)
        .unwrap();
    assert_eq!(third.updated_detections, 0);
    let detection = storage.get_detection(&detection_id).unwrap().unwrap();
    assert_eq!(detection.path.as_deref(), Some("http://x/crop.png"));
    println!("✅ Crop path backfilled once");
}

#[test]
fn test_repeated_merge_duplicates_only_classifications() {
    let (storage, _temp) = create_temp_db();
    let (_, image) = setup(&storage);
    let merger = ResultMerger::new(&storage);

    merger.merge(&moth_response(None), None).unwrap();
    let second = merger.merge(&moth_response(None), None).unwrap();

    let created_kinds: Vec<RecordKind> = second.created.iter().map(CreatedRecord::kind).collect();
    assert_eq!(created_kinds, vec![RecordKind::Classification]);

    assert_eq!(storage.count_detections(), 1);
    assert_eq!(storage.count_taxa(), 1);
    assert_eq!(storage.count_algorithms(), 2);
    assert_eq!(storage.count_occurrences(), 1);
    assert_eq!(storage.count_classifications(), 2);
    assert_eq!(
        storage.get_source_image(&image.id).unwrap().unwrap().detections_count,
        1
    );
}

#[test]
fn test_first_classification_sets_occurrence() {
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    let response: PipelineResponse = serde_json::from_value(json!({
        "pipeline": "mothdetector",
        "detections": [{
            "source_image_id": "img_1",
            "algorithm": "yolo-v5",
            "bbox": {"x1": 5.0, "y1": 5.0, "x2": 50.0, "y2": 40.0},
            "classifications": [
                {"algorithm": "moth-binary", "classification": "Lepidoptera", "scores": [0.99]},
                {"algorithm": "species-net", "classification": "Actias luna", "scores": [0.4, 0.7]}
            ]
        }]
    }))
    .unwrap();

    let outcome = ResultMerger::new(&storage).merge(&response, None).unwrap();
    assert_eq!(outcome.count(RecordKind::Occurrence), 1);
    assert_eq!(outcome.count(RecordKind::TaxaList), 2);

    let first_taxon = storage.get_taxon_by_name("Lepidoptera").unwrap().unwrap();
    let detection = outcome.created_detections().next().unwrap();
    let stored = storage.get_detection(&detection.id).unwrap().unwrap();
    let occurrence = storage
        .get_occurrence(stored.occurrence_id.as_ref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(occurrence.determination_id, first_taxon.id);
    assert_eq!(occurrence.determination_score, 0.99);
}

#[test]
fn test_unknown_pipeline_slug_is_created_with_warning() {
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    let mut response = moth_response(None);
    response.pipeline = "panama-moths".to_string();
    let job = MemoryJobLogger::new();

    let outcome = ResultMerger::new(&storage).merge(&response, Some(&job)).unwrap();

    assert_eq!(outcome.count(RecordKind::Pipeline), 1);
    assert!(matches!(outcome.created[0], CreatedRecord::Pipeline(_)));
    assert_eq!(outcome.pipeline.slug, "panama-moths");
    assert!(job
        .messages(LogLevel::Warn)
        .iter()
        .any(|m| m.contains("was not recognized")));
    assert_eq!(storage.pipeline_algorithm_ids(&outcome.pipeline.id).unwrap().len(), 2);
}

#[test]
fn test_unknown_slug_matching_existing_name_gets_next_version() {
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    storage
        .save_pipeline(Pipeline::new("panama-moths").with_slug("panama-v1"))
        .unwrap();
    let mut response = moth_response(None);
    response.pipeline = "panama-moths".to_string();
    let job = MemoryJobLogger::new();

    let outcome = ResultMerger::new(&storage).merge(&response, Some(&job)).unwrap();

    assert_eq!(outcome.count(RecordKind::Pipeline), 1);
    assert_eq!(outcome.pipeline.slug, "panama-moths");
    assert_eq!(outcome.pipeline.version, 2);
    assert_eq!(storage.count_detections(), 1);
    let warnings = job.messages(LogLevel::Warn);
    assert!(warnings.iter().any(|m| m.contains("was not recognized")));
    assert!(warnings.iter().any(|m| m.contains("as version 2")));
    assert_eq!(
        storage.get_pipeline_by_slug("panama-v1").unwrap().unwrap().version,
        1
    );
}

#[test]
fn test_contract_violation_commits_nothing() {
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    let response: PipelineResponse = serde_json::from_value(json!({
        "pipeline": "mothdetector",
        "detections": [
            {
                "source_image_id": "img_1",
                "algorithm": "yolo-v5",
                "bbox": {"x1": 0.0, "y1": 0.0, "x2": 10.0, "y2": 10.0},
                "classifications": []
            },
            {
                "source_image_id": "img_1",
                "algorithm": "yolo-v5",
                "bbox": {"x1": 20.0, "y1": 0.0, "x2": 30.0, "y2": 10.0},
                "classifications": [{"classification": "Bombyx mori", "scores": [0.5]}]
            }
        ]
    }))
    .unwrap();

    let err = ResultMerger::new(&storage).merge(&response, None).unwrap_err();
    assert!(matches!(err, PipelineError::ContractViolation(_)));
    assert_eq!(storage.count_detections(), 0);
    assert_eq!(storage.count_algorithms(), 0);
    assert_eq!(storage.count_taxa(), 0);
}

#[test]
fn test_unknown_source_image_is_lookup_error() {
    let (storage, _temp) = create_temp_db();
    setup(&storage);
    let mut response = moth_response(None);
    response.detections[0].source_image_id = "img_404".to_string();

    let err = ResultMerger::new(&storage).merge(&response, None).unwrap_err();
    assert!(matches!(err, PipelineError::Lookup(_)));
    assert_eq!(storage.count_detections(), 0);
}

#[test]
fn test_selector_after_merge() -> DbResult<()> {
    println!("\n🧪 Testing selection before and after a merge...");
    let (storage, _temp) = create_temp_db();
    let (pipeline, image) = setup(&storage);
    AlgorithmRegistry::new(&storage)
        .declare(&pipeline, &["yolo-v5".to_string(), "species-net".to_string()])
        .unwrap();

    let registered = storage.pipeline_algorithm_ids(&pipeline.id)?;
    assert_eq!(select_image(&storage, &image, &registered)?, Selection::FirstTime);

    ResultMerger::new(&storage)
        .merge(&moth_response(None), None)
        .unwrap();

    let image = storage.get_source_image(&image.id)?.unwrap();
    assert_eq!(
        select_image(&storage, &image, &registered)?,
        Selection::AlreadyProcessed
    );
    let remaining: Vec<SourceImage> =
        filter_processed_images(&storage, &pipeline, vec![image])?.collect::<DbResult<_>>()?;
    assert!(remaining.is_empty());
    println!("✅ Processed image is skipped");
    Ok(())
}

#[test]
fn test_foreign_classifier_triggers_reclassification() {
    let (storage, _temp) = create_temp_db();
    let (_, image) = setup(&storage);

    // Another pipeline detected with yolo-v5 but classified with its own model.
    let mut response = moth_response(None);
    response.pipeline = "legacy-moths".to_string();
    response.detections[0].classifications[0].algorithm = Some("legacy-classifier".to_string());
    ResultMerger::new(&storage).merge(&response, None).unwrap();

    let (pipeline, _) = storage
        .save_pipeline(Pipeline::new("Species Pipeline").with_slug("species"))
        .unwrap();
    AlgorithmRegistry::new(&storage)
        .declare(&pipeline, &["yolo-v5".to_string(), "species-net".to_string()])
        .unwrap();

    let registered = storage.pipeline_algorithm_ids(&pipeline.id).unwrap();
    assert_eq!(
        select_image(&storage, &image, &registered).unwrap(),
        Selection::NeedsReclassification
    );
    let selected: Vec<SourceImageId> = filter_processed_images(&storage, &pipeline, vec![image])
        .unwrap()
        .map(|r| r.map(|img| img.id))
        .collect::<DbResult<_>>()
        .unwrap();
    assert_eq!(selected, vec![SourceImageId::new("img_1")]);
}
