//! Integration tests for the worker subcommands.

use ami_pipeline::ImageSource;
use ami_worker::commands;
use ami_worker::config::{ProcessArgs, WorkerConfig};
use ami_worker::import::import_file;
use common::{CollectionId, DeploymentId};
use storage::StorageManager;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
request_timeout_secs = 5

[database]
path = "unused"

[[pipelines]]
name = "Moth Detector"
slug = "mothdetector"
endpoint_url = "http://127.0.0.1:9/pipeline/process"
algorithms = ["yolo-v5", "species-net"]

[[pipelines]]
name = "Panama Moths"
version = 2
"#;

fn setup() -> (StorageManager, WorkerConfig, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage =
        StorageManager::new(temp_dir.path().join("test_db")).expect("Failed to create storage");
    let config: WorkerConfig = toml::from_str(CONFIG).expect("Failed to parse config");
    (storage, config, temp_dir)
}

fn process_args(deployment: &str) -> ProcessArgs {
    ProcessArgs {
        pipeline: "mothdetector".to_string(),
        deployment: Some(deployment.to_string()),
        collection: None,
        image: Vec::new(),
        all: false,
        batch_size: None,
    }
}

#[test]
fn test_register_configured_pipelines() {
    println!("\n🧪 Testing pipeline registration from config...");
    let (storage, config, _temp) = setup();

    let pipelines = commands::register(&storage, &config).unwrap();
    assert_eq!(pipelines.len(), 2);
    assert_eq!(pipelines[1].slug, "panama-moths");
    assert_eq!(pipelines[1].version, 2);

    let moth = storage.get_pipeline_by_slug("mothdetector").unwrap().unwrap();
    assert_eq!(storage.pipeline_algorithm_ids(&moth.id).unwrap().len(), 2);

    // Registering again updates in place.
    commands::register(&storage, &config).unwrap();
    assert_eq!(storage.list_pipelines().unwrap().len(), 2);
    println!("✅ Pipelines registered");
}

#[test]
fn test_import_images_and_collections() {
    let (storage, _config, temp) = setup();
    let path = temp.path().join("images.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "source_images": [
                {"id": "img_1", "deployment_id": "dep_1", "path": "a.jpg",
                 "timestamp": "2023-07-14T02:30:00Z", "width": 4096, "height": 2160},
                {"id": "img_2", "deployment_id": "dep_1", "path": "b.jpg",
                 "timestamp": "2023-07-14T02:35:00Z"}
            ],
            "collections": [
                {"id": "night-1", "name": "First night", "image_ids": ["img_2", "img_1"]}
            ]
        })
        .to_string(),
    )
    .unwrap();

    let summary = import_file(&storage, &path).unwrap();
    assert_eq!(summary.images, 2);
    assert_eq!(summary.collections, 1);

    let images = storage
        .images_in_collection(&CollectionId::new("night-1"))
        .unwrap();
    assert_eq!(images[0].id.as_str(), "img_2");
    assert_eq!(images[1].width, Some(4096));
    assert_eq!(
        storage
            .images_for_deployment(&DeploymentId::new("dep_1"))
            .unwrap()
            .len(),
        2
    );

    let bare = temp.path().join("bare.json");
    std::fs::write(
        &bare,
        r#"[{"id": "img_3", "deployment_id": "dep_2", "path": "c.jpg", "timestamp": "2023-07-15T01:00:00Z"}]"#,
    )
    .unwrap();
    assert_eq!(import_file(&storage, &bare).unwrap().images, 1);
}

#[test]
fn test_import_rejects_invalid_json() {
    let (storage, _config, temp) = setup();
    let path = temp.path().join("broken.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(import_file(&storage, &path).is_err());
}

#[tokio::test]
async fn test_process_registers_pipeline_on_first_use() {
    let (storage, config, _temp) = setup();
    assert!(storage.get_pipeline_by_slug("mothdetector").unwrap().is_none());

    let args = process_args("empty-deployment");
    assert_eq!(
        args.image_source().unwrap(),
        ImageSource::Deployment(DeploymentId::new("empty-deployment"))
    );
    let outcome = commands::process(&storage, &config, &args, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.report.batches, 0);
    assert!(storage.get_pipeline_by_slug("mothdetector").unwrap().is_some());
}

#[tokio::test]
async fn test_process_unknown_pipeline_fails() {
    let (storage, config, _temp) = setup();
    let mut args = process_args("dep_1");
    args.pipeline = "does-not-exist".to_string();

    let err = commands::process(&storage, &config, &args, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does-not-exist"));
}
