//! Loading source images from JSON exports.

use anyhow::{Context, Result};
use common::models::{SourceImage, SourceImageCollection};
use serde::Deserialize;
use std::path::Path;
use storage::StorageManager;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Images(Vec<SourceImage>),
    Full {
        #[serde(default)]
        source_images: Vec<SourceImage>,
        #[serde(default)]
        collections: Vec<SourceImageCollection>,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub images: usize,
    pub collections: usize,
}

/// Saves every image and collection listed in `path`.
///
/// Images are saved before collections so collections never point at
/// missing images from the same file.
pub fn import_file(storage: &StorageManager, path: &Path) -> Result<ImportSummary> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {:?}", path))?;
    let parsed: ImportFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse import file: {:?}", path))?;

    let (images, collections) = match parsed {
        ImportFile::Images(images) => (images, Vec::new()),
        ImportFile::Full {
            source_images,
            collections,
        } => (source_images, collections),
    };

    for image in &images {
        storage
            .save_source_image(image)
            .with_context(|| format!("Failed to save source image {}", image.id))?;
    }
    for collection in &collections {
        storage
            .save_collection(collection)
            .with_context(|| format!("Failed to save collection {}", collection.id))?;
    }

    tracing::info!(
        "Imported {} source images and {} collections from {:?}",
        images.len(),
        collections.len(),
        path
    );
    Ok(ImportSummary {
        images: images.len(),
        collections: collections.len(),
    })
}
