//! Source images and image collections.

use crate::storage_manager::{abort, compound_key, decode_count, StorageManager};
use common::models::{SourceImage, SourceImageCollection};
use common::{CollectionId, DbError, DbResult, DeploymentId, SourceImageId};
use sled::transaction::TransactionResult;
use sled::Transactional;

fn deployment_key(image: &SourceImage) -> Vec<u8> {
    compound_key(&[image.deployment_id.as_bytes(), image.id.as_bytes()])
}

impl StorageManager {
    /// Writes a source image, recomputing its denormalized counters.
    ///
    /// The detection count is read and the image written in one transaction.
    /// Moving an image to another deployment drops it from the old
    /// deployment's index. Returns the image as stored.
    pub fn save_source_image(&self, image: &SourceImage) -> DbResult<SourceImage> {
        let outcome: TransactionResult<SourceImage, DbError> = (
            &self.source_images,
            &self.deployment_images,
            &self.image_detection_counts,
        )
            .transaction(|(images, deployment_images, counts)| {
                let mut stored = image.clone();
                stored.detections_count = decode_count(counts.get(image.id.as_bytes())?.as_deref());

                if let Some(bytes) = images.get(image.id.as_bytes())? {
                    let previous: SourceImage = bincode::deserialize(&bytes).map_err(abort)?;
                    if previous.deployment_id != stored.deployment_id {
                        deployment_images.remove(deployment_key(&previous))?;
                    }
                }

                let bytes = bincode::serialize(&stored).map_err(abort)?;
                images.insert(stored.id.as_bytes(), bytes)?;
                deployment_images.insert(deployment_key(&stored), &[] as &[u8])?;
                Ok(stored)
            });

        Ok(outcome?)
    }

    /// Re-saves a stored image so its counters reflect the current detections.
    pub fn refresh_source_image(&self, id: &SourceImageId) -> DbResult<SourceImage> {
        let image = self
            .get_source_image(id)?
            .ok_or_else(|| DbError::NotFound(format!("source image {}", id)))?;
        self.save_source_image(&image)
    }

    pub fn get_source_image(&self, id: &SourceImageId) -> DbResult<Option<SourceImage>> {
        Self::get_record(&self.source_images, id.as_bytes())
    }

    /// Images captured by a deployment, in id order.
    pub fn images_for_deployment(&self, deployment: &DeploymentId) -> DbResult<Vec<SourceImage>> {
        Self::related_records(&self.deployment_images, &self.source_images, deployment.as_bytes())
    }

    pub fn list_source_images(&self) -> DbResult<Vec<SourceImage>> {
        Self::all_records(&self.source_images)
    }

    pub fn count_source_images(&self) -> usize {
        self.source_images.len()
    }

    // --- Collections ---

    pub fn save_collection(&self, collection: &SourceImageCollection) -> DbResult<()> {
        Self::put_record(&self.collections, collection.id.as_bytes(), collection)
    }

    pub fn get_collection(&self, id: &CollectionId) -> DbResult<Option<SourceImageCollection>> {
        Self::get_record(&self.collections, id.as_bytes())
    }

    /// Images of a collection, in collection order.
    ///
    /// # Errors
    ///
    /// `DbError::NotFound` if the collection or one of its images is missing.
    pub fn images_in_collection(&self, id: &CollectionId) -> DbResult<Vec<SourceImage>> {
        let collection = self
            .get_collection(id)?
            .ok_or_else(|| DbError::NotFound(format!("collection {}", id)))?;

        collection
            .image_ids
            .iter()
            .map(|image_id| -> DbResult<SourceImage> {
                self.get_source_image(image_id)?
                    .ok_or_else(|| DbError::NotFound(format!("source image {}", image_id)))
            })
            .collect()
    }
}
