//! Detections, classifications and occurrences.

use crate::storage_manager::{abort, compound_key, dangling, decode_count, StorageManager};
use chrono::{DateTime, Utc};
use common::models::{BoundingBox, Classification, Detection, Occurrence, SourceImage};
use common::{AlgorithmId, DbError, DbResult, DetectionId, OccurrenceId, SourceImageId};
use sled::transaction::TransactionResult;
use sled::Transactional;

/// Uniqueness key of a detection: image, algorithm and exact box.
fn detection_key(image: &SourceImageId, algorithm: &AlgorithmId, bbox: &BoundingBox) -> Vec<u8> {
    compound_key(&[image.as_bytes(), algorithm.as_bytes(), bbox.key().as_bytes()])
}

/// Fields reported for a detection that may not exist yet.
#[derive(Debug, Clone)]
pub struct DetectionDraft {
    pub bbox: BoundingBox,
    pub detection_time: Option<DateTime<Utc>>,
    pub path: Option<String>,
}

impl StorageManager {
    /// Finds the detection keyed by (image, algorithm, bbox) or atomically
    /// creates it from `draft`.
    ///
    /// An existing detection is returned untouched; see
    /// [`StorageManager::backfill_detection_path`] for updating it.
    pub fn get_or_create_detection(
        &self,
        image: &SourceImage,
        algorithm: &AlgorithmId,
        draft: &DetectionDraft,
    ) -> DbResult<(Detection, bool)> {
        let key = detection_key(&image.id, algorithm, &draft.bbox);

        let outcome: TransactionResult<(Detection, bool), DbError> =
            (
                &self.detections,
                &self.detection_keys,
                &self.image_detections,
                &self.image_detection_counts,
            )
                .transaction(|(detections, keys, image_detections, counts)| {
                    if let Some(existing_id) = keys.get(&key)? {
                        let bytes = detections
                            .get(&existing_id)?
                            .ok_or_else(|| abort(dangling(&existing_id)))?;
                        let detection: Detection = bincode::deserialize(&bytes).map_err(abort)?;
                        return Ok((detection, false));
                    }

                    let detection = Detection {
                        id: DetectionId::generate(),
                        source_image_id: image.id.clone(),
                        detection_algorithm_id: algorithm.clone(),
                        bbox: draft.bbox,
                        timestamp: image.timestamp,
                        detection_time: draft.detection_time,
                        path: draft.path.clone(),
                        occurrence_id: None,
                    };
                    let bytes = bincode::serialize(&detection).map_err(abort)?;
                    keys.insert(key.as_slice(), detection.id.as_bytes())?;
                    detections.insert(detection.id.as_bytes(), bytes)?;
                    image_detections.insert(
                        compound_key(&[image.id.as_bytes(), detection.id.as_bytes()]),
                        &[] as &[u8],
                    )?;
                    let count = decode_count(counts.get(image.id.as_bytes())?.as_deref());
                    counts.insert(image.id.as_bytes(), (count + 1).to_be_bytes().to_vec())?;
                    Ok((detection, true))
                });

        Ok(outcome?)
    }

    pub fn find_detection(
        &self,
        image: &SourceImageId,
        algorithm: &AlgorithmId,
        bbox: &BoundingBox,
    ) -> DbResult<Option<Detection>> {
        match self.detection_keys.get(detection_key(image, algorithm, bbox))? {
            Some(id) => Self::get_record(&self.detections, &id),
            None => Ok(None),
        }
    }

    /// Sets the crop-image path of a detection that has none.
    ///
    /// Returns the updated detection, or `None` when it already had a path.
    pub fn backfill_detection_path(
        &self,
        id: &DetectionId,
        path: &str,
    ) -> DbResult<Option<Detection>> {
        let outcome: TransactionResult<Option<Detection>, DbError> =
            self.detections.transaction(|detections| {
                let bytes = detections
                    .get(id.as_bytes())?
                    .ok_or_else(|| abort(dangling(id.as_bytes())))?;
                let mut detection: Detection = bincode::deserialize(&bytes).map_err(abort)?;
                if detection.has_path() {
                    return Ok(None);
                }
                detection.path = Some(path.to_string());
                let bytes = bincode::serialize(&detection).map_err(abort)?;
                detections.insert(id.as_bytes(), bytes)?;
                Ok(Some(detection))
            });

        Ok(outcome?)
    }

    pub fn get_detection(&self, id: &DetectionId) -> DbResult<Option<Detection>> {
        Self::get_record(&self.detections, id.as_bytes())
    }

    /// Detections found in an image, in id order.
    pub fn detections_for_image(&self, image: &SourceImageId) -> DbResult<Vec<Detection>> {
        Self::related_records(&self.image_detections, &self.detections, image.as_bytes())
    }

    pub fn count_detections(&self) -> usize {
        self.detections.len()
    }

    // --- Classifications ---

    /// Appends a classification. Classifications are never deduplicated.
    pub fn insert_classification(&self, classification: &Classification) -> DbResult<()> {
        let bytes = bincode::serialize(classification)?;
        let relation_key = compound_key(&[
            classification.detection_id.as_bytes(),
            classification.id.as_bytes(),
        ]);

        let outcome: TransactionResult<(), DbError> = (
            &self.classifications,
            &self.detection_classifications,
        )
            .transaction(|(classifications, detection_classifications)| {
                classifications.insert(classification.id.as_bytes(), bytes.clone())?;
                detection_classifications.insert(relation_key.as_slice(), &[] as &[u8])?;
                Ok(())
            });

        Ok(outcome?)
    }

    pub fn classifications_for_detection(
        &self,
        detection: &DetectionId,
    ) -> DbResult<Vec<Classification>> {
        Self::related_records(
            &self.detection_classifications,
            &self.classifications,
            detection.as_bytes(),
        )
    }

    pub fn count_classifications(&self) -> usize {
        self.classifications.len()
    }

    // --- Occurrences ---

    /// Creates and links an occurrence for a detection that has none.
    ///
    /// The check and the link happen in one transaction, so a detection never
    /// gets a second occurrence. Returns the current detection and the new
    /// occurrence, if one was created.
    pub fn ensure_occurrence<F>(
        &self,
        detection_id: &DetectionId,
        make: F,
    ) -> DbResult<(Detection, Option<Occurrence>)>
    where
        F: Fn() -> Occurrence,
    {
        let outcome: TransactionResult<(Detection, Option<Occurrence>), DbError> =
            (&self.detections, &self.occurrences).transaction(|(detections, occurrences)| {
                let bytes = detections
                    .get(detection_id.as_bytes())?
                    .ok_or_else(|| abort(dangling(detection_id.as_bytes())))?;
                let mut detection: Detection = bincode::deserialize(&bytes).map_err(abort)?;
                if detection.occurrence_id.is_some() {
                    return Ok((detection, None));
                }

                let occurrence = make();
                detection.occurrence_id = Some(occurrence.id.clone());
                let occurrence_bytes = bincode::serialize(&occurrence).map_err(abort)?;
                let detection_bytes = bincode::serialize(&detection).map_err(abort)?;
                occurrences.insert(occurrence.id.as_bytes(), occurrence_bytes)?;
                detections.insert(detection_id.as_bytes(), detection_bytes)?;
                Ok((detection, Some(occurrence)))
            });

        Ok(outcome?)
    }

    pub fn get_occurrence(&self, id: &OccurrenceId) -> DbResult<Option<Occurrence>> {
        Self::get_record(&self.occurrences, id.as_bytes())
    }

    pub fn count_occurrences(&self) -> usize {
        self.occurrences.len()
    }
}
