//! Persistent store for pipelines, source images and inference results.
//!
//! This crate provides a safe, transactional interface over the `sled`
//! embedded database engine. Records are bincode values keyed by their typed
//! identifiers; every uniqueness rule (pipeline slug, pipeline name+version,
//! algorithm name, taxon name, taxa list name, detection image+algorithm+box)
//! is backed by an index tree that is written in the same transaction as the
//! record it points to.
//!
//! # Concurrency Safety
//!
//! `StorageManager` is `Send + Sync`. Find-or-create operations never read
//! and then write in separate steps: the lookup and the insert run inside one
//! sled transaction, so two threads racing to create the same taxon or the
//! same detection end up sharing a single record.
//!
//! ```no_run
//! use storage::StorageManager;
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> Result<(), storage::DbError> {
//! let storage = Arc::new(StorageManager::new("ami_db")?);
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let storage = Arc::clone(&storage);
//!         thread::spawn(move || storage.get_or_create_taxon("Bombyx mori"))
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap()?;
//! }
//! assert_eq!(storage.count_taxa(), 1);
//! # Ok(())
//! # }
//! ```

mod detections;
mod images;
mod pipelines;
mod storage_manager;
mod taxonomy;

pub use detections::DetectionDraft;
pub use storage_manager::StorageManager;

// Re-export commonly used types for convenience
pub use common::{
    models::{
        Algorithm, BoundingBox, Classification, Detection, Occurrence, Pipeline, PipelineStage,
        SourceImage, SourceImageCollection, TaxaList, Taxon, TaxonRank,
    },
    DbError, DbResult,
};
