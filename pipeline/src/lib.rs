//! Processing source images through external ML pipelines.
//!
//! The flow of one run is:
//!
//! 1. [`selector`] picks the images a pipeline has not fully processed yet.
//! 2. [`PipelineClient`] posts them to the pipeline's inference endpoint.
//! 3. [`ResultMerger`] folds the response into the [`storage`] database,
//!    creating algorithms, taxa, detections, classifications and occurrences
//!    as needed.
//! 4. [`AlgorithmRegistry`] records every algorithm the response used.
//!
//! [`PipelineJob`] drives the whole sequence in batches. Every step takes an
//! optional [`JobLogger`](common::logging::JobLogger) that receives progress
//! messages in addition to the `tracing` events.

pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod merge;
pub mod registry;
pub mod schemas;
pub mod selector;

pub use client::PipelineClient;
pub use config::PipelineConfig;
pub use error::{PipelineError, Result, TransportError};
pub use job::{JobOptions, JobReport, PipelineJob};
pub use merge::{CreatedRecord, MergeAccumulator, MergeOutcome, RecordKind, ResultMerger};
pub use registry::AlgorithmRegistry;
pub use schemas::{
    BBox, ClassificationResponse, DetectionResponse, PipelineRequest, PipelineResponse,
    SourceImageRequest,
};
pub use selector::{collect_images, filter_processed_images, select_image, ImageSource, Selection};
