//! Common types and utilities shared across the AMI processing crates.
//!
//! This crate provides the record identifiers, data models, error definitions
//! and the job logging contract used by `storage`, `ami-pipeline` and the
//! worker binary.
//!
//! # Architecture
//!
//! The `common` crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Provides shared types that all other crates can use
//! - Ensures type consistency across the entire system

pub mod logging;
pub mod models;
pub mod platform;

use unicode_normalization::UnicodeNormalization;

// --- Core Newtype Wrappers ---

/// Declares a string-backed identifier newtype.
///
/// Each record kind gets its own identifier type so a `DetectionId` can never
/// be passed where a `TaxonId` is expected.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from an existing string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Get the inner string reference
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Key bytes used by the storage trees
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            /// Consume and return the inner string
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Unique identifier for a processing pipeline.
    PipelineId
);
define_id!(
    /// Unique identifier for a detection or classification algorithm.
    AlgorithmId
);
define_id!(
    /// Unique identifier for a captured frame.
    SourceImageId
);
define_id!(
    /// Unique identifier for a named set of source images.
    CollectionId
);
define_id!(
    /// Unique identifier for a bounding box found in a source image.
    DetectionId
);
define_id!(
    /// Unique identifier for a taxon label attached to a detection.
    ClassificationId
);
define_id!(
    /// Unique identifier for a taxonomic unit.
    TaxonId
);
define_id!(
    /// Unique identifier for a provenance grouping of taxa.
    TaxaListId
);
define_id!(
    /// Unique identifier for an organism sighting.
    OccurrenceId
);
define_id!(
    /// Identifier of the field deployment that captured an image.
    DeploymentId
);
define_id!(
    /// Identifier of the monitoring session an image belongs to.
    EventId
);
define_id!(
    /// Identifier of the owning project.
    ProjectId
);

// --- Error Types ---

/// Common error type for database operations.
///
/// This error type is used across all crates for consistency.
/// Each crate may wrap it in its own error enum.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error from the sled storage backend.
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested entity not found.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Invalid operation or arguments.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A uniqueness constraint rejected the write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Implement From for bincode errors manually to convert to String
impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<DbError>> for DbError {
    fn from(err: sled::transaction::TransactionError<DbError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => DbError::Sled(inner),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Lowercase, hyphen-separated form of a name, used to derive pipeline slugs.
///
/// Accented letters are folded to ASCII (NFKD, combining marks dropped) and
/// any other non-ASCII character is removed. Punctuation other than hyphens
/// and underscores is removed, runs of whitespace and hyphens collapse into a
/// single hyphen, and leading and trailing hyphens and underscores are dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for ch in name.nfkd().filter(char::is_ascii) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else if ch == '-' || ch.is_ascii_whitespace() {
            pending_hyphen = true;
        }
    }

    slug.trim_matches(|c| c == '-' || c == '_').to_string()
}

// --- Tests ---
