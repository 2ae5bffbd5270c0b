use common::DbError;
use thiserror::Error;

/// Why a call to the inference service failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("malformed response from {url}: {reason}")]
    MalformedBody { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline cannot be run as configured (for example no endpoint URL).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The inference response breaks the request/response contract.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A record referenced by the response does not exist.
    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Pipeline request was cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
