//! Job logging contract.
//!
//! Processing steps report progress to an optional job sink in addition to the
//! process-wide `tracing` subscriber. The sink is passed explicitly as
//! `Option<&dyn JobLogger>`; passing `None` only suppresses the job copy of a
//! message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle state of a job, as reported to its sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Started,
    Success,
    Failure,
    Cancelled,
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Logging sink and status holder of the job driving a processing run.
pub trait JobLogger: Send + Sync {
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
    fn warn(&self, msg: &str);

    /// Records a status transition. Sinks without a status field ignore it.
    fn set_status(&self, _status: JobStatus) {}
}

/// Emits an info event and forwards it to the job sink, if any.
pub fn info(job: Option<&dyn JobLogger>, msg: &str) {
    tracing::info!("{}", msg);
    if let Some(job) = job {
        job.info(msg);
    }
}

/// Emits a debug event and forwards it to the job sink, if any.
pub fn debug(job: Option<&dyn JobLogger>, msg: &str) {
    tracing::debug!("{}", msg);
    if let Some(job) = job {
        job.debug(msg);
    }
}

/// Emits a warning and forwards it to the job sink, if any.
pub fn warn(job: Option<&dyn JobLogger>, msg: &str) {
    tracing::warn!("{}", msg);
    if let Some(job) = job {
        job.warn(msg);
    }
}

/// Forwards job messages to `tracing`, tagged with the job name.
#[derive(Debug, Clone)]
pub struct TracingJobLogger {
    job: String,
}

impl TracingJobLogger {
    pub fn new(job: impl Into<String>) -> Self {
        Self { job: job.into() }
    }
}

impl JobLogger for TracingJobLogger {
    fn info(&self, msg: &str) {
        tracing::info!(job = %self.job, "{}", msg);
    }

    fn debug(&self, msg: &str) {
        tracing::debug!(job = %self.job, "{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(job = %self.job, "{}", msg);
    }

    fn set_status(&self, status: JobStatus) {
        tracing::info!(job = %self.job, ?status, "Job status changed");
    }
}

/// Keeps every job message in memory, along with the latest status.
#[derive(Debug, Default)]
pub struct MemoryJobLogger {
    entries: Mutex<Vec<LogEntry>>,
    status: Mutex<Option<JobStatus>>,
}

impl MemoryJobLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages logged at `level`, oldest first.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level)
            .map(|entry| entry.message)
            .collect()
    }

    pub fn status(&self) -> Option<JobStatus> {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn push(&self, level: LogLevel, msg: &str) {
        let entry = LogEntry::new(level, msg);
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

impl JobLogger for MemoryJobLogger {
    fn info(&self, msg: &str) {
        self.push(LogLevel::Info, msg);
    }

    fn debug(&self, msg: &str) {
        self.push(LogLevel::Debug, msg);
    }

    fn warn(&self, msg: &str) {
        self.push(LogLevel::Warn, msg);
    }

    fn set_status(&self, status: JobStatus) {
        match self.status.lock() {
            Ok(mut current) => *current = Some(status),
            Err(poisoned) => *poisoned.into_inner() = Some(status),
        }
    }
}
