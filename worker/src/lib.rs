//! Library side of the `ami-worker` binary.
//!
//! Exposes configuration loading and the subcommand implementations so they
//! can be tested without spawning the process.

pub mod commands;
pub mod config;
pub mod import;

pub use config::{CliArgs, Command, ProcessArgs, WorkerConfig};
