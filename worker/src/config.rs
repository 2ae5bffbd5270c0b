//! Configuration system for the AMI worker.
//!
//! Supports:
//! - CLI arguments (highest priority)
//! - Environment variables
//! - TOML config file
//! - Defaults (lowest priority)

use ami_pipeline::{ImageSource, PipelineConfig};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{CollectionId, DeploymentId, SourceImageId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Command-line arguments for the worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "ami-worker")]
#[command(about = "Runs AMI source images through ML inference pipelines")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(long, short = 'c', default_value = "ami-worker.toml", env = "AMI_CONFIG")]
    pub config: PathBuf,

    /// Database path (defaults to platform-specific data directory if not specified)
    #[arg(long, env = "AMI_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Timeout for one inference request, in seconds
    #[arg(long, env = "AMI_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Save the configured pipelines and register their algorithms
    Register,

    /// Import source images (and collections) from a JSON file
    ImportImages {
        /// JSON file with an array of source images or an object with
        /// `source_images` and `collections`
        file: PathBuf,
    },

    /// Run a pipeline over a set of images
    Process(ProcessArgs),
}

#[derive(Args, Debug, Clone, PartialEq)]
#[command(group(
    clap::ArgGroup::new("source")
        .required(true)
        .args(["deployment", "collection", "image"]),
))]
pub struct ProcessArgs {
    /// Slug of the pipeline to run
    #[arg(long)]
    pub pipeline: String,

    /// Process every image of a deployment
    #[arg(long)]
    pub deployment: Option<String>,

    /// Process every image of a collection
    #[arg(long)]
    pub collection: Option<String>,

    /// Process specific images (repeatable)
    #[arg(long = "image")]
    pub image: Vec<String>,

    /// Also re-submit images the pipeline has already processed
    #[arg(long)]
    pub all: bool,

    /// Images per inference request
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl ProcessArgs {
    pub fn image_source(&self) -> Result<ImageSource> {
        match (&self.deployment, &self.collection, self.image.is_empty()) {
            (Some(deployment), None, true) => {
                Ok(ImageSource::Deployment(DeploymentId::new(deployment.as_str())))
            }
            (None, Some(collection), true) => {
                Ok(ImageSource::Collection(CollectionId::new(collection.as_str())))
            }
            (None, None, false) => Ok(ImageSource::Images(
                self.image.iter().map(|id| SourceImageId::new(id.as_str())).collect(),
            )),
            _ => bail!("specify exactly one of --deployment, --collection or --image"),
        }
    }
}

/// Full worker configuration (merged from all sources).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub request_timeout_secs: u64,
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from CLI args and optional config file.
    ///
    /// Priority: CLI args > Environment > Config file > Defaults
    pub fn load(args: &CliArgs) -> Result<Self> {
        let mut config = if args.config.exists() {
            Self::from_file(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?
        } else {
            tracing::debug!("No config file at {:?}, using defaults", args.config);
            Self::default()
        };

        if let Some(ref db_path) = args.db_path {
            config.database.path = db_path.clone();
        }
        if let Some(timeout) = args.request_timeout_secs {
            config.request_timeout_secs = timeout;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: WorkerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// The configured pipeline whose slug (explicit or derived) is `slug`.
    pub fn pipeline(&self, slug: &str) -> Option<&PipelineConfig> {
        self.pipelines
            .iter()
            .find(|p| p.to_pipeline().slug == slug)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: common::platform::get_named_db_path("ami_db"),
            },
            request_timeout_secs: 300,
            pipelines: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config: PathBuf, command: Command) -> CliArgs {
        CliArgs {
            config,
            db_path: None,
            request_timeout_secs: None,
            command,
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.request_timeout_secs, 300);
        assert!(config.pipelines.is_empty());
        assert!(config.database.path.ends_with("ami_db"));
    }

    #[test]
    fn test_cli_args_override_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            r#"
                request_timeout_secs = 60

                [database]
                path = "/var/lib/ami/db"

                [[pipelines]]
                name = "Moth Detector"
                slug = "mothdetector"
                endpoint_url = "http://ml-backend:2000/pipeline/process"
                algorithms = ["yolo-v5"]
            "#,
        )
        .unwrap();

        let from_file = WorkerConfig::load(&args(path.clone(), Command::Register)).unwrap();
        assert_eq!(from_file.request_timeout_secs, 60);
        assert_eq!(from_file.database.path, PathBuf::from("/var/lib/ami/db"));
        assert!(from_file.pipeline("mothdetector").is_some());

        let mut cli = args(path, Command::Register);
        cli.db_path = Some(PathBuf::from("./test_db"));
        cli.request_timeout_secs = Some(5);
        let config = WorkerConfig::load(&cli).unwrap();
        assert_eq!(config.database.path, PathBuf::from("./test_db"));
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.pipelines.len(), 1);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            WorkerConfig::load(&args(PathBuf::from("nonexistent.toml"), Command::Register)).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn test_process_args_parse() {
        let cli = CliArgs::try_parse_from([
            "ami-worker",
            "process",
            "--pipeline",
            "mothdetector",
            "--image",
            "img_1",
            "--image",
            "img_2",
            "--batch-size",
            "8",
        ])
        .unwrap();

        let Command::Process(process) = cli.command else {
            panic!("Expected process command");
        };
        assert_eq!(process.batch_size, Some(8));
        assert!(!process.all);
        assert_eq!(
            process.image_source().unwrap(),
            ImageSource::Images(vec![SourceImageId::new("img_1"), SourceImageId::new("img_2")])
        );

        let missing_source =
            CliArgs::try_parse_from(["ami-worker", "process", "--pipeline", "mothdetector"]);
        assert!(missing_source.is_err());
    }
}
