//! Error types for the regression harness

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressError {
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Command `{command}` exited with {status}\n--- stderr ---\n{stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Subject '{subject}' crashed: {reason}")]
    SubjectCrash { subject: String, reason: String },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server never became ready after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Server answered, but not this invocation: {0}")]
    StaleServer(String),

    #[error("Transform target {target:?} must appear exactly once, found {found}")]
    TransformTarget { target: String, found: usize },

    #[error("Normalization failed: {0}")]
    Normalization(String),

    #[error("Comparison mismatch: {0}")]
    ComparisonMismatch(String),

    #[error("Expected output file not produced: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Reference file not found: {0}")]
    ReferenceNotFound(PathBuf),

    #[error("{library}: requested {requested}, but {installed} is installed")]
    VersionMismatch {
        library: String,
        requested: String,
        installed: String,
    },

    #[error("Subject catalog error: {0}")]
    Catalog(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    /// A subject failed after its work files were copied for inspection
    #[error("{source} (artifacts kept in {})", .dir.display())]
    ArtifactsKept {
        #[source]
        source: Box<RegressError>,
        dir: PathBuf,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl RegressError {
    /// Attach the directory a failed subject's files were copied to
    pub fn kept_in(self, dir: PathBuf) -> Self {
        RegressError::ArtifactsKept {
            source: Box::new(self),
            dir,
        }
    }

    /// Where the failed subject's files can be inspected, if they were kept
    pub fn artifacts_dir(&self) -> Option<&std::path::Path> {
        match self {
            RegressError::ArtifactsKept { dir, .. } => Some(dir),
            _ => None,
        }
    }
}

pub type RegressResult<T> = Result<T, RegressError>;
