//! Harness configuration
//!
//! Everything a run depends on (which environment, which pins, where the
//! corpus and golden files live) is carried in one [`HarnessConfig`] value
//! that is threaded into the runner. Nothing is read from process-global
//! state after startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::RegressResult;
use crate::pinner::LibraryPins;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root of the session's isolated environment (`$VIRTUAL_ENV`)
    pub venv_root: Option<PathBuf>,

    /// Root of the example program corpus
    pub examples_root: PathBuf,

    /// Golden reference files
    pub reference_dir: PathBuf,

    /// Subject catalog directory (YAML)
    pub subjects_dir: PathBuf,

    /// Results, kept artifacts and diff images
    pub output_dir: PathBuf,

    /// Copy every subject's outputs to `output_dir`, not only failures
    pub keep_artifacts: bool,

    pub server: ServerSettings,

    /// Requested library versions, e.g. `django = "4.2.1"` or `"unpinned"`
    pub pins: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            venv_root: None,
            examples_root: PathBuf::from("."),
            reference_dir: PathBuf::from("tests/reference_files"),
            subjects_dir: PathBuf::from("crates/regress/subjects"),
            output_dir: PathBuf::from("regress-results"),
            keep_artifacts: false,
            server: ServerSettings::default(),
            pins: BTreeMap::new(),
        }
    }
}

/// Development server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Fixed port, reused by successive runs
    pub port: u16,

    /// Readiness probe attempts before giving up
    pub max_attempts: usize,

    pub poll_interval_ms: u64,

    /// Pause after the first successful probe before reading the log
    pub settle_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8008,
            max_attempts: 50,
            poll_interval_ms: 200,
            settle_ms: 1000,
            stop_grace_ms: 5000,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub fn load(path: &Path) -> RegressResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn library_pins(&self) -> LibraryPins {
        LibraryPins::from_strings(&self.pins)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.output_dir.join("artifacts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinner::PinRequest;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.server.port, 8008);
        assert_eq!(config.server.max_attempts, 50);
        assert!(config.library_pins().is_empty());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("regress.toml")).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("regress-results"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regress.toml");
        std::fs::write(
            &path,
            r#"
examples_root = "/books/pcc"

[server]
port = 8010

[pins]
django = "unpinned"
matplotlib = "3.8.2"
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.examples_root, PathBuf::from("/books/pcc"));
        assert_eq!(config.server.port, 8010);
        assert_eq!(config.server.poll_interval_ms, 200);

        let pins = config.library_pins();
        assert_eq!(pins.get("django"), Some(&PinRequest::Unpinned));
        assert_eq!(pins.get("matplotlib"), Some(&PinRequest::Exact("3.8.2".to_string())));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regress.toml");
        std::fs::write(&path, "server = 3").unwrap();
        assert!(HarnessConfig::load(&path).is_err());
    }
}
