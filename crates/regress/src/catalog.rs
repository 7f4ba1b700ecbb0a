//! Declarative YAML catalog of subjects under test

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::compare::CompareMode;
use crate::error::{RegressError, RegressResult};
use crate::transform::TransformStep;

/// One example program (or project) and what it must produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectSpec {
    /// Unique name for this subject
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering subjects
    #[serde(default)]
    pub tags: Vec<String>,

    /// Library whose version this subject exercises (pinned before it runs)
    #[serde(default)]
    pub library: Option<String>,

    /// Extra environment variables for the subject's processes
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// A standalone program run once
    #[serde(default)]
    pub script: Option<ScriptSubject>,

    /// A web project served by a development server
    #[serde(default)]
    pub web_app: Option<WebAppSubject>,
}

/// Borrowed view of what kind of subject a spec describes
#[derive(Debug, Clone, Copy)]
pub enum SubjectKind<'a> {
    Script(&'a ScriptSubject),
    WebApp(&'a WebAppSubject),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSubject {
    /// Directory of the program, relative to the examples root
    pub source_dir: PathBuf,

    /// Program file that is run, relative to the work directory
    pub script: PathBuf,

    /// Additional files from `source_dir`, copied keeping their relative
    /// layout (sibling modules, `weather_data/...csv`, images)
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Files from elsewhere in the corpus, copied to the work directory root
    #[serde(default)]
    pub extra_files: Vec<PathBuf>,

    /// Rewrites applied to the copied `script`
    #[serde(default)]
    pub transform: Vec<TransformStep>,

    pub expect: ExpectedOutcome,
}

/// What a run must produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Exact stdout, compared after trimming outer whitespace
    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub artifact: Option<ArtifactExpectation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactExpectation {
    /// File the transformed program writes into its work directory
    pub output: String,

    /// Golden file name in the reference directory
    #[serde(default)]
    pub reference: Option<String>,

    #[serde(default = "default_compare")]
    pub compare: CompareMode,
}

fn default_compare() -> CompareMode {
    CompareMode::ExactBytes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAppSubject {
    /// Project directory, relative to the examples root
    pub project_dir: PathBuf,

    /// Name of the nested environment built inside the project copy
    #[serde(default = "default_venv_name")]
    pub venv_name: String,

    #[serde(default = "default_requirements")]
    pub requirements: PathBuf,

    /// Requirement list written when the pinned versions are overridden
    #[serde(default)]
    pub unpinned_requirements: Vec<String>,

    /// Packages that must show up in `pip freeze` after installation
    #[serde(default)]
    pub required_packages: Vec<String>,

    /// Substrings expected in `manage.py migrate` output
    #[serde(default)]
    pub migrate_expect: Vec<String>,

    /// Substring expected in `manage.py check` output
    #[serde(default = "default_check_expect")]
    pub check_expect: String,

    /// Functional requests issued against the running server
    #[serde(default)]
    pub checks: Vec<HttpCheck>,
}

fn default_venv_name() -> String {
    "ll_env".to_string()
}

fn default_requirements() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_check_expect() -> String {
    "System check identified no issues (0 silenced).".to_string()
}

/// A single functional request against the running server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheck {
    pub path: String,

    #[serde(default = "default_status")]
    pub status: u16,

    /// Substrings the response body must contain
    #[serde(default)]
    pub contains: Vec<String>,

    /// Expected `Location` header prefix for redirects
    #[serde(default)]
    pub redirect_to: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl SubjectSpec {
    /// Parse a subject from YAML string
    pub fn from_yaml(yaml: &str) -> RegressResult<Self> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.kind()?;
        Ok(spec)
    }

    /// Parse every subject of a multi-document YAML file
    pub fn from_file(path: &Path) -> RegressResult<Vec<Self>> {
        let content = std::fs::read_to_string(path)?;
        let mut specs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&content) {
            let spec = Self::deserialize(document)?;
            spec.kind().map_err(|e| {
                RegressError::Catalog(format!("{}: {}", path.display(), e))
            })?;
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Load all subjects from a directory
    pub fn load_all(dir: &Path) -> RegressResult<Vec<Self>> {
        if !dir.is_dir() {
            return Err(RegressError::Catalog(format!(
                "subject directory not found: {}",
                dir.display()
            )));
        }

        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let mut specs = Vec::new();
        for file in files {
            specs.extend(Self::from_file(&file)?);
        }

        let mut names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(RegressError::Catalog(format!("duplicate subject name: {}", pair[0])));
        }

        Ok(specs)
    }

    /// Filter specs by tag
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Exactly one of `script` and `web_app` must be set
    pub fn kind(&self) -> RegressResult<SubjectKind<'_>> {
        match (&self.script, &self.web_app) {
            (Some(script), None) => Ok(SubjectKind::Script(script)),
            (None, Some(web_app)) => Ok(SubjectKind::WebApp(web_app)),
            _ => Err(RegressError::Catalog(format!(
                "subject '{}' must define exactly one of `script` and `web_app`",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_subject() {
        let yaml = r#"
name: die-visual
library: plotly
tags: [plotly, chapter-15]
script:
  source_dir: chapter_15/rolling_dice
  script: die_visual.py
  files: [die.py]
  transform:
    - action: seed_random
      seed: 23
    - action: replace_once
      target: fig.show()
      replacement: fig.write_html("die_visual.html")
  expect:
    artifact:
      output: die_visual.html
      compare: normalized_bytes
"#;
        let spec = SubjectSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "die-visual");
        assert_eq!(spec.library.as_deref(), Some("plotly"));

        let SubjectKind::Script(script) = spec.kind().unwrap() else {
            panic!("expected a script subject");
        };
        assert_eq!(script.transform.len(), 2);
        assert_eq!(script.expect.stdout, "");
        let artifact = script.expect.artifact.as_ref().unwrap();
        assert_eq!(artifact.compare, CompareMode::NormalizedBytes);
        assert!(artifact.reference.is_none());
    }

    #[test]
    fn test_parse_web_app_subject() {
        let yaml = r#"
name: learning-log
library: django
web_app:
  project_dir: chapter_20/deploying_learning_log
  required_packages: [Django, django-bootstrap5]
  checks:
    - path: /
      contains: [Learning Log]
    - path: /topics/
      status: 302
      redirect_to: /users/login/
"#;
        let spec = SubjectSpec::from_yaml(yaml).unwrap();
        let SubjectKind::WebApp(app) = spec.kind().unwrap() else {
            panic!("expected a web app subject");
        };
        assert_eq!(app.venv_name, "ll_env");
        assert_eq!(app.check_expect, "System check identified no issues (0 silenced).");
        assert_eq!(app.checks[0].status, 200);
        assert_eq!(app.checks[1].redirect_to.as_deref(), Some("/users/login/"));
    }

    #[test]
    fn test_subject_needs_exactly_one_kind() {
        let yaml = "name: nothing\n";
        assert!(matches!(
            SubjectSpec::from_yaml(yaml),
            Err(RegressError::Catalog(_))
        ));
    }

    #[test]
    fn test_load_all_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let doc = "name: hello\nscript:\n  source_dir: a\n  script: a.py\n  expect:\n    stdout: hi\n";
        std::fs::write(dir.path().join("a.yaml"), doc).unwrap();
        std::fs::write(dir.path().join("b.yaml"), doc).unwrap();
        assert!(SubjectSpec::load_all(dir.path()).is_err());
    }
}
