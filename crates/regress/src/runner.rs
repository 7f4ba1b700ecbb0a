//! Main runner that sequences provisioning, transforms, execution and comparison

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::{ScriptSubject, SubjectKind, SubjectSpec, WebAppSubject};
use crate::command::run_command;
use crate::compare::{compare_stdout, ArtifactComparator, ComparisonResult};
use crate::config::HarnessConfig;
use crate::environment::IsolatedEnvironment;
use crate::error::{RegressError, RegressResult};
use crate::pinner::{LibraryPins, VersionPinner};
use crate::server::StopReport;
use crate::transform::apply_transforms;
use crate::webapp::run_web_app;

/// Result of running a single subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub stdout: Option<String>,
    pub comparisons: Vec<ComparisonResult>,
    /// Where the subject's outputs were copied for inspection
    pub artifacts_dir: Option<PathBuf>,
    pub server_stop: Option<StopReport>,
    pub error: Option<String>,
}

/// Result of running a set of subjects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub started_at: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    /// Effective version of every library provisioned during the run
    pub library_versions: BTreeMap<String, String>,
    pub results: Vec<SubjectResult>,
}

/// What a subject run produced before it was judged
#[derive(Debug, Default)]
struct Outcome {
    stdout: Option<String>,
    comparisons: Vec<ComparisonResult>,
    artifacts_dir: Option<PathBuf>,
    server_stop: Option<StopReport>,
}

/// Regression runner for the example corpus
pub struct RegressionRunner {
    config: HarnessConfig,
    pins: LibraryPins,
    session: Option<IsolatedEnvironment>,
    pinner: VersionPinner,
}

impl RegressionRunner {
    pub fn with_config(config: HarnessConfig) -> Self {
        let pins = config.library_pins();
        Self {
            config,
            pins,
            session: None,
            pinner: VersionPinner::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The session environment, resolved on first use
    fn session_env(&mut self) -> RegressResult<IsolatedEnvironment> {
        if let Some(env) = &self.session {
            return Ok(env.clone());
        }

        let root = self.config.venv_root.as_deref().ok_or_else(|| {
            RegressError::Environment(
                "no isolated environment configured (use --venv or activate one)".to_string(),
            )
        })?;
        let env = IsolatedEnvironment::session(root)?;
        info!("Using interpreter {}", env.python().display());

        self.session = Some(env.clone());
        Ok(env)
    }

    /// Run all subjects in the catalog directory
    pub async fn run_all(&mut self) -> RegressResult<SuiteResult> {
        let specs = SubjectSpec::load_all(&self.config.subjects_dir)?;
        self.run_subjects(&specs).await
    }

    /// Run subjects matching a tag
    pub async fn run_tagged(&mut self, tag: &str) -> RegressResult<SuiteResult> {
        let specs = SubjectSpec::load_all(&self.config.subjects_dir)?;
        let filtered: Vec<SubjectSpec> = SubjectSpec::filter_by_tag(&specs, tag)
            .into_iter()
            .cloned()
            .collect();
        self.run_subjects(&filtered).await
    }

    /// Run a specific subject by name
    pub async fn run_named(&mut self, name: &str) -> RegressResult<SuiteResult> {
        let specs = SubjectSpec::load_all(&self.config.subjects_dir)?;
        let spec = specs
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RegressError::Catalog(format!("Subject not found: {}", name)))?;
        self.run_subjects(std::slice::from_ref(&spec)).await
    }

    /// Run a list of subjects
    pub async fn run_subjects(&mut self, specs: &[SubjectSpec]) -> RegressResult<SuiteResult> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let start = Instant::now();
        let mut results = Vec::new();
        let mut passed = 0;
        let mut failed = 0;

        info!("Running {} subject(s)...", specs.len());

        for spec in specs {
            let result = self.run_subject(spec).await;
            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!(
                    "✗ {} - {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        info!("");
        info!("Results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        Ok(SuiteResult {
            started_at,
            total: specs.len(),
            passed,
            failed,
            duration_ms,
            library_versions: self
                .pinner
                .provisioned()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            results,
        })
    }

    /// Run a single subject. Every failure is captured in the result.
    pub async fn run_subject(&mut self, spec: &SubjectSpec) -> SubjectResult {
        let start = Instant::now();
        debug!("Running subject: {}", spec.name);

        let outcome = match spec.kind() {
            Ok(SubjectKind::Script(script)) => self.run_script(spec, script),
            Ok(SubjectKind::WebApp(app)) => self.run_web_app_subject(spec, app).await,
            Err(e) => Err(e),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) => {
                let failures: Vec<String> = outcome
                    .comparisons
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| c.to_string())
                    .collect();
                let error = if failures.is_empty() {
                    None
                } else {
                    let mut message = failures.join("; ");
                    if let Some(dir) = &outcome.artifacts_dir {
                        message.push_str(&format!(" (artifacts: {})", dir.display()));
                    }
                    Some(message)
                };

                SubjectResult {
                    name: spec.name.clone(),
                    success: error.is_none(),
                    duration_ms,
                    stdout: outcome.stdout,
                    comparisons: outcome.comparisons,
                    artifacts_dir: outcome.artifacts_dir,
                    server_stop: outcome.server_stop,
                    error,
                }
            }
            Err(e) => SubjectResult {
                name: spec.name.clone(),
                success: false,
                duration_ms,
                stdout: None,
                comparisons: vec![],
                artifacts_dir: e.artifacts_dir().map(Path::to_path_buf),
                server_stop: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn run_script(&mut self, spec: &SubjectSpec, script: &ScriptSubject) -> RegressResult<Outcome> {
        let env = self.session_env()?;
        if let Some(library) = &spec.library {
            self.pinner.ensure(&env, library, self.pins.get(library))?;
        }

        // The work directory is deleted when `work` is dropped
        let work = tempfile::Builder::new()
            .prefix(&format!("regress-{}-", spec.name))
            .tempdir()?;
        debug!("{} work directory: {}", spec.name, work.path().display());

        match self.exercise_script(&env, spec, script, work.path()) {
            Ok(mut outcome) => {
                let failed = outcome.comparisons.iter().any(|c| !c.passed);
                if failed || self.config.keep_artifacts {
                    let dir = self.subject_artifacts_dir(spec);
                    keep_work_files(work.path(), &dir, outcome.stdout.as_deref())?;
                    info!("{} artifacts kept in {}", spec.name, dir.display());
                    outcome.artifacts_dir = Some(dir);
                }
                Ok(outcome)
            }
            Err(e) => {
                let dir = self.subject_artifacts_dir(spec);
                match keep_work_files(work.path(), &dir, None) {
                    Ok(()) => {
                        info!("{} work files kept in {}", spec.name, dir.display());
                        Err(e.kept_in(dir))
                    }
                    Err(keep_err) => {
                        warn!("Could not keep work files of {}: {}", spec.name, keep_err);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Copy-in, transform, run and compare inside `work`
    fn exercise_script(
        &self,
        env: &IsolatedEnvironment,
        spec: &SubjectSpec,
        script: &ScriptSubject,
        work: &Path,
    ) -> RegressResult<Outcome> {
        prepare_work_dir(&self.config.examples_root, script, work)?;

        if !script.transform.is_empty() {
            let path = work.join(&script.script);
            let source = std::fs::read_to_string(&path)?;
            std::fs::write(&path, apply_transforms(&source, &script.transform)?)?;
        }

        let before = list_files(work)?;
        let stdout = run_command(
            &env.command()
                .arg(script.script.as_os_str())
                .current_dir(work)
                .envs(&spec.env),
        )
        .map_err(|e| match e {
            RegressError::CommandFailed { .. } => RegressError::SubjectCrash {
                subject: spec.name.clone(),
                reason: e.to_string(),
            },
            other => other,
        })?;

        let mut outcome = Outcome {
            stdout: Some(stdout.clone()),
            ..Outcome::default()
        };
        outcome
            .comparisons
            .push(compare_stdout(&stdout, &script.expect.stdout));

        if let Some(artifact) = &script.expect.artifact {
            let new_files: Vec<String> = list_files(work)?
                .difference(&before)
                .cloned()
                .collect();
            if new_files != [artifact.output.clone()] {
                return Err(RegressError::AssertionFailed(format!(
                    "expected exactly one new file '{}', found {:?}",
                    artifact.output, new_files
                )));
            }

            let output_path = work.join(&artifact.output);
            info!("{} output: {}", spec.name, output_path.display());

            let reference_name = artifact
                .reference
                .clone()
                .unwrap_or_else(|| default_reference_name(&script.script, &artifact.output));
            let reference = self.config.reference_dir.join(reference_name);

            let comparator = ArtifactComparator::new(Some(self.subject_artifacts_dir(spec)));
            outcome
                .comparisons
                .push(comparator.compare_file(&output_path, &reference, &artifact.compare)?);
        }

        Ok(outcome)
    }

    async fn run_web_app_subject(
        &mut self,
        spec: &SubjectSpec,
        app: &WebAppSubject,
    ) -> RegressResult<Outcome> {
        let base = self.session_env()?;
        let report = run_web_app(&self.config, &self.pins, &base, spec, app).await?;

        if let Some(library) = &spec.library {
            self.pinner.record(library, &report.library_version);
        }

        Ok(Outcome {
            comparisons: report.checks,
            server_stop: Some(report.server_stop),
            ..Outcome::default()
        })
    }

    fn subject_artifacts_dir(&self, spec: &SubjectSpec) -> PathBuf {
        self.config.artifacts_dir().join(&spec.name)
    }

    /// Write suite results to JSON file
    pub fn write_results(&self, results: &SuiteResult) -> RegressResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("regress-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Copy a script subject into its work directory
pub fn prepare_work_dir(examples_root: &Path, script: &ScriptSubject, work: &Path) -> RegressResult<()> {
    let source_dir = examples_root.join(&script.source_dir);

    for extra in &script.extra_files {
        let name = extra
            .file_name()
            .ok_or_else(|| RegressError::Catalog(format!("invalid extra file: {}", extra.display())))?;
        copy_file(&examples_root.join(extra), &work.join(name))?;
    }

    for file in &script.files {
        copy_file(&source_dir.join(file), &work.join(file))?;
    }

    let script_path = work.join(&script.script);
    if !script_path.exists() {
        copy_file(&source_dir.join(&script.script), &script_path)?;
    }

    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> RegressResult<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to).map_err(|e| {
        RegressError::Catalog(format!("cannot copy {}: {}", from.display(), e))
    })?;
    Ok(())
}

/// Regular files directly inside `dir`
pub fn list_files(dir: &Path) -> RegressResult<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.insert(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(files)
}

/// `mpl_squares.py` writing `output_file.png` is checked against
/// `mpl_squares.png`
pub fn default_reference_name(script: &Path, output: &str) -> String {
    let stem = script.file_stem().unwrap_or_default().to_string_lossy();
    match Path::new(output).extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem.to_string(),
    }
}

/// Copy the regular files of a work directory (transformed program,
/// outputs) for inspection, plus captured stdout when there is any
fn keep_work_files(work: &Path, dir: &Path, stdout: Option<&str>) -> RegressResult<()> {
    std::fs::create_dir_all(dir)?;
    for name in list_files(work)? {
        if let Err(e) = std::fs::copy(work.join(&name), dir.join(&name)) {
            warn!("Could not keep {}: {}", name, e);
        }
    }
    if let Some(stdout) = stdout {
        std::fs::write(dir.join("stdout.txt"), stdout)?;
    }
    Ok(())
}
