//! Web project subjects: nested environment, migrations, live server checks

use std::path::Path;
use tracing::{debug, info, warn};

use crate::catalog::{HttpCheck, SubjectSpec, WebAppSubject};
use crate::command::run_command;
use crate::compare::{ComparisonResult, Mismatch};
use crate::config::HarnessConfig;
use crate::environment::{same_package, IsolatedEnvironment};
use crate::error::{RegressError, RegressResult};
use crate::pinner::{rewrite_requirements, LibraryPins, PinRequest};
use crate::server::{with_server, ServerConfig, StopReport, RUNSERVER_LOG};

const DEFAULT_LIBRARY: &str = "django";

/// What a web project run established
#[derive(Debug, Clone)]
pub struct WebAppReport {
    pub python_version: String,
    pub library_version: String,
    pub checks: Vec<ComparisonResult>,
    pub server_stop: StopReport,
}

/// Copy the project, build its own environment from `base`, migrate,
/// check, then exercise it through a live development server.
///
/// When anything fails, the server log and the requirements file are
/// copied to the subject's artifacts directory and the error names it.
pub async fn run_web_app(
    config: &HarnessConfig,
    pins: &LibraryPins,
    base: &IsolatedEnvironment,
    spec: &SubjectSpec,
    app: &WebAppSubject,
) -> RegressResult<WebAppReport> {
    let work = tempfile::Builder::new()
        .prefix(&format!("regress-{}-", spec.name))
        .tempdir()?;
    let project_name = app
        .project_dir
        .file_name()
        .ok_or_else(|| RegressError::Catalog(format!("invalid project dir: {}", app.project_dir.display())))?;
    let project = work.path().join(project_name);
    copy_project(&config.examples_root.join(&app.project_dir), &project, &app.venv_name)?;

    match exercise_project(config, pins, base, spec, app, &project).await {
        Ok(report) => Ok(report),
        Err(e) => {
            let dir = config.artifacts_dir().join(&spec.name);
            match keep_project_files(&project, app, &dir) {
                Ok(()) => {
                    info!("{} server log kept in {}", spec.name, dir.display());
                    Err(e.kept_in(dir))
                }
                Err(keep_err) => {
                    warn!("Could not keep project files of {}: {}", spec.name, keep_err);
                    Err(e)
                }
            }
        }
    }
}

async fn exercise_project(
    config: &HarnessConfig,
    pins: &LibraryPins,
    base: &IsolatedEnvironment,
    spec: &SubjectSpec,
    app: &WebAppSubject,
    project: &Path,
) -> RegressResult<WebAppReport> {
    let library = spec.library.as_deref().unwrap_or(DEFAULT_LIBRARY);
    let request = pins.get(library);

    if request.is_some() && app.unpinned_requirements.is_empty() {
        return Err(RegressError::Catalog(format!(
            "subject '{}' has no unpinned requirement list for a {} override",
            spec.name, library
        )));
    }
    rewrite_requirements(
        &project.join(&app.requirements),
        library,
        request,
        &app.unpinned_requirements,
    )?;

    let env = IsolatedEnvironment::create(base.python(), project, &app.venv_name)?;
    env.install_requirements(&project.join(&app.requirements))?;
    verify_installed(&env, &app.required_packages)?;

    let library_version = env.installed_version(library)?.ok_or_else(|| {
        RegressError::Environment(format!("{} is not installed in {}", library, env.root().display()))
    })?;
    if let Some(PinRequest::Exact(requested)) = request {
        if &library_version != requested {
            return Err(RegressError::VersionMismatch {
                library: library.to_string(),
                requested: requested.clone(),
                installed: library_version,
            });
        }
    }

    let migrate = run_command(
        &env.command()
            .args(["manage.py", "migrate"])
            .current_dir(project)
            .envs(&spec.env),
    )?;
    for expected in &app.migrate_expect {
        if !migrate.contains(expected.as_str()) {
            return Err(RegressError::AssertionFailed(format!(
                "migration output is missing {:?}",
                expected
            )));
        }
    }

    let check = run_command(
        &env.command()
            .args(["manage.py", "check"])
            .current_dir(project)
            .envs(&spec.env),
    )?;
    if !check.contains(app.check_expect.as_str()) {
        return Err(RegressError::AssertionFailed(format!(
            "project check reported: {}",
            check
        )));
    }

    let mut server = ServerConfig::runserver(env.python(), project, &config.server);
    server.envs.extend(spec.env.clone());

    info!("Running functional checks...");
    let (checks, server_stop) =
        with_server(server, |base_url| run_http_checks(base_url, &app.checks)).await?;

    let python_version = env.python_version()?;
    info!("Tested {} using:", spec.name);
    info!("  {}", python_version);
    info!("  {} {}", library, library_version);

    Ok(WebAppReport {
        python_version,
        library_version,
        checks,
        server_stop,
    })
}

/// Copy the server log and the (possibly rewritten) requirements file of
/// a project for inspection. Files that were never written are skipped.
pub fn keep_project_files(project: &Path, app: &WebAppSubject, dir: &Path) -> RegressResult<()> {
    std::fs::create_dir_all(dir)?;
    for relative in [Path::new(RUNSERVER_LOG), app.requirements.as_path()] {
        let from = project.join(relative);
        if !from.is_file() {
            continue;
        }
        if let Some(name) = relative.file_name() {
            std::fs::copy(&from, dir.join(name))?;
        }
    }
    Ok(())
}

/// Copy a project tree, leaving out any environment and bytecode caches
pub fn copy_project(src: &Path, dest: &Path, venv_name: &str) -> RegressResult<()> {
    if !src.is_dir() {
        return Err(RegressError::Catalog(format!(
            "project directory not found: {}",
            src.display()
        )));
    }

    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        e.depth() == 0 || (name != venv_name && name != "__pycache__")
    });

    for entry in walker {
        let entry = entry.map_err(|e| RegressError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RegressError::Catalog(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    debug!("Copied {} to {}", src.display(), dest.display());
    Ok(())
}

fn verify_installed(env: &IsolatedEnvironment, required: &[String]) -> RegressResult<()> {
    let installed = env.freeze()?;
    for package in required {
        if !installed.iter().any(|p| same_package(&p.name, package)) {
            return Err(RegressError::AssertionFailed(format!(
                "{} is missing from the project environment",
                package
            )));
        }
    }
    Ok(())
}

/// Issue every check against `base_url`. Redirects are not followed so
/// that login-protected pages can be checked for their redirect target.
pub async fn run_http_checks(base_url: String, checks: &[HttpCheck]) -> RegressResult<Vec<ComparisonResult>> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let url = format!("{}{}", base_url.trim_end_matches('/'), check.path);
        debug!("GET {}", url);

        let resp = client.get(&url).send().await?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp.text().await?;

        results.push(judge_response(check, status, location.as_deref(), &body));
    }
    Ok(results)
}

/// Judge one response against its check
pub fn judge_response(check: &HttpCheck, status: u16, location: Option<&str>, body: &str) -> ComparisonResult {
    let label = format!("GET {}", check.path);
    let fail = |detail: Option<String>| {
        ComparisonResult::fail(
            &label,
            Mismatch::Http {
                status,
                expected_status: check.status,
                detail,
            },
        )
    };

    if status != check.status {
        return fail(None);
    }

    if let Some(expected) = &check.redirect_to {
        match location {
            Some(actual) if actual.starts_with(expected.as_str()) => {}
            Some(actual) => return fail(Some(format!("redirected to {}, expected {}", actual, expected))),
            None => return fail(Some(format!("no redirect, expected {}", expected))),
        }
    }

    if let Some(missing) = check.contains.iter().find(|s| !body.contains(s.as_str())) {
        return fail(Some(format!("body does not contain {:?}", missing)));
    }

    ComparisonResult::pass(&label)
}
