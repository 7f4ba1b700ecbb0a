//! Library version pinning for isolated environments

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::environment::{same_package, IsolatedEnvironment};
use crate::error::{RegressError, RegressResult};

/// Keyword that selects the newest available release
pub const UNPINNED: &str = "unpinned";

/// What an operator asked for on the command line or in the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinRequest {
    /// Install the latest release, ignoring any pinned requirement
    Unpinned,
    /// Install exactly this version
    Exact(String),
}

impl PinRequest {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case(UNPINNED) {
            PinRequest::Unpinned
        } else {
            PinRequest::Exact(value.to_string())
        }
    }
}

impl fmt::Display for PinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinRequest::Unpinned => f.write_str(UNPINNED),
            PinRequest::Exact(v) => f.write_str(v),
        }
    }
}

/// Pin requests keyed by library name
#[derive(Debug, Clone, Default)]
pub struct LibraryPins {
    pins: BTreeMap<String, PinRequest>,
}

impl LibraryPins {
    pub fn from_strings(raw: &BTreeMap<String, String>) -> Self {
        let pins = raw
            .iter()
            .map(|(lib, v)| (lib.to_ascii_lowercase(), PinRequest::parse(v)))
            .collect();
        Self { pins }
    }

    pub fn set(&mut self, library: &str, request: PinRequest) {
        self.pins.insert(library.to_ascii_lowercase(), request);
    }

    pub fn get(&self, library: &str) -> Option<&PinRequest> {
        self.pins.get(&library.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Provisions each library group once per session and remembers the
/// effective version it ended up with.
#[derive(Debug, Default)]
pub struct VersionPinner {
    provisioned: HashMap<String, String>,
}

impl VersionPinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the requested version of `library` (if any) and report the
    /// version that is actually installed afterwards.
    pub fn ensure(
        &mut self,
        env: &IsolatedEnvironment,
        library: &str,
        request: Option<&PinRequest>,
    ) -> RegressResult<String> {
        let key = library.to_ascii_lowercase();
        if let Some(version) = self.provisioned.get(&key) {
            return Ok(version.clone());
        }

        let version = pin_library(env, library, request)?;
        self.provisioned.insert(key, version.clone());
        Ok(version)
    }

    /// Record a version provisioned outside the session environment
    pub fn record(&mut self, library: &str, version: &str) {
        self.provisioned
            .insert(library.to_ascii_lowercase(), version.to_string());
    }

    pub fn provisioned(&self) -> impl Iterator<Item = (&String, &String)> {
        self.provisioned.iter()
    }
}

/// Install `library` according to `request` and return the effective version.
///
/// Install failures propagate; they are never downgraded to warnings.
pub fn pin_library(
    env: &IsolatedEnvironment,
    library: &str,
    request: Option<&PinRequest>,
) -> RegressResult<String> {
    match request {
        Some(PinRequest::Exact(version)) => {
            info!("Installing {}=={} ...", library, version);
            env.pip_install([format!("{}=={}", library, version)])?;
        }
        Some(PinRequest::Unpinned) => {
            info!("Installing latest {} ...", library);
            env.pip_install(["--upgrade", library])?;
        }
        None => {}
    }

    let installed = env.installed_version(library)?.ok_or_else(|| {
        RegressError::Environment(format!("{} is not installed in {}", library, env.root().display()))
    })?;

    if let Some(PinRequest::Exact(requested)) = request {
        if &installed != requested {
            return Err(RegressError::VersionMismatch {
                library: library.to_string(),
                requested: requested.clone(),
                installed,
            });
        }
    }

    info!("Testing against {} {}", library, installed);
    Ok(installed)
}

/// Rewrite a requirements file for a pin request.
///
/// `None` leaves the pinned file untouched. Both `Unpinned` and `Exact`
/// replace it with `unpinned` (one requirement per entry); `Exact`
/// additionally pins `library`.
pub fn rewrite_requirements(
    path: &Path,
    library: &str,
    request: Option<&PinRequest>,
    unpinned: &[String],
) -> RegressResult<()> {
    let Some(request) = request else {
        return Ok(());
    };

    info!("Unpinning versions in {}", path.display());
    let mut contents = String::new();
    for requirement in unpinned {
        match request {
            PinRequest::Exact(version) if same_package(requirement, library) => {
                contents.push_str(&format!("{}=={}\n", requirement, version));
            }
            _ => {
                contents.push_str(requirement);
                contents.push('\n');
            }
        }
    }

    std::fs::write(path, contents)?;
    Ok(())
}
