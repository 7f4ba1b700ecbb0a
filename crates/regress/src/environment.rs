//! Isolated interpreter environments and their installed package sets

use std::path::{Path, PathBuf};
use tracing::info;

use crate::command::{run_command, CommandSpec};
use crate::error::{RegressError, RegressResult};
use crate::interpreter::{canonical_root, resolve_interpreter};

/// One line of `pip freeze`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

/// An interpreter plus the packages installed next to it
#[derive(Debug, Clone)]
pub struct IsolatedEnvironment {
    root: PathBuf,
    python: PathBuf,
}

impl IsolatedEnvironment {
    /// Wrap an environment that already exists, e.g. the one the harness
    /// session was started from.
    pub fn session(root: &Path) -> RegressResult<Self> {
        let python = resolve_interpreter(root)?;
        Ok(Self {
            root: canonical_root(root)?,
            python,
        })
    }

    /// Build a fresh environment `parent/name` from `base_python`.
    pub fn create(base_python: &Path, parent: &Path, name: &str) -> RegressResult<Self> {
        info!("Building environment {} ...", parent.join(name).display());

        let output = run_command(
            &CommandSpec::new(base_python)
                .args(["-m", "venv", name])
                .current_dir(parent),
        )?;
        if !output.is_empty() {
            return Err(RegressError::Environment(format!(
                "unexpected output while creating environment: {}",
                output
            )));
        }

        let env = Self::session(&parent.join(name))?;

        // A fresh environment has nothing installed
        let installed = env.freeze()?;
        if !installed.is_empty() {
            return Err(RegressError::Environment(format!(
                "new environment is not empty: {} package(s) installed",
                installed.len()
            )));
        }

        Ok(env)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// A command that runs this environment's interpreter
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.python)
    }

    pub fn pip_install<I, S>(&self, args: I) -> RegressResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        run_command(&self.command().args(["-m", "pip", "install"]).args(args))
    }

    pub fn install_requirements(&self, path: &Path) -> RegressResult<String> {
        self.pip_install([std::ffi::OsString::from("-r"), path.as_os_str().to_os_string()])
    }

    pub fn freeze(&self) -> RegressResult<Vec<InstalledPackage>> {
        let output = run_command(&self.command().args(["-m", "pip", "freeze"]))?;
        Ok(parse_freeze(&output))
    }

    /// Installed version of `library`, if any
    pub fn installed_version(&self, library: &str) -> RegressResult<Option<String>> {
        Ok(self
            .freeze()?
            .into_iter()
            .find(|p| same_package(&p.name, library))
            .map(|p| p.version))
    }

    pub fn python_version(&self) -> RegressResult<String> {
        run_command(&self.command().arg("--version"))
    }
}

/// Parse `pip freeze` output. Editable and URL installs have no `==`
/// and are skipped.
pub fn parse_freeze(output: &str) -> Vec<InstalledPackage> {
    output
        .lines()
        .filter_map(|line| {
            let (name, version) = line.trim().split_once("==")?;
            Some(InstalledPackage {
                name: name.trim().to_string(),
                version: version.trim().to_string(),
            })
        })
        .collect()
}

/// Package names compare case-insensitively with `-` and `_` equivalent
pub fn same_package(a: &str, b: &str) -> bool {
    let canon = |s: &str| s.to_ascii_lowercase().replace('_', "-");
    canon(a) == canon(b)
}
