//! Command runner - synchronous execution of external programs

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{RegressError, RegressResult};

/// A fully described invocation of an external program
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub envs: BTreeMap<String, String>,
}

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, trimmed of leading and trailing whitespace
    pub stdout: String,
    pub stderr: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.envs
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Render the command line for log and error messages
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.envs);
        cmd
    }
}

/// Run a command to completion and capture its output.
///
/// A program that cannot be started is an environment error; a nonzero
/// exit is reported as [`RegressError::CommandFailed`] with the captured
/// stderr attached. Neither is retried.
pub fn run(spec: &CommandSpec) -> RegressResult<CommandOutput> {
    debug!("Running: {}", spec.display());

    let output = spec.to_command().output().map_err(|e| {
        RegressError::Environment(format!("cannot run {}: {}", spec.program.display(), e))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        return Err(RegressError::CommandFailed {
            command: spec.display(),
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Run a command and return its trimmed standard output
pub fn run_command(spec: &CommandSpec) -> RegressResult<String> {
    run(spec).map(|output| output.stdout)
}
