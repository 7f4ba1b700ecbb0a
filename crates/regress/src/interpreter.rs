//! Interpreter resolution for isolated environments

use std::path::{Path, PathBuf};

use crate::error::{RegressError, RegressResult};

/// Directory layout convention of an isolated environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// Path of the interpreter inside an environment rooted at `root`
pub fn interpreter_path(root: &Path, platform: Platform) -> PathBuf {
    match platform {
        Platform::Posix => root.join("bin").join("python"),
        Platform::Windows => root.join("Scripts").join("python.exe"),
    }
}

/// Resolve the interpreter for the current platform, refusing to fall back
/// to whatever `python` happens to be on `PATH`.
///
/// The returned path is absolute so that it stays valid for commands run
/// from another working directory. Only the root is canonicalized; the
/// interpreter itself is usually a symlink out of the environment.
pub fn resolve_interpreter(root: &Path) -> RegressResult<PathBuf> {
    let root = canonical_root(root)?;
    let path = interpreter_path(&root, Platform::current());
    if !path.exists() {
        return Err(RegressError::Environment(format!(
            "no interpreter at {} (is the environment set up?)",
            path.display()
        )));
    }
    Ok(path)
}

/// Absolute, symlink-free form of an environment root
pub fn canonical_root(root: &Path) -> RegressResult<PathBuf> {
    std::fs::canonicalize(root).map_err(|e| {
        RegressError::Environment(format!("no environment at {}: {}", root.display(), e))
    })
}
