//! Source transforms that make example programs run unattended
//!
//! Every step is a pure text rewrite. Steps that name a target require it
//! to occur exactly once; a subject whose shape changed fails loudly
//! instead of silently running unmodified.

use serde::{Deserialize, Serialize};

use crate::error::{RegressError, RegressResult};

/// A single rewrite applied to a subject's source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransformStep {
    /// Replace the single occurrence of `target`
    ReplaceOnce { target: String, replacement: String },

    /// Delete the single line whose trimmed text equals `target`
    RemoveLine { target: String },

    /// Drop the single line equal to `target` and everything after it
    TruncateAt { target: String },

    /// Remove up to `spaces` leading spaces from every line
    Dedent { spaces: usize },

    /// Add a line at the end
    Append { line: String },

    /// Seed the pseudo-random generator before its first use
    SeedRandom { seed: u64 },
}

impl TransformStep {
    pub fn apply(&self, source: &str) -> RegressResult<String> {
        match self {
            TransformStep::ReplaceOnce { target, replacement } => {
                expect_once(target, source.matches(target.as_str()).count())?;
                Ok(source.replacen(target.as_str(), replacement, 1))
            }
            TransformStep::RemoveLine { target } => {
                let mut lines = split_lines(source);
                let index = find_line_once(&lines, target)?;
                lines.remove(index);
                Ok(join_lines(&lines))
            }
            TransformStep::TruncateAt { target } => {
                let mut lines = split_lines(source);
                let index = find_line_once(&lines, target)?;
                lines.truncate(index);
                Ok(join_lines(&lines))
            }
            TransformStep::Dedent { spaces } => {
                let lines: Vec<&str> = split_lines(source)
                    .into_iter()
                    .map(|line| {
                        let indent = line.len() - line.trim_start_matches(' ').len();
                        &line[indent.min(*spaces)..]
                    })
                    .collect();
                Ok(join_lines(&lines))
            }
            TransformStep::Append { line } => {
                let mut lines = split_lines(source);
                lines.push(line.as_str());
                Ok(join_lines(&lines))
            }
            TransformStep::SeedRandom { seed } => Ok(seed_random(source, *seed)),
        }
    }
}

/// Apply `steps` in order
pub fn apply_transforms(source: &str, steps: &[TransformStep]) -> RegressResult<String> {
    steps
        .iter()
        .try_fold(source.to_string(), |text, step| step.apply(&text))
}

fn expect_once(target: &str, found: usize) -> RegressResult<()> {
    if found != 1 {
        return Err(RegressError::TransformTarget {
            target: target.to_string(),
            found,
        });
    }
    Ok(())
}

fn find_line_once(lines: &[&str], target: &str) -> RegressResult<usize> {
    let matches: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.trim() == target)
        .map(|(i, _)| i)
        .collect();
    expect_once(target, matches.len())?;
    Ok(matches[0])
}

fn split_lines(source: &str) -> Vec<&str> {
    source.lines().collect()
}

fn join_lines(lines: &[&str]) -> String {
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Top-level import statement; indented imports belong to a block
fn is_import(line: &str) -> bool {
    line.starts_with("import ") || line.starts_with("from ")
}

fn paren_depth(line: &str) -> isize {
    line.matches('(').count() as isize - line.matches(')').count() as isize
}

/// Index just past the leading import block, and whether that block
/// imports `random` itself. A parenthesized or backslash-continued import
/// counts as one statement.
fn leading_imports(lines: &[&str]) -> (usize, bool) {
    let mut end = 0;
    let mut imports_random = false;
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if is_import(lines[i]) {
            imports_random |= trimmed == "import random";
            let mut depth = paren_depth(trimmed);
            let mut continued = trimmed.ends_with('\\');
            while (depth > 0 || continued) && i + 1 < lines.len() {
                i += 1;
                let next = lines[i].trim();
                depth += paren_depth(next);
                continued = next.ends_with('\\');
            }
            end = i + 1;
        } else if !trimmed.is_empty() && !trimmed.starts_with('#') {
            break;
        }
        i += 1;
    }
    (end, imports_random)
}

/// Seed the random generator right after the leading import block,
/// importing `random` first unless that block already does.
fn seed_random(source: &str, seed: u64) -> String {
    let seed_line = format!("random.seed({})", seed);
    let mut lines = split_lines(source);

    let (end, imports_random) = leading_imports(&lines);
    let at = if imports_random {
        end
    } else {
        lines.insert(0, "import random");
        end + 1
    };
    lines.insert(at, seed_line.as_str());
    join_lines(&lines)
}
