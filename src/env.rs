//! Working directory and environment helpers with scope guards.
//!
//! Changes made here affect the whole controlling process, including every
//! process started afterwards. The guards undo them when dropped unless
//! `keep()` is called.

use crate::command::Command;
use crate::error::Result;
use regex::Regex;
use std::collections::HashMap;
use std::env as stdenv;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static DECLARE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^declare -x ([^=]+)="(.*)"$"#).ok());

/// Snapshot of the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub vars: HashMap<String, String>,
    pub current_dir: PathBuf,
}

impl Environment {
    /// Capture the current process state.
    pub fn capture() -> Self {
        Self {
            vars: stdenv::vars().collect(),
            current_dir: stdenv::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Value of `key` in the snapshot.
    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Change the working directory of the process.
///
/// The returned guard changes back to the previous directory on drop.
pub fn cd(path: impl AsRef<Path>) -> Result<DirGuard> {
    let previous = stdenv::current_dir()?;
    let target = previous.join(path.as_ref()).canonicalize()?;
    stdenv::set_current_dir(&target)?;
    tracing::debug!(from = %previous.display(), to = %target.display(), "changed directory");
    Ok(DirGuard {
        previous: Some(previous),
    })
}

/// Restores the previous working directory on drop.
#[must_use = "the directory is changed back as soon as the guard is dropped; call keep() to stay"]
pub struct DirGuard {
    previous: Option<PathBuf>,
}

impl DirGuard {
    /// Stay in the new directory.
    pub fn keep(mut self) {
        self.previous = None;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = stdenv::set_current_dir(&previous) {
                tracing::warn!(dir = %previous.display(), error = %e, "could not restore directory");
            }
        }
    }
}

/// Set environment variables for the process and everything it starts.
///
/// On drop the guard restores every variable whose value is still the one
/// it set: previously unset variables are removed again, others get their
/// old value back. Variables changed in the meantime are left alone.
pub fn export<I, K, V>(vars: I) -> ExportGuard
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut guard = ExportGuard {
        previous: HashMap::new(),
        applied: HashMap::new(),
    };
    for (key, value) in vars {
        let (key, value) = (key.into(), value.into());
        guard
            .previous
            .entry(key.clone())
            .or_insert_with(|| stdenv::var(&key).ok());
        set_var(&key, &value);
        tracing::debug!(key = %key, "exported");
        guard.applied.insert(key, value);
    }
    guard
}

/// Undoes an [`export`] on drop.
#[must_use = "the variables are restored as soon as the guard is dropped; call keep() to make them permanent"]
#[derive(Debug)]
pub struct ExportGuard {
    previous: HashMap<String, Option<String>>,
    applied: HashMap<String, String>,
}

impl ExportGuard {
    /// Names of the variables this guard set.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.applied.keys().map(String::as_str)
    }

    /// Make the change permanent.
    pub fn keep(mut self) {
        self.applied.clear();
    }
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        for (key, value) in self.applied.drain() {
            if stdenv::var(&key).ok().as_deref() != Some(value.as_str()) {
                continue;
            }
            match self.previous.remove(&key).flatten() {
                Some(previous) => set_var(&key, &previous),
                None => remove_var(&key),
            }
        }
    }
}

fn set_var(key: &str, value: &str) {
    // SAFETY: descriptors and these helpers are used from a single
    // controlling thread; other threads must not read or write the
    // environment concurrently.
    unsafe { stdenv::set_var(key, value) }
}

fn remove_var(key: &str) {
    // SAFETY: see `set_var`.
    unsafe { stdenv::remove_var(key) }
}

/// Options for [`source`].
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Also source same-named files in every parent directory, outermost first.
    pub recursive: bool,
    /// Skip scripts that fail instead of reporting the failure.
    pub quiet: bool,
    /// Shell used to run the scripts; it must understand `declare -x`.
    pub shell: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            quiet: true,
            shell: "bash".to_string(),
        }
    }
}

/// Source shell scripts named `filename` and export the variables they
/// define or change.
pub fn source(filename: &str, options: &SourceOptions) -> Result<ExportGuard> {
    let cwd = stdenv::current_dir()?.canonicalize()?;
    let mut scripts = Vec::new();
    let dirs: Vec<&Path> = if options.recursive {
        cwd.ancestors().collect()
    } else {
        vec![cwd.as_path()]
    };
    for dir in dirs {
        let candidate = dir.join(filename);
        if candidate.is_file() {
            scripts.push(candidate.canonicalize()?);
        }
    }

    let current = Environment::capture();
    let mut changed = HashMap::new();
    for script in scripts.iter().rev() {
        let script_text = format!("source {} && declare -x\n", shell_quote(&script.display().to_string()));
        let result = script_text | Command::new(&options.shell).quiet();
        if !result.success()? {
            if options.quiet {
                tracing::warn!(script = %script.display(), "sourcing failed, skipping");
                continue;
            }
            result.raise_for_returncode()?;
        }
        for line in result.lines() {
            let line = line?.to_string_lossy().trim().to_string();
            let Some((key, value)) = parse_declare(&line) else {
                continue;
            };
            if current.get_var(&key) != Some(value.as_str()) {
                changed.insert(key, value);
            }
        }
    }
    Ok(export(changed))
}

fn parse_declare(line: &str) -> Option<(String, String)> {
    let caps = DECLARE_LINE.as_ref()?.captures(line)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}
