// src/recipe/kitchen/shell.rs

//! Shell script execution with a shared environment
//!
//! Recipe scripts (`script`, `post`, `cross-script`) are opaque bash text.
//! Each one runs in a fresh `bash -c`, but variables it exports are carried
//! into the next script: on exit the shell dumps `env -0` to a scratch file
//! which is read back into [`ShellRunner::env`].

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Variable naming the env dump file inside the child shell
const ENV_DUMP_VAR: &str = "__RECIPE_ENV_DUMP";

/// Shell bookkeeping variables that must not leak between runs
const SHELL_INTERNAL_VARS: &[&str] = &["_", "SHLVL", "PWD", "OLDPWD", ENV_DUMP_VAR];

/// Per-package build log
///
/// Lines are written to `<pkg_root>/build.log` and mirrored to tracing.
pub struct BuildLog {
    path: Option<PathBuf>,
    file: Option<File>,
    echo: bool,
}

impl BuildLog {
    /// Create (or truncate) a log file
    pub fn create(path: &Path, echo: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(format!("Failed to open log file {}", path.display()), e))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(file),
            echo,
        })
    }

    /// A log that only mirrors to tracing
    pub fn stream_only(echo: bool) -> Self {
        Self {
            path: None,
            file: None,
            echo,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write one line to the file only
    pub fn write_file(&mut self, line: &str) {
        if let Some(file) = &mut self.file
            && let Err(e) = writeln!(file, "{}", line)
        {
            warn!("Failed to write build log: {}", e);
            self.file = None;
        }
    }

    /// Write one line
    pub fn line(&mut self, line: &str) {
        self.write_file(line);
        if self.echo {
            info!("{}", line);
        } else {
            debug!("{}", line);
        }
    }

    /// Write captured process output line by line
    pub fn output(&mut self, text: &str) {
        for line in text.lines() {
            self.line(line);
        }
    }

    /// Log build step output (stdout/stderr) with a phase header
    pub fn step_output(&mut self, phase: &str, stdout: &str, stderr: &str) {
        self.line(&format!("=== {} ===", phase));
        self.output(stdout);
        self.output(stderr);
    }
}

/// Captured result of one script run
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs bash scripts that share exported variables
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Environment passed to the next script, updated after each run
    pub env: BTreeMap<String, String>,
}

impl ShellRunner {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self { env }
    }

    /// Run a script and return its output regardless of exit status
    pub fn run_unchecked(&mut self, script: &str, cwd: &Path) -> Result<ScriptOutput> {
        let dump = tempfile::NamedTempFile::new()
            .map_err(|e| Error::io("Failed to create environment dump file", e))?;

        let wrapped = format!("trap 'env -0 > \"${}\"' EXIT\n{}", ENV_DUMP_VAR, script);
        let output = Command::new("bash")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(cwd)
            .env_clear()
            .envs(&self.env)
            .env(ENV_DUMP_VAR, dump.path())
            .output()
            .map_err(|e| Error::io("Failed to run bash", e))?;

        let dumped = fs::read(dump.path())?;
        if !dumped.is_empty() {
            self.env = parse_env_dump(&dumped);
        }

        Ok(ScriptOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run an optional named script, failing on a non-zero exit
    ///
    /// A missing script is a no-op. Output goes to `log`.
    pub fn run(
        &mut self,
        script: Option<&str>,
        script_name: &str,
        cwd: &Path,
        log: &mut BuildLog,
    ) -> Result<()> {
        let Some(script) = script else {
            return Ok(());
        };

        log.line(&format!("Running {} in {}", script_name, cwd.display()));
        let result = self.run_unchecked(script, cwd)?;
        log.output(&result.stdout);
        log.output(&result.stderr);

        if !result.success() {
            log.line(&format!("ERROR: {} failed", script_name));
            return Err(Error::CommandFailed {
                phase: script_name.to_string(),
                code: result.code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(())
    }
}

fn parse_env_dump(data: &[u8]) -> BTreeMap<String, String> {
    data.split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .filter(|(key, _)| !SHELL_INTERNAL_VARS.contains(&key.as_str()))
        .collect()
}
