// src/wheel/unvendor.rs

//! Moving test suites out of wheels into a separate `{name}-tests.tar`

use super::{WheelName, modify_wheel};
use crate::error::{Error, Result};
use glob::Pattern;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

const TEST_FILE_PATTERNS: &[&str] = &["test_*.py", "*_test.py", "conftest.py"];

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| Error::ConfigError(format!("Invalid retain pattern {:?}: {}", p, e)))
        })
        .collect()
}

fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
        .map_err(|e| Error::io(format!("Failed to move {} to {}", from.display(), to.display()), e))
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn walk(
    install_prefix: &Path,
    test_prefix: &Path,
    rel: &Path,
    test_patterns: &[Pattern],
    retain: &[Pattern],
) -> Result<usize> {
    let dir_name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let dir = install_prefix.join(rel);

    if dir_name == "test" || dir_name == "tests" {
        move_path(&dir, &test_prefix.join(rel))?;
        return Ok(1);
    }

    let mut moved = 0;
    let skip_files = dir_name == "__pycache__" || dir_name.ends_with(".egg_info");
    let mut subdirs = Vec::new();

    for entry in sorted_entries(&dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            subdirs.push(name);
            continue;
        }
        if skip_files || !test_patterns.iter().any(|p| p.matches(&name)) {
            continue;
        }
        if retain.iter().any(|p| p.matches(&name)) {
            continue;
        }
        move_path(&dir.join(&name), &test_prefix.join(rel).join(&name))?;
        moved += 1;
    }

    for sub in subdirs {
        moved += walk(install_prefix, test_prefix, &rel.join(sub), test_patterns, retain)?;
    }
    Ok(moved)
}

/// Move test directories and test modules from `install_prefix` to `test_prefix`
///
/// Directories named `test` or `tests` are moved whole. Files matching
/// `test_*.py`, `*_test.py` or `conftest.py` are moved unless they match a
/// `retain` pattern. Returns the number of moved files and directories.
pub fn unvendor_tests(install_prefix: &Path, test_prefix: &Path, retain: &[String]) -> Result<usize> {
    if test_prefix.exists() {
        fs::remove_dir_all(test_prefix)?;
    }
    let test_patterns = compile_patterns(
        &TEST_FILE_PATTERNS.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )?;
    let retain = compile_patterns(retain)?;
    walk(install_prefix, test_prefix, Path::new(""), &test_patterns, &retain)
}

/// Strip tests out of `wheel` into `{name}-tests.tar` next to it
///
/// Returns the archive path, or `None` when the wheel contained no tests.
pub fn unvendor_tests_in_wheel(wheel: &Path, retain: &[String]) -> Result<Option<PathBuf>> {
    let name = WheelName::from_path(wheel)?.name;
    let destination = wheel
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}-tests.tar", name));

    let scratch = tempfile::tempdir()?;
    let test_dir = scratch.path().join("tests");
    let mut moved = 0;

    modify_wheel(wheel, |extracted| {
        moved = unvendor_tests(extracted, &test_dir, retain)?;
        if moved == 0 {
            return Ok(());
        }
        let mut builder = tar::Builder::new(File::create(&destination)?);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.append_dir_all(".", &test_dir)?;
        builder.finish()?;
        Ok(())
    })?;

    if moved == 0 {
        return Ok(None);
    }
    debug!("Moved {} test paths into {}", moved, destination.display());
    Ok(Some(destination))
}
