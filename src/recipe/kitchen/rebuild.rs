// src/recipe/kitchen/rebuild.rs

//! Incremental rebuild decisions
//!
//! There is no build database: whether a package is up to date is derived
//! from file modification times alone. The baseline is the previously
//! produced wheel (for wheel packages) or the `.packaged` sentinel in the
//! build directory (for libraries). Any input strictly newer than the
//! baseline forces a rebuild; equal timestamps do not.

use crate::error::{Error, Result};
use crate::recipe::format::{RECIPE_FILE_NAME, SourceSection};
use crate::wheel::{Tag, find_matching_wheel, list_artifacts};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Sentinel touched after a successful non-wheel build
pub const PACKAGED_SENTINEL: &str = ".packaged";

fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(format!("Failed to stat {}", path.display()), e))
}

/// Every input whose change invalidates a previous build
fn source_files(pkg_root: &Path, source: &SourceSection) -> Vec<PathBuf> {
    let mut files = vec![pkg_root.join(RECIPE_FILE_NAME)];
    files.extend(source.patches.iter().map(|p| pkg_root.join(p)));
    files.extend(source.extras.iter().map(|(src, _)| pkg_root.join(src)));
    if let Some(path) = &source.path {
        files.extend(
            WalkDir::new(pkg_root.join(path))
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path()),
        );
    }
    files
}

/// Whether the package rooted at `pkg_root` must be rebuilt
///
/// `build_dir` is the package's build directory, where the `.packaged`
/// sentinel lives. For wheels, `version` and `tags` select the previous
/// artifact in `<pkg_root>/dist`.
pub fn needs_rebuild(
    pkg_root: &Path,
    build_dir: &Path,
    source: &SourceSection,
    is_wheel: bool,
    version: Option<&str>,
    tags: &[Tag],
) -> Result<bool> {
    let baseline = if is_wheel {
        let candidates = list_artifacts(&pkg_root.join("dist"), "whl")?;
        match find_matching_wheel(candidates, tags, version)? {
            Some(wheel) => mtime(&wheel)?,
            None => {
                debug!("{} needs rebuild because no built wheel exists", pkg_root.display());
                return Ok(true);
            }
        }
    } else {
        let token = build_dir.join(PACKAGED_SENTINEL);
        if !token.is_file() {
            debug!(
                "{} needs rebuild because {} does not exist",
                pkg_root.display(),
                token.display()
            );
            return Ok(true);
        }
        mtime(&token)?
    };

    for file in source_files(pkg_root, source) {
        if mtime(&file)? > baseline {
            debug!("{} is newer than the last build", file.display());
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};

    fn touch_at(path: &Path, secs: i64) {
        if !path.exists() {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    struct Layout {
        _dir: tempfile::TempDir,
        root: PathBuf,
        build: PathBuf,
        source: SourceSection,
    }

    fn layout() -> Layout {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let build = root.join("build");
        fs::create_dir_all(&build).unwrap();
        for f in [RECIPE_FILE_NAME, "patch", "extra", "src/file"] {
            touch_at(&root.join(f), 1_000);
        }
        let source = SourceSection {
            path: Some(PathBuf::from("src")),
            patches: vec!["patch".to_string()],
            extras: vec![("extra".to_string(), "extra".to_string())],
            ..Default::default()
        };
        Layout {
            _dir: dir,
            root,
            build,
            source,
        }
    }

    fn check(l: &Layout) -> bool {
        needs_rebuild(&l.root, &l.build, &l.source, false, None, &[]).unwrap()
    }

    #[test]
    fn test_needs_rebuild_without_sentinel() {
        let l = layout();
        assert!(check(&l));
    }

    #[test]
    fn test_needs_rebuild_inputs() {
        let l = layout();
        let sentinel = l.build.join(PACKAGED_SENTINEL);
        touch_at(&sentinel, 2_000);
        assert!(!check(&l));

        for input in [RECIPE_FILE_NAME, "patch", "extra", "src/file"] {
            touch_at(&sentinel, 2_000);
            touch_at(&l.root.join(input), 3_000);
            assert!(check(&l), "{} should trigger a rebuild", input);

            touch_at(&sentinel, 4_000);
            assert!(!check(&l));
            touch_at(&l.root.join(input), 1_000);
        }
    }

    #[test]
    fn test_equal_mtime_does_not_rebuild() {
        let l = layout();
        touch_at(&l.build.join(PACKAGED_SENTINEL), 1_000);
        assert!(!check(&l));
    }

    #[test]
    fn test_wheel_baseline() {
        let l = layout();
        let tags = vec![Tag::new("py3", "none", "any")];
        assert!(needs_rebuild(&l.root, &l.build, &l.source, true, Some("1.0"), &tags).unwrap());

        touch_at(&l.root.join("dist/pkg-1.0-py3-none-any.whl"), 2_000);
        assert!(!needs_rebuild(&l.root, &l.build, &l.source, true, Some("1.0"), &tags).unwrap());
        // a wheel for another version is not a baseline
        assert!(needs_rebuild(&l.root, &l.build, &l.source, true, Some("2.0"), &tags).unwrap());
    }
}
