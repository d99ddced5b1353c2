// src/recipe/cleanup.rs

//! Removal of build artifacts for recipe packages

use crate::error::{Error, Result};
use crate::recipe::loader::load_recipes;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Remove build directories and logs of the selected packages
///
/// `targets` are names or `tag:` selectors; `None` selects every enabled
/// package. `include_always_tag` adds packages tagged `always`. Package build
/// directories live under `build_dir` when given, else under `recipe_dir`.
/// With `include_dist` the per-package `dist/` directories and the install
/// directory are removed too.
///
/// Returns the number of removed items.
pub fn perform_recipe_cleanup(
    recipe_dir: &Path,
    build_dir: Option<&Path>,
    install_dir: Option<&Path>,
    targets: Option<&[String]>,
    include_dist: bool,
    include_always_tag: bool,
) -> Result<usize> {
    if !recipe_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Recipe directory {} not found",
            recipe_dir.display()
        )));
    }

    let build_base = build_dir.unwrap_or(recipe_dir);
    let all = ["*".to_string()];
    let selectors = targets.unwrap_or(&all);
    let selection = load_recipes(recipe_dir, selectors, include_always_tag)?;

    let mut removed = 0;
    for name in selection.names() {
        if remove_dir(&build_base.join(name).join("build")) {
            removed += 1;
        }
        let log = recipe_dir.join(name).join("build.log");
        if log.is_file() {
            match fs::remove_file(&log) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", log.display(), e),
            }
        }
        if include_dist && remove_dir(&recipe_dir.join(name).join("dist")) {
            removed += 1;
        }
    }

    if include_dist
        && let Some(install_dir) = install_dir
        && remove_dir(install_dir)
    {
        removed += 1;
    }

    Ok(removed)
}

/// Best-effort recursive removal; true when the directory existed
fn remove_dir(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    info!("Removing {}", path.display());
    if let Err(e) = fs::remove_dir_all(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
    true
}
