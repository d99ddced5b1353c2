// src/recipe/parser.rs

//! Recipe file parsing

use crate::error::{Error, Result};
use crate::recipe::format::{RECIPE_FILE_NAME, Recipe};
use std::path::{Path, PathBuf};

/// Parse a recipe from a TOML string
pub fn parse_recipe(content: &str) -> Result<Recipe> {
    toml::from_str(content).map_err(|e| Error::ParseError(format!("Invalid recipe: {}", e)))
}

/// Parse a recipe from a file
pub fn parse_recipe_file(path: &Path) -> Result<Recipe> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::IoError(format!("Failed to read recipe file {}: {}", path.display(), e))
    })?;

    parse_recipe(&content)
        .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))
}

/// Validate a recipe for completeness and correctness
///
/// Hard errors abort loading; the returned strings are advisory warnings.
pub fn validate_recipe(recipe: &Recipe) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let name = &recipe.package.name;
    let invalid = |msg: String| Err(Error::ConfigError(format!("{}: {}", name, msg)));

    if name.is_empty() {
        return Err(Error::ConfigError("Recipe package name cannot be empty".to_string()));
    }
    if recipe.package.version.is_empty() {
        return invalid("package version cannot be empty".to_string());
    }

    let source = &recipe.source;
    match (&source.url, &source.path) {
        (Some(_), Some(_)) => {
            return invalid("source.url and source.path are mutually exclusive".to_string());
        }
        (None, None) => {
            return invalid("one of source.url or source.path must be set".to_string());
        }
        (Some(url), None) => {
            if source.sha256.is_none() && !url.ends_with(".whl") {
                return invalid("source.sha256 is required when source.url is set".to_string());
            }
            if source.sha256.is_none() {
                warnings.push(format!("{}: wheel source has no sha256", name));
            }
        }
        (None, Some(_)) => {
            if source.extract_dir.is_some() {
                return invalid("source.extract_dir cannot be used with source.path".to_string());
            }
            if !source.patches.is_empty() || !source.extras.is_empty() {
                return invalid(
                    "source.patches and source.extras cannot be used with source.path".to_string(),
                );
            }
        }
    }

    let build = &recipe.build;
    if !build.cross_build_files.is_empty() && !build.cross_build_env {
        return invalid("build.cross-build-files requires build.cross-build-env".to_string());
    }

    if !recipe.is_wheel() {
        let kind = build.package_type;
        if build.post.is_some() {
            return invalid(format!("build.post is not supported for {} recipes", kind));
        }
        if build.cross_build_env || !build.cross_build_files.is_empty() {
            return invalid(format!("cross build settings are not supported for {} recipes", kind));
        }
        if !build.backend_flags.is_empty() {
            return invalid(format!("build.backend-flags is not supported for {} recipes", kind));
        }
    } else if recipe.test.imports.is_empty() {
        warnings.push(format!("{}: no test imports declared", name));
    }

    Ok(warnings)
}

/// Resolve a recipe path (package directory or descriptor file) and parse it
///
/// Returns the package root directory along with the validated recipe.
pub fn load_recipe(path: &Path) -> Result<(PathBuf, Recipe)> {
    let (pkg_root, recipe_file) = if path.is_dir() {
        (path.to_path_buf(), path.join(RECIPE_FILE_NAME))
    } else {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (root, path.to_path_buf())
    };

    if !recipe_file.is_file() {
        return Err(Error::NotFound(format!(
            "No recipe found at {}",
            recipe_file.display()
        )));
    }

    let recipe = parse_recipe_file(&recipe_file)?;
    validate_recipe(&recipe)?;
    Ok((pkg_root, recipe))
}
