// src/commands/mod.rs
//! Command handlers for the pyodide-recipes CLI

mod build;
mod clean;
mod graph;

pub use build::{cmd_build_recipes, cmd_build_recipes_no_deps, BuildRecipesOptions};
pub use clean::cmd_clean_recipes;
pub use graph::{cmd_graph, cmd_unisolated};

use anyhow::{Context, Result};
use pyodide_recipes::config::search_root;
use std::path::{Path, PathBuf};

/// Directories every command resolves against
pub struct Workspace {
    /// Pyodide tree root, or the current directory outside one
    pub root: PathBuf,
    pub recipe_dir: PathBuf,
    /// Parent of the per-package build directories
    pub build_dir: PathBuf,
}

impl Workspace {
    pub fn resolve(recipe_dir: Option<&str>, build_dir: Option<&str>) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let root = search_root(&cwd).unwrap_or(cwd);

        let recipe_dir = match recipe_dir {
            Some(dir) => absolute(dir)?,
            None => root.join("packages"),
        };
        if !recipe_dir.is_dir() {
            anyhow::bail!("Recipe directory {} not found", recipe_dir.display());
        }
        let build_dir = match build_dir {
            Some(dir) => absolute(dir)?,
            None => recipe_dir.clone(),
        };

        Ok(Self {
            root,
            recipe_dir,
            build_dir,
        })
    }

    /// Install directory, `<root>/dist` unless given
    pub fn install_dir(&self, install_dir: Option<&str>) -> Result<PathBuf> {
        match install_dir {
            Some(dir) => absolute(dir),
            None => Ok(self.root.join("dist")),
        }
    }
}

fn absolute(path: &str) -> Result<PathBuf> {
    std::path::absolute(Path::new(path)).with_context(|| format!("Invalid path: {}", path))
}
