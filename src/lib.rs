// src/lib.rs

//! Pyodide package recipe orchestrator
//!
//! Builds WebAssembly Python packages from declarative recipes and
//! assembles a distribution with a `pyodide-lock.json` lockfile.
//!
//! # Architecture
//!
//! - Recipes: one `recipe.toml` per package, loaded and resolved into a
//!   dependency graph by [`recipe`]
//! - Kitchen: [`recipe::RecipeBuilder`] fetches, patches and compiles a
//!   single package, delegating wheel builds to a [`backend::BuildBackend`]
//! - Scheduler: [`scheduler`] builds a graph in parallel, honoring host
//!   dependencies
//! - Lockfile: [`lockfile`] describes the installed artifacts

pub mod backend;
pub mod config;
mod error;
pub mod hash;
pub mod lockfile;
pub mod progress;
pub mod recipe;
pub mod scheduler;
pub mod wheel;

pub use config::{BuildArgs, BuildEnv};
pub use error::{Error, Result};
pub use lockfile::{Lockfile, LockfileInfo, LockfilePackage};
pub use recipe::{DependencyGraph, PackageNode, Recipe, RecipeBuilder};
pub use scheduler::{BuildReport, BuildStatus, SchedulerOptions};
