// src/recipe/mod.rs

//! Recipe system for building Pyodide packages from source
//!
//! A recipe directory holds one subdirectory per package, each with a
//! `recipe.toml` describing:
//! - The source archive (or local tree) and its checksum
//! - Patches and extra files
//! - Host, run and executable requirements
//! - Build scripts and the package type
//!
//! # Example Recipe
//!
//! ```toml
//! [package]
//! name = "regex"
//! version = "2024.9.11"
//! tag = ["core"]
//!
//! [source]
//! url = "https://files.pythonhosted.org/packages/source/r/regex/regex-2024.9.11.tar.gz"
//! sha256 = "1b8b1b7a1d4b2d3b1fbd87b6f6e7f5d1a7c0b1fe8f5a5e3b7c1e6d4a6b5b2c3a"
//! patches = ["patches/0001-fix-wasm-build.patch"]
//!
//! [build]
//! cflags = "-O3"
//!
//! [requirements]
//! host = ["numpy"]
//! run = ["numpy"]
//! ```
//!
//! [`loader`] selects recipes, [`graph`] resolves them into a dependency
//! graph, and [`kitchen::RecipeBuilder`] builds one package.

pub mod cleanup;
pub mod format;
pub mod graph;
pub mod kitchen;
pub mod loader;
pub mod parser;

pub use cleanup::perform_recipe_cleanup;
pub use format::{
    ALWAYS_TAG, BuildSection, Exports, ExportsMode, PackageSection, PackageType, RECIPE_FILE_NAME,
    Recipe, RequirementsSection, SourceSection, StringOrList, TestSection, canonicalize_name,
};
pub use graph::{
    DependencyGraph, PackageNode, find_missing_executables, format_name_list,
    generate_dependency_graph, graph_for_query, parse_package_query, resolve_package_query,
};
pub use kitchen::{BuildPhase, BuildResult, BuildVariant, KitchenConfig, RecipeBuilder};
pub use loader::{
    NO_NUMPY_DEPENDENTS, RecipeSelection, load_all_recipes, load_recipes, unisolated_packages,
};
pub use parser::{load_recipe, parse_recipe, parse_recipe_file, validate_recipe};
