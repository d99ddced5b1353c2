// src/cli.rs
//! CLI definitions for pyodide-recipes
//!
//! This module contains the command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pyodide-recipes")]
#[command(version)]
#[command(about = "Build WebAssembly Python packages from recipes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Compiler flags and install locations; empty values fall back to the
/// build environment
#[derive(Args, Debug, Clone, Default)]
pub struct BuildFlags {
    /// Extra compiling flags. Default: SIDE_MODULE_CFLAGS
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub cflags: String,

    /// Extra compiling flags. Default: SIDE_MODULE_CXXFLAGS
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub cxxflags: String,

    /// Extra linking flags. Default: SIDE_MODULE_LDFLAGS
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub ldflags: String,

    /// The path to the target Python installation. Default: TARGETINSTALLDIR
    #[arg(long, default_value = "")]
    pub target_install_dir: String,

    /// Directory for installing built host packages. Default: HOSTINSTALLDIR
    #[arg(long, default_value = "")]
    pub host_install_dir: String,
}

/// Recipe and build directory locations
#[derive(Args, Debug, Clone, Default)]
pub struct RecipePaths {
    /// The directory containing the recipes. Default: <root>/packages
    #[arg(long)]
    pub recipe_dir: Option<String>,

    /// The directory where package build directories are created. Default: recipe dir
    #[arg(long, env = "PYODIDE_RECIPE_BUILD_DIR")]
    pub build_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build packages and their dependencies
    BuildRecipes {
        /// Packages to build, or `*` for all packages in the recipe directory
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        paths: RecipePaths,

        #[command(flatten)]
        flags: BuildFlags,

        /// Install the built packages into the install directory
        #[arg(long)]
        install: bool,

        /// Where to install packages and pyodide-lock.json. Default: <root>/dist
        #[arg(long)]
        install_dir: Option<String>,

        /// Extract each wheel's METADATA to a matching `*.whl.metadata` file
        #[arg(long)]
        metadata_files: bool,

        /// Directory to place log files
        #[arg(long)]
        log_dir: Option<String>,

        /// Rebuild all packages regardless of whether they appear to have been updated
        #[arg(long)]
        force_rebuild: bool,

        /// Number of packages to build in parallel. Default: number of cores
        #[arg(long)]
        n_jobs: Option<usize>,

        /// Zip compression level applied when installing. 0 means no compression
        #[arg(long, default_value = "6", env = "PYODIDE_ZIP_COMPRESSION_LEVEL")]
        compression_level: i64,

        /// Don't set up the Rust toolchain before building Rust packages
        #[arg(long)]
        skip_rust_setup: bool,
    },

    /// Build packages without resolving dependencies
    BuildRecipesNoDeps {
        /// Packages to build
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        paths: RecipePaths,

        #[command(flatten)]
        flags: BuildFlags,

        /// Rebuild even when nothing changed since the last build
        #[arg(long)]
        force_rebuild: bool,

        /// Continue a build from the middle. For debugging. Implies --force-rebuild
        #[arg(long = "continue")]
        continue_build: bool,

        /// Don't set up the Rust toolchain before building Rust packages
        #[arg(long)]
        skip_rust_setup: bool,
    },

    /// Show the resolved dependency graph
    Graph {
        /// Packages to resolve
        #[arg(required = true)]
        packages: Vec<String>,

        /// The directory containing the recipes. Default: <root>/packages
        #[arg(long)]
        recipe_dir: Option<String>,
    },

    /// Remove build artifacts for recipe packages
    CleanRecipes {
        /// Packages or tags (tag:<name>) to clean. Defaults to all packages
        targets: Vec<String>,

        #[command(flatten)]
        paths: RecipePaths,

        /// Also remove per-package dist directories and the install directory
        #[arg(long)]
        include_dist: bool,

        /// Where packages were installed. Default: <root>/dist
        #[arg(long)]
        install_dir: Option<String>,

        /// Also clean packages tagged `always`
        #[arg(long)]
        include_always_tag: bool,
    },

    /// List packages that install into the host environment for cross builds
    Unisolated {
        /// The directory containing the recipes. Default: <root>/packages
        #[arg(long)]
        recipe_dir: Option<String>,
    },
}
