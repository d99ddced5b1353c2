// src/commands/build.rs

//! Build commands: whole dependency graphs or single packages

use super::Workspace;
use crate::cli::BuildFlags;
use anyhow::{Context, Result};
use pyodide_recipes::backend::{BuildBackend, PypaBuildBackend};
use pyodide_recipes::config::{BuildArgs, BuildEnv};
use pyodide_recipes::recipe::{KitchenConfig, RecipeBuilder, load_recipes};
use pyodide_recipes::scheduler::{
    RecipeRunner, SchedulerOptions, build_packages, copy_logs, ensure_rust_toolchain,
    install_packages,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Options of `build-recipes` beyond the shared flags
#[derive(Debug, Clone, Default)]
pub struct BuildRecipesOptions {
    pub install: bool,
    pub install_dir: Option<String>,
    pub metadata_files: bool,
    pub log_dir: Option<String>,
    pub force_rebuild: bool,
    pub n_jobs: Option<usize>,
    pub compression_level: i64,
    pub skip_rust_setup: bool,
}

fn build_args(flags: &BuildFlags, env: &BuildEnv) -> Result<BuildArgs> {
    BuildArgs {
        cflags: flags.cflags.clone(),
        cxxflags: flags.cxxflags.clone(),
        ldflags: flags.ldflags.clone(),
        target_install_dir: flags.target_install_dir.clone(),
        host_install_dir: flags.host_install_dir.clone(),
    }
    .with_defaults(env)
    .context("Failed to read default build flags")
}

/// Join package arguments into one query
///
/// A single comma separated argument is accepted for the
/// `PYODIDE_PACKAGES="a,b"` style of invocation.
fn package_query(packages: &[String]) -> Vec<String> {
    match packages {
        [single] if single.contains(',') => vec![single.replace(' ', "")],
        _ => vec![packages.join(",")],
    }
}

/// Build the requested packages and everything they depend on
pub fn cmd_build_recipes(
    packages: &[String],
    recipe_dir: Option<&str>,
    build_dir: Option<&str>,
    flags: &BuildFlags,
    options: &BuildRecipesOptions,
) -> Result<()> {
    let workspace = Workspace::resolve(recipe_dir, build_dir)?;
    let env = Arc::new(BuildEnv::load(&workspace.root).context("Failed to load build environment")?);
    let build_args = build_args(flags, &env)?;

    if options.metadata_files && !options.install {
        warn!("WARNING: when --install is not set, the --metadata-files parameter is ignored");
    }

    let backend: Arc<dyn BuildBackend> = Arc::new(PypaBuildBackend::default());
    let runner = Arc::new(RecipeRunner::new(Arc::clone(&env), backend));
    let scheduler_options = SchedulerOptions {
        n_jobs: options.n_jobs.unwrap_or_else(|| SchedulerOptions::default().n_jobs),
        force_rebuild: options.force_rebuild,
        skip_rust_setup: options.skip_rust_setup,
        show_progress: true,
    };

    let (graph, report) = build_packages(
        &workspace.recipe_dir,
        &package_query(packages),
        runner,
        &build_args,
        &workspace.build_dir,
        &env,
        &scheduler_options,
    )?;
    info!(
        "Built {} package(s), {} already up to date",
        report.completed.len(),
        report.already_built.len()
    );

    if let Some(log_dir) = &options.log_dir {
        copy_logs(&graph, &PathBuf::from(log_dir)).context("Failed to copy build logs")?;
    }

    if options.install {
        let install_dir = workspace.install_dir(options.install_dir.as_deref())?;
        let lockfile = install_packages(
            &graph,
            &install_dir,
            &env,
            options.compression_level,
            options.metadata_files,
        )?;
        println!("Installed packages to {}", install_dir.display());
        println!("Lockfile: {}", lockfile.display());
    }

    Ok(())
}

/// Build packages one by one without resolving dependencies
pub fn cmd_build_recipes_no_deps(
    packages: &[String],
    recipe_dir: Option<&str>,
    build_dir: Option<&str>,
    flags: &BuildFlags,
    force_rebuild: bool,
    continue_build: bool,
    skip_rust_setup: bool,
) -> Result<()> {
    let workspace = Workspace::resolve(recipe_dir, build_dir)?;
    let env = Arc::new(BuildEnv::load(&workspace.root).context("Failed to load build environment")?);
    let build_args = build_args(flags, &env)?;

    if !skip_rust_setup {
        let selection = load_recipes(&workspace.recipe_dir, packages, false)?;
        if selection.recipes.values().any(|r| r.is_rust_package()) {
            ensure_rust_toolchain(&env)?;
        }
    }

    let backend: Arc<dyn BuildBackend> = Arc::new(PypaBuildBackend::default());
    for package in packages {
        let config = KitchenConfig::interactive(
            Some(workspace.build_dir.join(package).join("build")),
            force_rebuild,
            continue_build,
        );
        let mut builder = RecipeBuilder::new(
            &workspace.recipe_dir.join(package),
            build_args.clone(),
            config,
            Arc::clone(&env),
            Arc::clone(&backend),
        )
        .with_context(|| format!("Failed to load recipe for {}", package))?;
        let result = builder.build()?;

        match result.artifact {
            Some(artifact) => println!("[OK] {} -> {}", package, artifact.display()),
            None if result.rebuilt => println!("[OK] {}", package),
            None => println!("[OK] {} is up to date", package),
        }
    }

    Ok(())
}
