// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use commands::BuildRecipesOptions;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::BuildRecipes {
            packages,
            paths,
            flags,
            install,
            install_dir,
            metadata_files,
            log_dir,
            force_rebuild,
            n_jobs,
            compression_level,
            skip_rust_setup,
        } => {
            let options = BuildRecipesOptions {
                install,
                install_dir,
                metadata_files,
                log_dir,
                force_rebuild,
                n_jobs,
                compression_level,
                skip_rust_setup,
            };
            commands::cmd_build_recipes(
                &packages,
                paths.recipe_dir.as_deref(),
                paths.build_dir.as_deref(),
                &flags,
                &options,
            )
        }
        Commands::BuildRecipesNoDeps {
            packages,
            paths,
            flags,
            force_rebuild,
            continue_build,
            skip_rust_setup,
        } => commands::cmd_build_recipes_no_deps(
            &packages,
            paths.recipe_dir.as_deref(),
            paths.build_dir.as_deref(),
            &flags,
            force_rebuild,
            continue_build,
            skip_rust_setup,
        ),
        Commands::Graph {
            packages,
            recipe_dir,
        } => commands::cmd_graph(&packages, recipe_dir.as_deref()),
        Commands::CleanRecipes {
            targets,
            paths,
            include_dist,
            install_dir,
            include_always_tag,
        } => commands::cmd_clean_recipes(
            &targets,
            paths.recipe_dir.as_deref(),
            paths.build_dir.as_deref(),
            install_dir.as_deref(),
            include_dist,
            include_always_tag,
        ),
        Commands::Unisolated { recipe_dir } => commands::cmd_unisolated(recipe_dir.as_deref()),
    }
}
