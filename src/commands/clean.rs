// src/commands/clean.rs

//! Clean command - remove recipe build artifacts

use super::Workspace;
use anyhow::Result;
use pyodide_recipes::recipe::perform_recipe_cleanup;
use tracing::info;

pub fn cmd_clean_recipes(
    targets: &[String],
    recipe_dir: Option<&str>,
    build_dir: Option<&str>,
    install_dir: Option<&str>,
    include_dist: bool,
    include_always_tag: bool,
) -> Result<()> {
    let workspace = Workspace::resolve(recipe_dir, build_dir)?;
    info!("Cleaning recipes in {}", workspace.recipe_dir.display());

    let install_dir = if include_dist {
        Some(workspace.install_dir(install_dir)?)
    } else {
        None
    };
    let targets = (!targets.is_empty()).then_some(targets);

    let removed = perform_recipe_cleanup(
        &workspace.recipe_dir,
        Some(&workspace.build_dir),
        install_dir.as_deref(),
        targets,
        include_dist,
        include_always_tag,
    )?;
    println!("Removed {} item(s)", removed);
    Ok(())
}
