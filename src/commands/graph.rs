// src/commands/graph.rs

//! Read-only recipe queries

use super::Workspace;
use anyhow::Result;
use pyodide_recipes::recipe::{format_name_list, graph_for_query, unisolated_packages};

/// Print the resolved dependency graph in build order
pub fn cmd_graph(packages: &[String], recipe_dir: Option<&str>) -> Result<()> {
    let workspace = Workspace::resolve(recipe_dir, None)?;
    let graph = graph_for_query(&workspace.recipe_dir, packages)?;

    if graph.is_empty() {
        println!("No packages to build");
        return Ok(());
    }

    println!("{} package(s) in build order:", graph.len());
    for name in graph.build_order()? {
        let Some(node) = graph.get(&name) else {
            continue;
        };
        println!("  {} {} ({})", node.name, node.version, node.package_type());
        if !node.host_dependencies.is_empty() {
            println!("    host: {}", format_name_list(&node.host_dependencies));
        }
        if !node.run_dependencies.is_empty() {
            println!("    run: {}", format_name_list(&node.run_dependencies));
        }
        if !node.host_dependents.is_empty() {
            let dependents: Vec<&String> = node.host_dependents.iter().collect();
            println!("    needed by: {}", format_name_list(&dependents));
        }
    }
    Ok(())
}

/// Print the packages that install into the host environment
pub fn cmd_unisolated(recipe_dir: Option<&str>) -> Result<()> {
    let workspace = Workspace::resolve(recipe_dir, None)?;
    for name in unisolated_packages(&workspace.recipe_dir)? {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_graph_accepts_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("corepkg");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(
            pkg.join("recipe.toml"),
            "[package]\nname = \"corepkg\"\nversion = \"1.0\"\ntag = [\"core\"]\n\
             [source]\npath = \"src\"\n",
        )
        .unwrap();
        let recipe_dir = dir.path().to_str().unwrap();

        cmd_graph(&["tag:core".to_string()], Some(recipe_dir)).unwrap();
        cmd_graph(&["*".to_string()], Some(recipe_dir)).unwrap();
        assert!(cmd_graph(&["tag:missing".to_string()], Some(recipe_dir)).is_err());
    }
}
