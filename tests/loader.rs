// tests/loader.rs

//! Recipe discovery and selection over the recipe fixtures.

mod common;

use common::{copy_fixtures, fixture_recipes, names};
use pyodide_recipes::recipe::{load_all_recipes, load_recipes, unisolated_packages};
use std::collections::BTreeSet;
use std::fs;

fn selected(selectors: &[&str], load_always_tag: bool) -> BTreeSet<String> {
    let selectors: Vec<String> = selectors.iter().map(|s| s.to_string()).collect();
    load_recipes(&fixture_recipes(), &selectors, load_always_tag)
        .unwrap()
        .names()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_load_all_recipes() {
    let all = load_all_recipes(&fixture_recipes()).unwrap();
    assert_eq!(all.len(), 23);
    assert_eq!(all["scipy"].package.version, "1.12.0");
    assert!(all["pkg_test_disabled"].package.disabled);
}

#[test]
fn test_select_everything() {
    let all = selected(&["*"], false);
    assert_eq!(all.len(), 22);
    assert!(!all.contains("pkg_test_disabled"));
    assert!(all.contains("pkg_test_tag_always"));
}

#[test]
fn test_select_by_tag() {
    assert_eq!(selected(&["tag:core"], false), names(["pkg_test_tag"]));
    assert_eq!(
        selected(&["tag:core"], true),
        names(["pkg_test_tag", "pkg_test_tag_always"])
    );
    assert_eq!(
        selected(&["numpy", "tag:core"], false),
        names(["numpy", "pkg_test_tag"])
    );
}

#[test]
fn test_unknown_selector() {
    let err = load_recipes(&fixture_recipes(), &["tag:nothing".to_string()], false).unwrap_err();
    assert!(err.to_string().contains("tag:nothing"));
}

#[test]
fn test_unisolated_packages() {
    assert_eq!(unisolated_packages(&fixture_recipes()).unwrap(), vec!["numpy"]);
}

#[test]
fn test_skips_directories_without_recipe() {
    let (_temp, recipe_dir) = copy_fixtures();
    fs::create_dir_all(recipe_dir.join("not_a_package")).unwrap();
    fs::create_dir_all(recipe_dir.join(".hidden")).unwrap();
    fs::write(recipe_dir.join(".hidden/recipe.toml"), "not toml [").unwrap();

    assert_eq!(load_all_recipes(&recipe_dir).unwrap().len(), 23);
}

#[test]
fn test_invalid_recipe_aborts_load() {
    let (_temp, recipe_dir) = copy_fixtures();
    fs::write(
        recipe_dir.join("numpy/recipe.toml"),
        "[package]\nname = \"numpy\"\nversion = \"1.0\"\n",
    )
    .unwrap();

    assert!(load_all_recipes(&recipe_dir).is_err());
}
