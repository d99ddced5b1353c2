// src/recipe/loader.rs

//! Loading recipe directories and resolving package selectors
//!
//! A recipe directory holds one subdirectory per package, each containing a
//! `recipe.toml`. Selectors accepted by [`load_recipes`]:
//!
//! - a package name (exact or canonical match), loaded even if disabled
//! - `tag:<name>`: every non-disabled recipe carrying that tag
//! - `*`: every non-disabled recipe
//! - `no-numpy-dependents`: passed through to the graph builder

use crate::error::{Error, Result};
use crate::recipe::format::{ALWAYS_TAG, RECIPE_FILE_NAME, Recipe, canonicalize_name};
use crate::recipe::parser::{parse_recipe_file, validate_recipe};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Selector that disables every package depending on numpy
pub const NO_NUMPY_DEPENDENTS: &str = "no-numpy-dependents";

const TAG_PREFIX: &str = "tag:";

/// Recipes chosen by a set of selectors
#[derive(Debug, Clone, Default)]
pub struct RecipeSelection {
    /// Selected recipes keyed by declared package name
    pub recipes: BTreeMap<String, Recipe>,
    /// `no-numpy-dependents` was among the selectors
    pub no_numpy_dependents: bool,
}

impl RecipeSelection {
    pub fn contains(&self, name: &str) -> bool {
        self.recipes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

/// Load every recipe in `recipe_dir`, disabled ones included
///
/// Hidden directories and directories without a `recipe.toml` are skipped.
/// Any unparsable or invalid descriptor aborts the whole load.
pub fn load_all_recipes(recipe_dir: &Path) -> Result<BTreeMap<String, Recipe>> {
    if !recipe_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Recipe directory {} not found",
            recipe_dir.display()
        )));
    }

    let mut entries: Vec<_> = fs::read_dir(recipe_dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut recipes = BTreeMap::new();
    for entry in entries {
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if dir_name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        let recipe_file = entry.path().join(RECIPE_FILE_NAME);
        if !recipe_file.is_file() {
            debug!("Skipping {}: no {}", entry.path().display(), RECIPE_FILE_NAME);
            continue;
        }

        let recipe = parse_recipe_file(&recipe_file)?;
        for warning in validate_recipe(&recipe)? {
            debug!("{}", warning);
        }

        if recipe.package.name != dir_name {
            return Err(Error::ConfigError(format!(
                "Package name {} in {} does not match its directory name {}",
                recipe.package.name,
                recipe_file.display(),
                dir_name
            )));
        }
        recipes.insert(recipe.package.name.clone(), recipe);
    }

    Ok(recipes)
}

/// Find the declared name a (possibly non-canonical) name refers to
pub fn resolve_name<'a, V>(recipes: &'a BTreeMap<String, V>, name: &str) -> Option<&'a str> {
    if let Some((key, _)) = recipes.get_key_value(name) {
        return Some(key.as_str());
    }
    let canonical = canonicalize_name(name);
    recipes
        .keys()
        .find(|k| canonicalize_name(k) == canonical)
        .map(String::as_str)
}

/// Load the recipes matching `selectors`
///
/// When `load_always_tag` is set, recipes tagged `always` are added too.
/// An unknown name or tag is an error.
pub fn load_recipes(
    recipe_dir: &Path,
    selectors: &[String],
    load_always_tag: bool,
) -> Result<RecipeSelection> {
    let all = load_all_recipes(recipe_dir)?;
    select_recipes(&all, selectors, load_always_tag)
}

/// Apply selectors to an already loaded recipe set
pub fn select_recipes(
    all: &BTreeMap<String, Recipe>,
    selectors: &[String],
    load_always_tag: bool,
) -> Result<RecipeSelection> {
    let mut selection = RecipeSelection::default();
    let add = |selection: &mut RecipeSelection, name: &str, recipe: &Recipe| {
        selection
            .recipes
            .entry(name.to_string())
            .or_insert_with(|| recipe.clone());
    };

    for selector in selectors {
        let selector = selector.trim();
        if selector.is_empty() {
            continue;
        }

        if selector == NO_NUMPY_DEPENDENTS {
            selection.no_numpy_dependents = true;
            continue;
        }

        if selector == "*" {
            for (name, recipe) in all.iter().filter(|(_, r)| !r.package.disabled) {
                add(&mut selection, name, recipe);
            }
            continue;
        }

        if let Some(tag) = selector.strip_prefix(TAG_PREFIX) {
            let tagged: Vec<_> = all.iter().filter(|(_, r)| r.has_tag(tag)).collect();
            if tagged.is_empty() {
                return Err(Error::ConfigError(format!(
                    "Unknown package name or tag: {}",
                    selector
                )));
            }
            for (name, recipe) in tagged {
                if recipe.package.disabled {
                    warn!("{} is tagged {} but disabled, skipping", name, tag);
                    continue;
                }
                add(&mut selection, name, recipe);
            }
            continue;
        }

        match resolve_name(all, selector) {
            Some(name) => add(&mut selection, name, &all[name]),
            None => {
                return Err(Error::ConfigError(format!(
                    "Unknown package name or tag: {}",
                    selector
                )));
            }
        }
    }

    if load_always_tag {
        for (name, recipe) in all
            .iter()
            .filter(|(_, r)| r.has_tag(ALWAYS_TAG) && !r.package.disabled)
        {
            add(&mut selection, name, recipe);
        }
    }

    Ok(selection)
}

/// Recipes that install into the host environment for later cross builds
pub fn unisolated_packages(recipe_dir: &Path) -> Result<Vec<String>> {
    Ok(load_all_recipes(recipe_dir)?
        .into_iter()
        .filter(|(_, r)| r.build.cross_build_env)
        .map(|(name, _)| name)
        .collect())
}
