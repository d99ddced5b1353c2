// src/recipe/graph.rs

//! Recipe dependency graph for build ordering
//!
//! Packages are connected by two kinds of edges:
//!
//! - **host** edges: the dependency must be built before the dependent.
//!   These order the build, and a cycle among them is fatal.
//! - **run** edges: needed only at runtime. They pull packages into the
//!   graph but are soft edges for ordering, so mutual runtime dependencies
//!   (e.g. `beautifulsoup4` <-> `soupsieve`) are fine.
//!
//! A package is dropped when it is disabled, or when anything it depends on
//! (directly or transitively) is disabled. Requesting such a package yields
//! an empty graph rather than an error.
//!
//! # Example
//!
//! ```ignore
//! use pyodide_recipes::recipe::graph::generate_dependency_graph;
//!
//! let graph = generate_dependency_graph(&recipe_dir, &["scipy".into()].into(), &Default::default())?;
//! for name in graph.build_order()? {
//!     println!("{}", name);
//! }
//! ```

use crate::error::{Error, Result};
use crate::recipe::format::{PackageType, Recipe, canonicalize_name};
use crate::recipe::kitchen::needs_rebuild;
use crate::recipe::loader::{NO_NUMPY_DEPENDENTS, load_all_recipes, load_recipes, resolve_name};
use crate::wheel::{Tag, find_matching_wheel, list_artifacts};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One package in the dependency graph
#[derive(Debug, Clone)]
pub struct PackageNode {
    pub name: String,
    pub version: String,
    /// Directory holding the recipe
    pub pkgdir: PathBuf,
    pub recipe: Recipe,
    /// Runtime dependencies, in declaration order
    pub run_dependencies: Vec<String>,
    /// Build-time dependencies, in declaration order
    pub host_dependencies: Vec<String>,
    /// Packages that list this one as a host dependency
    pub host_dependents: BTreeSet<String>,
    /// Packages that list this one as any kind of dependency
    pub build_dependents: BTreeSet<String>,
    pub disabled: bool,
    /// Artifact file name, recorded after a build pass
    pub file_name: Option<String>,
}

impl PackageNode {
    fn new(pkgdir: PathBuf, recipe: Recipe, all: &BTreeMap<String, Recipe>) -> Result<Self> {
        let resolve = |deps: &[String]| -> Result<Vec<String>> {
            deps.iter()
                .map(|dep| {
                    resolve_name(all, dep).map(str::to_string).ok_or_else(|| {
                        Error::ResolutionError(format!(
                            "No metadata file found for the following package: {}",
                            dep
                        ))
                    })
                })
                .collect()
        };

        Ok(Self {
            name: recipe.package.name.clone(),
            version: recipe.package.version.clone(),
            run_dependencies: resolve(&recipe.requirements.run)?,
            host_dependencies: resolve(&recipe.requirements.host)?,
            host_dependents: BTreeSet::new(),
            build_dependents: BTreeSet::new(),
            disabled: recipe.package.disabled,
            file_name: None,
            pkgdir,
            recipe,
        })
    }

    pub fn package_type(&self) -> PackageType {
        self.recipe.build.package_type
    }

    pub fn is_wheel(&self) -> bool {
        self.recipe.is_wheel()
    }

    pub fn is_rust_package(&self) -> bool {
        self.recipe.is_rust_package()
    }

    /// Run and host dependencies combined
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.run_dependencies
            .iter()
            .chain(&self.host_dependencies)
            .map(String::as_str)
            .collect()
    }

    pub fn executables_required(&self) -> &[String] {
        &self.recipe.requirements.executable
    }

    pub fn install_dir(&self) -> &'static str {
        self.package_type().install_dir()
    }

    /// Whether test files are split out of the wheel at install time
    pub fn unvendor_tests(&self) -> bool {
        self.is_wheel() && self.recipe.build.unvendor_tests
    }

    /// Per-package build directory under a shared build root
    pub fn build_path(&self, build_dir: &Path) -> PathBuf {
        build_dir.join(&self.name).join("build")
    }

    pub fn log_path(&self) -> PathBuf {
        self.pkgdir.join("build.log")
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.pkgdir.join("dist")
    }

    pub fn needs_rebuild(&self, build_dir: &Path, tags: &[Tag]) -> Result<bool> {
        needs_rebuild(
            &self.pkgdir,
            &self.build_path(build_dir),
            &self.recipe.source,
            self.is_wheel(),
            Some(&self.version),
            tags,
        )
    }

    /// The finished artifact in `<pkgdir>/dist`, if this package type has one
    pub fn dist_artifact_path(&self, tags: &[Tag]) -> Result<Option<PathBuf>> {
        match self.package_type() {
            PackageType::StaticLibrary => Ok(None),
            PackageType::SharedLibrary => {
                let mut candidates = list_artifacts(&self.dist_dir(), "zip")?;
                if candidates.len() != 1 {
                    return Err(Error::WheelError(format!(
                        "Unexpected number of wheels/archives {} when building {}",
                        candidates.len(),
                        self.name
                    )));
                }
                Ok(candidates.pop())
            }
            PackageType::Package | PackageType::CpythonModule => {
                let candidates = list_artifacts(&self.dist_dir(), "whl")?;
                match find_matching_wheel(candidates, tags, Some(&self.version))? {
                    Some(wheel) => Ok(Some(wheel)),
                    None => Err(Error::WheelError(format!(
                        "Found no wheel while building {}",
                        self.name
                    ))),
                }
            }
        }
    }
}

/// The resolved set of packages to build
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    packages: BTreeMap<String, PackageNode>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PackageNode> {
        self.packages.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut PackageNode> {
        self.packages.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PackageNode> {
        self.packages.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut PackageNode> {
        self.packages.values_mut()
    }

    /// Package names with host dependencies before their dependents
    pub fn build_order(&self) -> Result<Vec<String>> {
        host_order(&self.packages)
    }

    /// Every package that transitively depends on `name` through host edges
    pub fn transitive_host_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut dependents = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        if let Some(node) = self.packages.get(name) {
            queue.extend(node.host_dependents.iter().map(String::as_str));
        }

        while let Some(dep) = queue.pop_front() {
            if dependents.insert(dep.to_string())
                && let Some(node) = self.packages.get(dep)
            {
                queue.extend(
                    node.host_dependents
                        .iter()
                        .filter(|d| !dependents.contains(*d))
                        .map(String::as_str),
                );
            }
        }

        dependents
    }
}

/// Kahn's algorithm over host edges only
///
/// Host dependencies outside `nodes` are treated as already satisfied.
fn host_order(nodes: &BTreeMap<String, PackageNode>) -> Result<Vec<String>> {
    let mut in_degrees: HashMap<&str, usize> = HashMap::new();
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, node) in nodes {
        let deps: BTreeSet<&str> = node
            .host_dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| nodes.contains_key(*d))
            .collect();
        in_degrees.insert(name, deps.len());
        for dep in deps {
            reverse.entry(dep).or_default().push(name);
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .keys()
        .map(String::as_str)
        .filter(|n| in_degrees[n] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        for dependent in reverse.get(node).into_iter().flatten() {
            if let Some(deg) = in_degrees.get_mut(dependent) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let remaining: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|k| !order.iter().any(|o| o == k))
            .collect();
        return Err(Error::ResolutionError(format!(
            "Circular host dependency detected. Remaining packages: {}",
            remaining.join(", ")
        )));
    }

    Ok(order)
}

/// Split a package query such as `"a,b,!c"` into requested and disabled names
///
/// Each item may itself be a comma separated list. Empty entries are ignored.
pub fn parse_package_query<S: AsRef<str>>(query: &[S]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut requested = BTreeSet::new();
    let mut disabled = BTreeSet::new();

    for item in query {
        for name in item.as_ref().split(',').map(str::trim) {
            if name.is_empty() {
                continue;
            }
            match name.strip_prefix('!') {
                Some(rest) => {
                    disabled.insert(rest.to_string());
                }
                None => {
                    requested.insert(name.to_string());
                }
            }
        }
    }

    (requested, disabled)
}

/// Expand a package query into the names to request and the names to disable
///
/// Selectors such as `*` and `tag:core` are resolved against the recipes in
/// `recipe_dir`. A `no-numpy-dependents` selector is passed through so that
/// [`generate_dependency_graph`] can apply it.
pub fn resolve_package_query<S: AsRef<str>>(
    recipe_dir: &Path,
    query: &[S],
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let (requested, disabled) = parse_package_query(query);
    let requested: Vec<String> = requested.into_iter().collect();
    let selection = load_recipes(recipe_dir, &requested, false)?;

    let mut names: BTreeSet<String> = selection.names().map(str::to_string).collect();
    if selection.no_numpy_dependents {
        names.insert(NO_NUMPY_DEPENDENTS.to_string());
    }
    Ok((names, disabled))
}

/// Build the dependency graph for a package query
pub fn graph_for_query<S: AsRef<str>>(recipe_dir: &Path, query: &[S]) -> Result<DependencyGraph> {
    let (requested, disabled) = resolve_package_query(recipe_dir, query)?;
    generate_dependency_graph(recipe_dir, &requested, &disabled)
}

/// Join names for log messages: `a`, `a and b`, `a, b, and c`
pub fn format_name_list<S: AsRef<str>>(names: &[S]) -> String {
    match names {
        [] => String::new(),
        [only] => only.as_ref().to_string(),
        [first, second] => format!("{} and {}", first.as_ref(), second.as_ref()),
        [most @ .., last] => {
            let head: Vec<String> = most.iter().map(|n| format!("{},", n.as_ref())).collect();
            format!("{} and {}", head.join(" "), last.as_ref())
        }
    }
}

/// Names of `executables` not found on `PATH`
pub fn find_missing_executables(executables: &[String]) -> Vec<String> {
    executables
        .iter()
        .filter(|exe| which::which(exe.as_str()).is_err())
        .cloned()
        .collect()
}

fn validate_graph(packages: &BTreeMap<String, PackageNode>) -> Result<()> {
    for (name, node) in packages {
        for dep in &node.run_dependencies {
            if packages
                .get(dep)
                .is_some_and(|d| d.package_type() == PackageType::StaticLibrary)
            {
                return Err(Error::ConfigError(format!(
                    "{} has an invalid dependency: {}. Static libraries must be a host dependency.",
                    name, dep
                )));
            }
        }
    }

    let mut missing: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, node) in packages {
        for exe in find_missing_executables(node.executables_required()) {
            missing.entry(exe).or_default().push(name);
        }
    }

    if !missing.is_empty() {
        let mut msg = String::from("The following executables are missing in the host system:\n");
        for (exe, pkgs) in &missing {
            msg.push_str(&format!("- {} (required by: {})\n", exe, pkgs.join(", ")));
        }
        return Err(Error::ConfigError(msg));
    }

    Ok(())
}

/// Build the dependency graph for `requested` packages in `recipe_dir`
///
/// `requested` may contain `no-numpy-dependents`, which disables every
/// package depending directly on numpy. Names in `disabled` are excluded
/// together with everything that depends on them.
pub fn generate_dependency_graph(
    recipe_dir: &Path,
    requested: &BTreeSet<String>,
    disabled: &BTreeSet<String>,
) -> Result<DependencyGraph> {
    let all = load_all_recipes(recipe_dir)?;
    let no_numpy_dependents = requested.contains(NO_NUMPY_DEPENDENTS);

    let mut roots = Vec::new();
    for name in requested.iter().filter(|n| n.as_str() != NO_NUMPY_DEPENDENTS) {
        let resolved = resolve_name(&all, name).ok_or_else(|| {
            Error::ResolutionError(format!(
                "No metadata file found for the following package: {}",
                name
            ))
        })?;
        roots.push(resolved.to_string());
    }

    // Closure over every dependency, disabled or not
    let mut packages: BTreeMap<String, PackageNode> = BTreeMap::new();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
        if packages.contains_key(&name) {
            continue;
        }
        let recipe = all[&name].clone();
        let node = PackageNode::new(recipe_dir.join(&name), recipe, &all)?;
        queue.extend(
            node.dependencies()
                .into_iter()
                .filter(|d| !packages.contains_key(*d))
                .map(str::to_string),
        );
        packages.insert(name, node);
    }

    host_order(&packages)?;

    let disabled_canonical: BTreeSet<String> =
        disabled.iter().map(|n| canonicalize_name(n)).collect();
    for node in packages.values_mut() {
        if disabled.contains(&node.name) || disabled_canonical.contains(&canonicalize_name(&node.name)) {
            node.disabled = true;
        }
        if no_numpy_dependents && node.dependencies().contains("numpy") {
            node.disabled = true;
        }
    }

    // Propagate to a fixpoint; run cycles rule out a single ordered pass
    loop {
        let newly_disabled: Vec<String> = packages
            .values()
            .filter(|n| !n.disabled)
            .filter(|n| n.dependencies().iter().any(|d| packages[*d].disabled))
            .map(|n| n.name.clone())
            .collect();
        if newly_disabled.is_empty() {
            break;
        }
        for name in newly_disabled {
            if let Some(node) = packages.get_mut(&name) {
                node.disabled = true;
            }
        }
    }

    // Keep what the enabled roots reach
    let mut included: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = roots
        .into_iter()
        .filter(|r| !packages[r].disabled)
        .collect();
    while let Some(name) = queue.pop_front() {
        if !included.insert(name.clone()) {
            continue;
        }
        queue.extend(
            packages[&name]
                .dependencies()
                .into_iter()
                .filter(|d| !included.contains(*d))
                .map(str::to_string),
        );
    }

    let disabled_packages: Vec<String> = packages
        .values()
        .filter(|n| n.disabled)
        .map(|n| n.name.clone())
        .collect();

    packages.retain(|name, _| included.contains(name));

    let edges: Vec<(String, Vec<String>, Vec<String>)> = packages
        .values()
        .map(|n| {
            (
                n.name.clone(),
                n.host_dependencies.clone(),
                n.dependencies().into_iter().map(str::to_string).collect(),
            )
        })
        .collect();
    for (name, host, all_deps) in edges {
        for dep in host {
            if let Some(node) = packages.get_mut(&dep) {
                node.host_dependents.insert(name.clone());
            }
        }
        for dep in all_deps {
            if let Some(node) = packages.get_mut(&dep) {
                node.build_dependents.insert(name.clone());
            }
        }
    }

    validate_graph(&packages)?;

    if !disabled_packages.is_empty() {
        warn!(
            "The following packages are disabled: {}",
            disabled_packages.join(", ")
        );
    }
    debug!("Dependency graph contains {} packages", packages.len());

    Ok(DependencyGraph { packages })
}
