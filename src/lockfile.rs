// src/lockfile.rs

//! `pyodide-lock.json` generation
//!
//! The lockfile describes every artifact installed by a build pass: its file
//! name, checksum, runtime dependencies and importable modules. Keys of the
//! `packages` map are canonicalized package names, sorted.

use crate::config::BuildEnv;
use crate::error::{Error, Result};
use crate::hash::sha256_file;
use crate::recipe::format::{PackageType, canonicalize_name};
use crate::recipe::graph::DependencyGraph;
use crate::wheel::{WheelName, parse_top_level_import_name, unvendor_tests_in_wheel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Interpreter and platform the packages were built for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfileInfo {
    pub arch: String,
    pub platform: String,
    pub version: String,
    pub python: String,
    pub abi_version: String,
}

/// One installed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockfilePackage {
    pub name: String,
    pub version: String,
    pub file_name: String,
    /// `site` for wheels, `dynlib` for shared libraries
    pub install_dir: String,
    pub sha256: String,
    pub package_type: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub unvendored_tests: bool,
    #[serde(default)]
    pub shared_library: bool,
}

impl LockfilePackage {
    fn new(name: &str, version: &str, file_name: &str, install_dir: &str, package_type: PackageType) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            file_name: file_name.to_string(),
            install_dir: install_dir.to_string(),
            sha256: String::new(),
            package_type: package_type.to_string(),
            imports: Vec::new(),
            depends: Vec::new(),
            unvendored_tests: false,
            shared_library: package_type == PackageType::SharedLibrary,
        }
    }

    fn update_sha256(&mut self, path: &Path) -> Result<()> {
        self.sha256 = sha256_file(path)
            .map_err(|e| Error::io(format!("Failed to hash {}", path.display()), e))?;
        Ok(())
    }
}

/// Contents of `pyodide-lock.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub info: LockfileInfo,
    pub packages: BTreeMap<String, LockfilePackage>,
}

impl Lockfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("Failed to read {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write as pretty JSON, replacing any existing file atomically
    pub fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Check that wheel file names agree with their entries
    pub fn check_wheel_filenames(&self) -> Result<()> {
        let mut errors = Vec::new();
        for entry in self.packages.values() {
            if !entry.file_name.ends_with(".whl") {
                continue;
            }
            let wheel = WheelName::parse(&entry.file_name)?;
            if canonicalize_name(&wheel.name) != canonicalize_name(&entry.name) {
                errors.push(format!(
                    "Package name in wheel filename '{}' does not match '{}'",
                    wheel.name, entry.name
                ));
            }
            if wheel.version != entry.version {
                errors.push(format!(
                    "Version in the wheel filename '{}' does not match package version '{}'",
                    wheel.version, entry.version
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::WheelError(errors.join("\n")))
        }
    }
}

/// Lockfile entries for every installed artifact of `graph` in `output_dir`
///
/// Static libraries and packages without an artifact file are skipped. Test
/// files of packages with `unvendor-tests` are moved out of their wheel
/// into a separate `<name>-tests` entry.
pub fn generate_packagedata(
    output_dir: &Path,
    graph: &DependencyGraph,
) -> Result<BTreeMap<String, LockfilePackage>> {
    let mut packages = BTreeMap::new();

    for node in graph.nodes() {
        let package_type = node.package_type();
        let Some(file_name) = &node.file_name else {
            continue;
        };
        if package_type == PackageType::StaticLibrary {
            continue;
        }
        let artifact = output_dir.join(file_name);
        if !artifact.exists() {
            debug!("{} not installed, leaving it out of the lockfile", file_name);
            continue;
        }

        let key = canonicalize_name(&node.name);
        let mut entry = LockfilePackage::new(
            &node.name,
            &node.version,
            file_name,
            node.install_dir(),
            package_type,
        );
        entry.depends = node
            .run_dependencies
            .iter()
            .map(|d| d.to_lowercase())
            .collect();

        if package_type.is_wheel() {
            let top_level = &node.recipe.package.top_level;
            entry.imports = if top_level.is_empty() {
                parse_top_level_import_name(&artifact)?.unwrap_or_else(|| vec![node.name.clone()])
            } else {
                top_level.clone()
            };

            if node.unvendor_tests()
                && let Some(tests) =
                    unvendor_tests_in_wheel(&artifact, &node.recipe.build.retain_test_patterns)?
            {
                entry.unvendored_tests = true;
                let tests_name = tests
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut tests_entry = LockfilePackage::new(
                    &format!("{}-tests", node.name),
                    &node.version,
                    &tests_name,
                    node.install_dir(),
                    PackageType::Package,
                );
                tests_entry.depends = vec![node.name.clone()];
                tests_entry.update_sha256(&tests)?;
                packages.insert(format!("{}-tests", key), tests_entry);
            }
        }

        entry.update_sha256(&artifact)?;
        packages.insert(key, entry);
    }

    Ok(packages)
}

/// Build the lockfile for the artifacts installed in `output_dir`
pub fn generate_lockfile(output_dir: &Path, graph: &DependencyGraph, env: &BuildEnv) -> Result<Lockfile> {
    let platform = env.platform()?;
    let (platform, arch) = platform
        .rsplit_once('_')
        .map(|(p, a)| (p.to_string(), a.to_string()))
        .unwrap_or_else(|| (platform.clone(), "wasm32".to_string()));
    let python = match env.vars().get("PYVERSION") {
        Some(v) if !v.is_empty() => v.clone(),
        _ => env.pyversion_major_minor()?,
    };

    let info = LockfileInfo {
        arch,
        platform,
        version: env.get_build_flag("PYODIDE_VERSION")?.to_string(),
        python,
        abi_version: env.get_build_flag("PYODIDE_ABI_VERSION")?.to_string(),
    };

    let lockfile = Lockfile {
        info,
        packages: generate_packagedata(output_dir, graph)?,
    };
    lockfile.check_wheel_filenames()?;
    Ok(lockfile)
}
