// tests/common/mod.rs

//! Shared helpers for integration tests.

#![allow(dead_code)]

use pyodide_recipes::config::{BuildArgs, BuildEnv};
use pyodide_recipes::recipe::{PackageNode, PackageType};
use pyodide_recipes::scheduler::PackageBuilder;
use pyodide_recipes::{Error, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::FileOptions;

pub const WHEEL_PLATFORM: &str = "pyodide_2024_0_wasm32";

/// Path to the checked-in recipe fixtures.
pub fn fixture_recipes() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/recipes")
}

/// Copy the recipe fixtures into a fresh temporary directory.
///
/// Returns (TempDir, recipe_dir) - keep the TempDir alive to prevent cleanup.
pub fn copy_fixtures() -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let recipe_dir = temp_dir.path().join("packages");
    let source = fixture_recipes();

    for entry in WalkDir::new(&source) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(&source).unwrap();
        let dest = recipe_dir.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).unwrap();
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
    (temp_dir, recipe_dir)
}

/// A build environment for Python 3.12 on emscripten 3.1.58.
pub fn test_env(root: &Path) -> BuildEnv {
    BuildEnv::from_vars(
        root,
        [
            ("PYMAJOR", "3"),
            ("PYMINOR", "12"),
            ("PYVERSION", "3.12.7"),
            ("PYODIDE_VERSION", "0.27.0"),
            ("PYODIDE_EMSCRIPTEN_VERSION", "3.1.58"),
            ("PYODIDE_ABI_VERSION", "2024_0"),
            ("SIDE_MODULE_CFLAGS", "-O2"),
            ("SIDE_MODULE_CXXFLAGS", "-O2"),
            ("SIDE_MODULE_LDFLAGS", "-s SIDE_MODULE=1"),
            ("TARGETINSTALLDIR", "/tmp/target"),
            ("HOSTINSTALLDIR", "/tmp/host"),
        ],
    )
}

/// Names in a set, for compact assertions.
pub fn names<'a>(items: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    items.into_iter().map(str::to_string).collect()
}

/// Write a wheel with a dist-info directory and the given files.
pub fn write_wheel(dir: &Path, filename: &str, files: &[(&str, &str)]) -> PathBuf {
    let stem = filename.trim_end_matches(".whl");
    let mut parts = stem.split('-');
    let name = parts.next().unwrap();
    let version = parts.next().unwrap();
    let info = format!("{}-{}.dist-info", name, version);

    fs::create_dir_all(dir).unwrap();
    let path = dir.join(filename);
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options = FileOptions::default();
    for (file, content) in files {
        zip.start_file(*file, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.start_file(format!("{}/WHEEL", info), options).unwrap();
    zip.write_all(format!("Wheel-Version: 1.0\nTag: cp312-cp312-{}\n", WHEEL_PLATFORM).as_bytes())
        .unwrap();
    zip.start_file(format!("{}/METADATA", info), options).unwrap();
    zip.write_all(format!("Metadata-Version: 2.1\nName: {}\nVersion: {}\n", name, version).as_bytes())
        .unwrap();
    zip.start_file(format!("{}/RECORD", info), options).unwrap();
    zip.finish().unwrap();
    path
}

/// Builder that fakes artifacts instead of compiling and records build order.
#[derive(Default)]
pub struct FakeBuilder {
    pub built: Mutex<Vec<String>>,
    /// Packages whose build fails
    pub failing: BTreeSet<String>,
}

impl FakeBuilder {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            built: Mutex::new(Vec::new()),
            failing: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

impl PackageBuilder for FakeBuilder {
    fn build_package(&self, node: &PackageNode, _build_args: &BuildArgs, build_dir: &Path) -> Result<()> {
        if self.failing.contains(&node.name) {
            return Err(Error::BuildFailed {
                package: node.name.clone(),
                log: node.log_path(),
                source: Box::new(Error::ConfigError("fake failure".to_string())),
            });
        }

        let dist = node.dist_dir();
        fs::create_dir_all(&dist)?;
        match node.package_type() {
            PackageType::Package | PackageType::CpythonModule => {
                let module = node.name.replace('-', "_").to_lowercase();
                write_wheel(
                    &dist,
                    &format!("{}-{}-cp312-cp312-{}.whl", node.name, node.version, WHEEL_PLATFORM),
                    &[
                        (&format!("{}/__init__.py", module), ""),
                        (&format!("{}/tests/test_basic.py", module), "def test(): pass\n"),
                    ],
                );
            }
            PackageType::SharedLibrary => {
                let archive = dist.join(format!("{}-{}.zip", node.name, node.version));
                let mut zip = ZipWriter::new(File::create(archive)?);
                zip.start_file(format!("lib{}.so", node.name), FileOptions::default())?;
                zip.write_all(b"\0asm")?;
                zip.finish()?;
            }
            PackageType::StaticLibrary => {}
        }

        let build_path = node.build_path(build_dir);
        fs::create_dir_all(&build_path)?;
        fs::write(build_path.join(".packaged"), "")?;
        fs::write(node.log_path(), format!("built {}\n", node.name))?;

        self.built.lock().unwrap().push(node.name.clone());
        Ok(())
    }
}
