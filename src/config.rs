// src/config.rs

//! Build environment configuration
//!
//! A [`BuildEnv`] is constructed once per invocation and passed down to
//! every component that needs a build flag. Values are layered, lowest
//! precedence first:
//!
//! 1. Built-in defaults
//! 2. Variables exported by the cross-build environment (`Makefile.envs`),
//!    plus defaults computed from them
//! 3. `[tool.pyodide.build]` in the nearest `pyproject.toml` (overridable keys only)
//! 4. Process environment variables
//!
//! Flags are looked up by their environment variable name (`PYMAJOR`,
//! `SIDE_MODULE_CFLAGS`, ...).

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Configuration keys and the environment variables they are exported as
const BUILD_KEY_TO_VAR: &[(&str, &str)] = &[
    ("pyodide_version", "PYODIDE_VERSION"),
    ("pyodide_abi_version", "PYODIDE_ABI_VERSION"),
    ("cargo_build_target", "CARGO_BUILD_TARGET"),
    (
        "cargo_target_wasm32_unknown_emscripten_linker",
        "CARGO_TARGET_WASM32_UNKNOWN_EMSCRIPTEN_LINKER",
    ),
    ("host_install_dir", "HOSTINSTALLDIR"),
    ("host_site_packages", "HOSTSITEPACKAGES"),
    ("numpy_lib", "NUMPY_LIB"),
    ("platform_triplet", "PLATFORM_TRIPLET"),
    ("pip_constraint", "PIP_CONSTRAINT"),
    ("pip_build_constraint", "PIP_BUILD_CONSTRAINT"),
    ("pymajor", "PYMAJOR"),
    ("pymicro", "PYMICRO"),
    ("pyminor", "PYMINOR"),
    ("pyo3_cross_include_dir", "PYO3_CROSS_INCLUDE_DIR"),
    ("pyo3_cross_lib_dir", "PYO3_CROSS_LIB_DIR"),
    ("pyo3_cross_python_version", "PYO3_CROSS_PYTHON_VERSION"),
    ("pyodide_emscripten_version", "PYODIDE_EMSCRIPTEN_VERSION"),
    ("pyodide_jobs", "PYODIDE_JOBS"),
    ("pyodide_root", "PYODIDE_ROOT"),
    ("pythoninclude", "PYTHONINCLUDE"),
    ("pyversion", "PYVERSION"),
    ("cpythoninstall", "CPYTHONINSTALL"),
    ("rustflags", "RUSTFLAGS"),
    ("rust_toolchain", "RUST_TOOLCHAIN"),
    ("rust_emscripten_target_url", "RUST_EMSCRIPTEN_TARGET_URL"),
    ("cflags", "SIDE_MODULE_CFLAGS"),
    ("cxxflags", "SIDE_MODULE_CXXFLAGS"),
    ("ldflags", "SIDE_MODULE_LDFLAGS"),
    ("stdlib_module_cflags", "STDLIB_MODULE_CFLAGS"),
    ("sysconfigdata_dir", "SYSCONFIGDATA_DIR"),
    ("sysconfig_name", "SYSCONFIG_NAME"),
    ("targetinstalldir", "TARGETINSTALLDIR"),
    ("cmake_toolchain_file", "CMAKE_TOOLCHAIN_FILE"),
    ("meson_cross_file", "MESON_CROSS_FILE"),
    ("cflags_base", "CFLAGS_BASE"),
    ("cxxflags_base", "CXXFLAGS_BASE"),
    ("ldflags_base", "LDFLAGS_BASE"),
    ("home", "HOME"),
    ("path", "PATH"),
    ("zip_compression_level", "PYODIDE_ZIP_COMPRESSION_LEVEL"),
    ("skip_emscripten_version_check", "SKIP_EMSCRIPTEN_VERSION_CHECK"),
    ("build_dependency_index_url", "BUILD_DEPENDENCY_INDEX_URL"),
];

/// Keys a user may override from `pyproject.toml`
const OVERRIDABLE_BUILD_KEYS: &[&str] = &[
    "cflags",
    "cxxflags",
    "ldflags",
    "rust_toolchain",
    "meson_cross_file",
    "skip_emscripten_version_check",
    "build_dependency_index_url",
];

const DEFAULT_CONFIG: &[(&str, &str)] = &[
    (
        "rustflags",
        "-C link-arg=-sSIDE_MODULE=2 -C link-arg=-sWASM_BIGINT -Z link-native-libraries=no",
    ),
    ("cargo_build_target", "wasm32-unknown-emscripten"),
    ("cargo_target_wasm32_unknown_emscripten_linker", "emcc"),
    ("rust_toolchain", "nightly-2025-02-01"),
    ("pyodide_jobs", "1"),
    ("skip_emscripten_version_check", "0"),
    ("zip_compression_level", "6"),
    (
        "build_dependency_index_url",
        "https://pypi.anaconda.org/pyodide/simple",
    ),
];

/// Defaults derived from cross-build variables via `$(VAR)` substitution
const DEFAULT_CONFIG_COMPUTED: &[(&str, &str)] = &[
    ("cflags", "$(CFLAGS_BASE) -I$(PYTHONINCLUDE)"),
    ("cxxflags", "$(CXXFLAGS_BASE)"),
    ("ldflags", "$(LDFLAGS_BASE) -s SIDE_MODULE=1"),
    ("pyo3_cross_lib_dir", "$(CPYTHONINSTALL)/sysconfigdata"),
    ("pyo3_cross_include_dir", "$(PYTHONINCLUDE)"),
    ("pyo3_cross_python_version", "$(PYMAJOR).$(PYMINOR)"),
    (
        "stdlib_module_cflags",
        "$(CFLAGS_BASE) -I$(PYTHONINCLUDE) -I Include/ -I. -IInclude/internal/",
    ),
    ("host_install_dir", "$(PYODIDE_ROOT)/packages/.artifacts"),
    (
        "host_site_packages",
        "$(PYODIDE_ROOT)/packages/.artifacts/lib/python$(PYMAJOR).$(PYMINOR)/site-packages",
    ),
    (
        "numpy_lib",
        "$(PYODIDE_ROOT)/packages/.artifacts/lib/python$(PYMAJOR).$(PYMINOR)/site-packages/numpy/",
    ),
    (
        "cmake_toolchain_file",
        "$(PYODIDE_ROOT)/tools/cmake/Modules/Platform/Emscripten.cmake",
    ),
    ("meson_cross_file", "$(PYODIDE_ROOT)/tools/emscripten.meson.cross"),
];

/// Minimum timestamp a ZIP entry can carry (1980-01-01)
pub const MIN_SOURCE_EPOCH: i64 = 315_532_800;

fn var_for_key(key: &str) -> Option<&'static str> {
    BUILD_KEY_TO_VAR
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

fn key_for_var(var: &str) -> Option<&'static str> {
    BUILD_KEY_TO_VAR
        .iter()
        .find(|(_, v)| *v == var)
        .map(|(k, _)| *k)
}

/// Replace every `$(NAME)` in `template` with its value from `vars`
pub fn environment_substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (name, value) in vars {
        result = result.replace(&format!("$({})", name), value);
    }
    result
}

/// Resolved build environment for one invocation
#[derive(Debug, Clone)]
pub struct BuildEnv {
    root: PathBuf,
    vars: BTreeMap<String, String>,
}

impl BuildEnv {
    /// Load the full layered configuration rooted at `root`
    pub fn load(root: &Path) -> Result<Self> {
        let root = root.to_path_buf();
        let makefile = root.join("Makefile.envs");
        let cross_vars = if makefile.is_file() {
            read_makefile_vars(&root, &makefile)?
        } else {
            warn!(
                "{} not found, using defaults and environment only",
                makefile.display()
            );
            BTreeMap::new()
        };

        let cwd = std::env::current_dir()?;
        let process_env: BTreeMap<String, String> = std::env::vars().collect();
        let file_config = load_config_file(&cwd, &process_env)?;

        let config = layer_config(&root, cross_vars, file_config, &process_env);
        Ok(Self::from_config(root, config))
    }

    /// Build an environment from explicit variables, skipping `Makefile.envs`,
    /// `pyproject.toml` and the process environment
    pub fn from_vars<I, K, V>(root: &Path, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let cross_vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let config = layer_config(root, cross_vars, BTreeMap::new(), &BTreeMap::new());
        Self::from_config(root.to_path_buf(), config)
    }

    fn from_config(root: PathBuf, config: BTreeMap<String, String>) -> Self {
        let mut vars = BTreeMap::new();
        for (key, value) in config {
            match var_for_key(&key) {
                Some(var) => {
                    vars.insert(var.to_string(), value);
                }
                // Extra cross-build variables that have no config key keep their name
                None => {
                    vars.insert(key, value);
                }
            }
        }

        vars.insert("PYODIDE".to_string(), "1".to_string());
        vars.insert("PYODIDE_PACKAGE_ABI".to_string(), "1".to_string());
        if let Some(site) = vars.get("HOSTSITEPACKAGES").cloned() {
            vars.insert("PYTHONPATH".to_string(), site);
        }

        Self { root, vars }
    }

    /// Root directory of the Pyodide tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All exported build variables
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Look up a build flag by its variable name
    pub fn get_build_flag(&self, name: &str) -> Result<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::ConfigError(format!("Unknown build flag: {}", name)))
    }

    /// Substitute `$(VAR)` references against the build variables
    pub fn substitute(&self, template: &str) -> String {
        environment_substitute(template, &self.vars)
    }

    pub fn pymajor(&self) -> Result<u32> {
        parse_version_component(self.get_build_flag("PYMAJOR")?, "PYMAJOR")
    }

    pub fn pyminor(&self) -> Result<u32> {
        parse_version_component(self.get_build_flag("PYMINOR")?, "PYMINOR")
    }

    /// `MAJOR.MINOR` of the target interpreter
    pub fn pyversion_major_minor(&self) -> Result<String> {
        Ok(format!("{}.{}", self.pymajor()?, self.pyminor()?))
    }

    /// Emscripten platform tag, e.g. `emscripten_3_1_58_wasm32`
    pub fn platform(&self) -> Result<String> {
        let version = self.get_build_flag("PYODIDE_EMSCRIPTEN_VERSION")?;
        Ok(format!("emscripten_{}_wasm32", version.replace('.', "_")))
    }

    /// ABI-versioned wheel platform tag, e.g. `pyodide_2025_0_wasm32`
    pub fn wheel_platform(&self) -> Result<String> {
        let abi = self.get_build_flag("PYODIDE_ABI_VERSION")?;
        Ok(format!("pyodide_{}_wasm32", abi))
    }

    /// Site-packages directory of the host-side Python used by cross builds
    pub fn host_site_packages(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.get_build_flag("HOSTSITEPACKAGES")?))
    }

    /// Global pip constraints file, created empty when missing
    ///
    /// `PIP_BUILD_CONSTRAINT` wins over `PIP_CONSTRAINT`.
    pub fn constraints_file(&self) -> Result<Option<String>> {
        let constraints = self
            .vars
            .get("PIP_BUILD_CONSTRAINT")
            .or_else(|| self.vars.get("PIP_CONSTRAINT"))
            .map(|s| s.trim())
            .unwrap_or("");

        if constraints.is_empty() {
            return Ok(None);
        }

        if constraints.split_whitespace().count() > 1 {
            return Err(Error::ConfigError(
                "PIP_BUILD_CONSTRAINT/PIP_CONSTRAINT contains spaces so pip will misinterpret it. \
                 Make sure the path to pyodide has no spaces."
                    .to_string(),
            ));
        }

        let path = Path::new(constraints);
        if !path.is_file() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, "")?;
        }

        Ok(Some(constraints.to_string()))
    }

    /// Default compression level for repacked archives
    pub fn zip_compression_level(&self) -> i64 {
        self.vars
            .get("PYODIDE_ZIP_COMPRESSION_LEVEL")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(6)
    }
}

fn parse_version_component(value: &str, name: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::ConfigError(format!("Invalid {}: {:?}", name, value)))
}

/// Merge all configuration layers into a key-indexed map
fn layer_config(
    root: &Path,
    mut cross_vars: BTreeMap<String, String>,
    file_config: BTreeMap<String, String>,
    process_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut config: BTreeMap<String, String> = DEFAULT_CONFIG
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    cross_vars
        .entry("PYODIDE_ROOT".to_string())
        .or_insert_with(|| root.to_string_lossy().into_owned());

    for (key, template) in DEFAULT_CONFIG_COMPUTED {
        config.insert(key.to_string(), environment_substitute(template, &cross_vars));
    }

    for (var, value) in &cross_vars {
        match key_for_var(var) {
            Some(key) => {
                config.insert(key.to_string(), value.clone());
            }
            None => {
                config.insert(var.clone(), value.clone());
            }
        }
    }

    config.extend(file_config);

    for (var, value) in process_env {
        if let Some(key) = key_for_var(var) {
            config.insert(key.to_string(), value.clone());
        }
    }

    config
}

/// Ask make for the variables exported by `Makefile.envs`
fn read_makefile_vars(root: &Path, makefile: &Path) -> Result<BTreeMap<String, String>> {
    let output = Command::new("make")
        .arg("-f")
        .arg(makefile)
        .arg(".output_vars")
        .env_clear()
        .env("PYODIDE_ROOT", root)
        .output()
        .map_err(|e| Error::io("Failed to run make", e))?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            phase: "Loading environment variables from Makefile.envs".to_string(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(parse_make_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `NAME=value` lines printed by `make .output_vars`
fn parse_make_output(stdout: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in stdout.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if key_for_var(name).is_none() {
            continue;
        }
        let value = value.trim_matches('\'').trim();
        vars.insert(name.to_string(), value.to_string());
    }
    vars
}

/// Walk upward from `start` looking for a `pyproject.toml`
pub fn search_pyproject_toml(start: &Path, max_depth: usize) -> Option<(PathBuf, toml::Value)> {
    let mut dir = Some(start);
    let mut depth = 0;
    while let Some(current) = dir {
        if depth > max_depth {
            break;
        }
        let candidate = current.join("pyproject.toml");
        if candidate.is_file() {
            let parsed = fs::read_to_string(&candidate)
                .ok()
                .and_then(|s| s.parse::<toml::Value>().ok());
            return parsed.map(|value| (candidate, value));
        }
        dir = current.parent();
        depth += 1;
    }
    None
}

/// Locate the Pyodide tree: the directory holding a `pyproject.toml`
/// with a `[tool._pyodide]` table
pub fn search_root(start: &Path) -> Option<PathBuf> {
    let (path, value) = search_pyproject_toml(start, 10)?;
    let is_root = value
        .get("tool")
        .and_then(|tool| tool.get("_pyodide"))
        .is_some();
    if is_root {
        path.parent().map(Path::to_path_buf)
    } else {
        None
    }
}

fn load_config_file(
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut config = BTreeMap::new();
    let Some((path, value)) = search_pyproject_toml(cwd, 10) else {
        return Ok(config);
    };

    let Some(build) = value
        .get("tool")
        .and_then(|t| t.get("pyodide"))
        .and_then(|p| p.get("build"))
        .and_then(|b| b.as_table())
    else {
        return Ok(config);
    };

    debug!("Loading build configuration from {}", path.display());
    for (key, value) in build {
        if !OVERRIDABLE_BUILD_KEYS.contains(&key.as_str()) {
            warn!(
                "The provided build key {} is either invalid or not overridable, hence ignored.",
                key
            );
            continue;
        }
        let raw = match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        config.insert(key.clone(), environment_substitute(&raw, env));
    }

    Ok(config)
}

/// Compiler flags and install locations for one build pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildArgs {
    pub cflags: String,
    pub cxxflags: String,
    pub ldflags: String,
    pub target_install_dir: String,
    pub host_install_dir: String,
}

impl BuildArgs {
    /// Fill empty fields from the build environment
    pub fn with_defaults(mut self, env: &BuildEnv) -> Result<Self> {
        let fill = |field: &mut String, flag: &str| -> Result<()> {
            if field.is_empty() {
                *field = env.get_build_flag(flag)?.to_string();
            }
            Ok(())
        };
        fill(&mut self.cflags, "SIDE_MODULE_CFLAGS")?;
        fill(&mut self.cxxflags, "SIDE_MODULE_CXXFLAGS")?;
        fill(&mut self.ldflags, "SIDE_MODULE_LDFLAGS")?;
        fill(&mut self.target_install_dir, "TARGETINSTALLDIR")?;
        fill(&mut self.host_install_dir, "HOSTINSTALLDIR")?;
        Ok(self)
    }
}

/// Resolve the archive timestamp from a `SOURCE_DATE_EPOCH` value
///
/// Unset or unparsable values fall back to `now`; anything earlier than
/// the ZIP epoch is clamped to [`MIN_SOURCE_EPOCH`].
pub fn source_epoch(value: Option<&str>, now: i64) -> i64 {
    let epoch = match value.map(str::trim) {
        Some(v) if !v.is_empty() => match v.parse::<i64>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid SOURCE_DATE_EPOCH {:?}, using current time", v);
                now
            }
        },
        _ => now,
    };
    epoch.max(MIN_SOURCE_EPOCH)
}

/// `source_epoch` applied to the process environment
pub fn get_source_epoch() -> i64 {
    let value = std::env::var("SOURCE_DATE_EPOCH").ok();
    source_epoch(value.as_deref(), chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> BuildEnv {
        BuildEnv::from_vars(
            Path::new("/pyodide"),
            [
                ("PYMAJOR", "3"),
                ("PYMINOR", "12"),
                ("PYMICRO", "7"),
                ("PYODIDE_EMSCRIPTEN_VERSION", "3.1.58"),
                ("PYODIDE_ABI_VERSION", "2025_0"),
                ("CFLAGS_BASE", "-O2"),
                ("CXXFLAGS_BASE", "-O2 -std=c++17"),
                ("LDFLAGS_BASE", "-O2"),
                ("PYTHONINCLUDE", "/pyodide/cpython/include"),
                ("TARGETINSTALLDIR", "/target"),
            ],
        )
    }

    #[test]
    fn test_computed_defaults() {
        let env = sample_env();
        assert_eq!(
            env.get_build_flag("SIDE_MODULE_CFLAGS").unwrap(),
            "-O2 -I/pyodide/cpython/include"
        );
        assert_eq!(
            env.get_build_flag("SIDE_MODULE_LDFLAGS").unwrap(),
            "-O2 -s SIDE_MODULE=1"
        );
        assert_eq!(
            env.get_build_flag("HOSTSITEPACKAGES").unwrap(),
            "/pyodide/packages/.artifacts/lib/python3.12/site-packages"
        );
        assert_eq!(
            env.get_build_flag("PYTHONPATH").unwrap(),
            env.get_build_flag("HOSTSITEPACKAGES").unwrap()
        );
        assert_eq!(env.get_build_flag("PYODIDE").unwrap(), "1");
    }

    #[test]
    fn test_unknown_flag() {
        let err = sample_env().get_build_flag("NOPE").unwrap_err();
        assert_eq!(err.to_string(), "Unknown build flag: NOPE");
    }

    #[test]
    fn test_platform_strings() {
        let env = sample_env();
        assert_eq!(env.platform().unwrap(), "emscripten_3_1_58_wasm32");
        assert_eq!(env.wheel_platform().unwrap(), "pyodide_2025_0_wasm32");
        assert_eq!(env.pyversion_major_minor().unwrap(), "3.12");
    }

    #[test]
    fn test_cross_vars_override_computed() {
        let env = BuildEnv::from_vars(
            Path::new("/pyodide"),
            [("SIDE_MODULE_CFLAGS", "-Oz"), ("CFLAGS_BASE", "-O2")],
        );
        assert_eq!(env.get_build_flag("SIDE_MODULE_CFLAGS").unwrap(), "-Oz");
    }

    #[test]
    fn test_parse_make_output() {
        let vars = parse_make_output("PYMAJOR=3\nPYMINOR='12'\nUNRELATED=1\nnot a var\n");
        assert_eq!(vars.get("PYMAJOR").map(String::as_str), Some("3"));
        assert_eq!(vars.get("PYMINOR").map(String::as_str), Some("12"));
        assert!(!vars.contains_key("UNRELATED"));
    }

    #[test]
    fn test_constraints_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("constraints.txt");
        let env = BuildEnv::from_vars(
            dir.path(),
            [("PIP_CONSTRAINT", path.to_string_lossy().into_owned())],
        );
        let found = env.constraints_file().unwrap();
        assert_eq!(found.as_deref(), Some(path.to_str().unwrap()));
        assert!(path.is_file());
    }

    #[test]
    fn test_constraints_file_with_spaces() {
        let env = BuildEnv::from_vars(Path::new("/p"), [("PIP_CONSTRAINT", "/a b/c.txt")]);
        assert!(env.constraints_file().is_err());
    }

    #[test]
    fn test_build_args_defaults() {
        let args = BuildArgs {
            cflags: "-g".to_string(),
            ..Default::default()
        }
        .with_defaults(&sample_env())
        .unwrap();
        assert_eq!(args.cflags, "-g");
        assert_eq!(args.ldflags, "-O2 -s SIDE_MODULE=1");
        assert_eq!(args.target_install_dir, "/target");
        assert_eq!(args.host_install_dir, "/pyodide/packages/.artifacts");
    }

    #[test]
    fn test_search_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pyproject.toml"),
            "[tool._pyodide]\nfoo = 1\n",
        )
        .unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(search_root(&nested), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_source_epoch() {
        assert_eq!(source_epoch(Some("1700000000"), 5), 1_700_000_000);
        assert_eq!(source_epoch(Some("0"), 1_700_000_000), MIN_SOURCE_EPOCH);
        assert_eq!(source_epoch(Some("garbage"), 1_700_000_000), 1_700_000_000);
        assert_eq!(source_epoch(None, 1_600_000_000), 1_600_000_000);
    }
}
