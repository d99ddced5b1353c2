// src/backend.rs

//! Build backend seam
//!
//! Compiling a Python package for the target is delegated to an external
//! PEP 517 frontend. The recipe builder prepares a cross-compilation
//! environment through [`BuildBackend::get_build_env`] and then hands the
//! source tree to [`BuildBackend::build`]. [`PypaBuildBackend`] drives
//! `python -m build`; tests substitute their own implementation.
//!
//! The cross environment routes compiler invocations through a wrapper
//! script: `build_dir/pywasmcross_symlinks/` holds symlinks named after
//! the tools (`cc`, `c++`, `ar`, ...) pointing at it, and the wrapper reads
//! its settings from `PYWASMCROSS_ARGS` or, when a tool filters the
//! environment, from `pywasmcross_env.json` next to the symlinks.

use crate::config::BuildEnv;
use crate::error::{Error, Result};
use crate::recipe::format::Exports;
use crate::recipe::kitchen::BuildLog;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Directory under the package build dir holding the wrapper symlinks
pub const SYMLINK_DIR_NAME: &str = "pywasmcross_symlinks";

/// Tool names that resolve to the compiler wrapper
pub const WRAPPED_TOOLS: &[&str] = &[
    "cc",
    "c++",
    "ld",
    "lld",
    "ar",
    "gcc",
    "ranlib",
    "strip",
    "gfortran",
    "cargo",
    "cmake",
    "meson",
    "install_name_tool",
    "otool",
];

/// Environment variables pointed at a wrapper symlink
const SYMLINK_ENV_VARS: &[(&str, &str)] = &[
    ("cc", "CC"),
    ("c++", "CXX"),
    ("ld", "LD"),
    ("lld", "LLD"),
    ("ar", "AR"),
    ("gcc", "GCC"),
    ("ranlib", "RANLIB"),
    ("strip", "STRIP"),
    ("gfortran", "FC"),
    ("cmake", "CMAKE_EXECUTABLE"),
];

/// One config setting value; repeated keys collect into a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Single(String),
    Multiple(Vec<String>),
}

/// PEP 517 `config_settings`
pub type ConfigSettings = BTreeMap<String, ConfigValue>;

/// Parse `key=value` backend flags into config settings
pub fn parse_backend_flags<S: AsRef<str>>(flags: &[S]) -> ConfigSettings {
    let mut settings = ConfigSettings::new();
    for flag in flags {
        let (key, value) = match flag.as_ref().split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (flag.as_ref().to_string(), String::new()),
        };
        match settings.get_mut(&key) {
            None => {
                settings.insert(key, ConfigValue::Single(value));
            }
            Some(ConfigValue::Single(first)) => {
                let first = std::mem::take(first);
                settings.insert(key, ConfigValue::Multiple(vec![first, value]));
            }
            Some(ConfigValue::Multiple(values)) => values.push(value),
        }
    }
    settings
}

/// Per-package inputs to the cross environment
#[derive(Debug, Clone)]
pub struct CrossBuildRequest<'a> {
    pub pkgname: &'a str,
    pub cflags: String,
    pub cxxflags: String,
    pub ldflags: String,
    pub target_install_dir: String,
    pub exports: &'a Exports,
    /// Package build directory; the wrapper symlinks live beneath it
    pub build_dir: &'a Path,
}

/// Settings blob read by the compiler wrapper
#[derive(Debug, Clone, Serialize)]
pub struct CrossCompileArgs {
    pub pkgname: String,
    pub cflags: String,
    pub cxxflags: String,
    pub ldflags: String,
    pub target_install_dir: String,
    pub exports: Exports,
    #[serde(rename = "PYTHONPATH")]
    pub pythonpath: Vec<String>,
    pub pythoninclude: String,
    #[serde(rename = "PATH")]
    pub path: String,
    pub abi: String,
}

/// External build frontend
pub trait BuildBackend: Send + Sync {
    /// Environment for compiling one package
    ///
    /// `env` is the shell environment after the build script ran.
    fn get_build_env(
        &self,
        env: &BTreeMap<String, String>,
        request: &CrossBuildRequest<'_>,
        build_env: &BuildEnv,
    ) -> Result<BTreeMap<String, String>>;

    /// Build a wheel from `srcdir` into `outdir` and return its path
    fn build(
        &self,
        srcdir: &Path,
        outdir: &Path,
        env: &BTreeMap<String, String>,
        config_settings: &ConfigSettings,
        log: &mut BuildLog,
    ) -> Result<PathBuf>;

    /// Copy shared libraries the unpacked wheel links against into it
    fn vendor_sharedlib(
        &self,
        wheel: &Path,
        wheel_dir: &Path,
        lib_dir: &Path,
        build_env: &BuildEnv,
        log: &mut BuildLog,
    ) -> Result<()>;
}

/// Create the wrapper symlinks in `symlink_dir`
///
/// The wrapper is copied next to the symlinks so the directory is
/// self-contained. Returns the compiler variables pointing at them.
pub fn make_command_wrapper_symlinks(
    symlink_dir: &Path,
    wrapper: &Path,
) -> Result<BTreeMap<String, String>> {
    let wrapper_exe = symlink_dir.join("pywasmcross.py");
    fs::copy(wrapper, &wrapper_exe).map_err(|e| {
        Error::io(format!("Failed to copy compiler wrapper {}", wrapper.display()), e)
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&wrapper_exe, fs::Permissions::from_mode(0o755))?;
    }

    let mut env = BTreeMap::new();
    for tool in WRAPPED_TOOLS {
        let link = symlink_dir.join(tool);
        // remove broken symlinks so they can be re-created
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&wrapper_exe, &link)?;
        #[cfg(not(unix))]
        fs::copy(&wrapper_exe, &link)?;

        if let Some((_, var)) = SYMLINK_ENV_VARS.iter().find(|(t, _)| t == tool) {
            env.insert(var.to_string(), link.to_string_lossy().into_owned());
        }
    }
    Ok(env)
}

/// Assemble the cross environment shared by all backends
///
/// Flags and the install dir are `$(VAR)`-substituted against `env`.
pub fn cross_build_env(
    env: &BTreeMap<String, String>,
    request: &CrossBuildRequest<'_>,
    build_env: &BuildEnv,
    wrapper: &Path,
) -> Result<BTreeMap<String, String>> {
    let substitute = |s: &str| crate::config::environment_substitute(s, env);
    let mut env = env.clone();

    // Leave the symlinks in the build directory to help reproduce failures
    let symlink_dir = request.build_dir.join(SYMLINK_DIR_NAME);
    if symlink_dir.exists() {
        fs::remove_dir_all(&symlink_dir)?;
    }
    fs::create_dir_all(&symlink_dir)?;
    env.extend(make_command_wrapper_symlinks(&symlink_dir, wrapper)?);

    let sysconfig_dir = Path::new(build_env.get_build_flag("TARGETINSTALLDIR")?).join("sysconfigdata");
    let path = env.get("PATH").cloned().unwrap_or_default();

    let args = CrossCompileArgs {
        pkgname: request.pkgname.to_string(),
        cflags: substitute(&request.cflags),
        cxxflags: substitute(&request.cxxflags),
        ldflags: substitute(&request.ldflags),
        target_install_dir: substitute(&request.target_install_dir),
        exports: request.exports.clone(),
        pythonpath: vec![
            symlink_dir.to_string_lossy().into_owned(),
            sysconfig_dir.to_string_lossy().into_owned(),
        ],
        pythoninclude: build_env.get_build_flag("PYTHONINCLUDE")?.to_string(),
        path,
        abi: build_env.get_build_flag("PYODIDE_ABI_VERSION")?.to_string(),
    };
    let blob = serde_json::to_string(&args)?;
    fs::write(symlink_dir.join("pywasmcross_env.json"), &blob)?;

    env.insert("PYWASMCROSS_ARGS".to_string(), blob);
    env.insert("_PYTHON_HOST_PLATFORM".to_string(), build_env.platform()?);
    env.insert(
        "_PYTHON_SYSCONFIGDATA_NAME".to_string(),
        build_env.get_build_flag("SYSCONFIG_NAME")?.to_string(),
    );
    env.insert(
        "PYTHONPATH".to_string(),
        sysconfig_dir.to_string_lossy().into_owned(),
    );
    env.insert(
        "COMPILER_WRAPPER_DIR".to_string(),
        symlink_dir.to_string_lossy().into_owned(),
    );
    Ok(env)
}

/// Backend running `python -m build` in an isolated environment
#[derive(Debug, Clone)]
pub struct PypaBuildBackend {
    /// Host interpreter with `build` installed
    pub python: PathBuf,
    /// Compiler wrapper script, located on `PATH` when unset
    pub compiler_wrapper: Option<PathBuf>,
}

impl Default for PypaBuildBackend {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            compiler_wrapper: None,
        }
    }
}

const VENDOR_SHAREDLIB_SCRIPT: &str = r#"
import sys
from pathlib import Path
from auditwheel_emscripten import copylib, modify_runtime_path, resolve_sharedlib
wheel_dir, lib_dir, lib_sdir, modify = Path(sys.argv[1]), Path(sys.argv[2]), sys.argv[3], sys.argv[4] == "1"
dep_map = resolve_sharedlib(wheel_dir, lib_dir)
if dep_map:
    for lib, path in copylib(wheel_dir, dep_map, lib_sdir).items():
        print(f"  {dep_map[lib]} -> {path}")
    if modify:
        modify_runtime_path(wheel_dir, lib_sdir)
"#;

impl PypaBuildBackend {
    fn wrapper(&self) -> Result<PathBuf> {
        match &self.compiler_wrapper {
            Some(path) => Ok(path.clone()),
            None => which::which("pywasmcross").map_err(|_| {
                Error::NotFound(
                    "Compiler wrapper pywasmcross not found on PATH".to_string(),
                )
            }),
        }
    }

    fn run(&self, mut cmd: Command, phase: &str, log: &mut BuildLog) -> Result<()> {
        debug!("Running {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| Error::io(format!("Failed to run {}", phase), e))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        log.step_output(phase, &stdout, &stderr);

        if !output.status.success() {
            return Err(Error::CommandFailed {
                phase: phase.to_string(),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        Ok(())
    }
}

impl BuildBackend for PypaBuildBackend {
    fn get_build_env(
        &self,
        env: &BTreeMap<String, String>,
        request: &CrossBuildRequest<'_>,
        build_env: &BuildEnv,
    ) -> Result<BTreeMap<String, String>> {
        cross_build_env(env, request, build_env, &self.wrapper()?)
    }

    fn build(
        &self,
        srcdir: &Path,
        outdir: &Path,
        env: &BTreeMap<String, String>,
        config_settings: &ConfigSettings,
        log: &mut BuildLog,
    ) -> Result<PathBuf> {
        fs::create_dir_all(outdir)?;
        let before: BTreeSet<PathBuf> = crate::wheel::list_artifacts(outdir, "whl")?
            .into_iter()
            .collect();

        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "build", "--wheel", "--outdir"])
            .arg(outdir)
            .current_dir(srcdir)
            .env_clear()
            .envs(env);
        for (key, value) in config_settings {
            let values = match value {
                ConfigValue::Single(v) => std::slice::from_ref(v),
                ConfigValue::Multiple(vs) => vs.as_slice(),
            };
            for v in values {
                cmd.arg(format!("--config-setting={}={}", key, v));
            }
        }
        cmd.arg(srcdir);
        self.run(cmd, "build", log)?;

        let built: Vec<PathBuf> = crate::wheel::list_artifacts(outdir, "whl")?
            .into_iter()
            .filter(|w| !before.contains(w))
            .collect();
        match built.as_slice() {
            [wheel] => {
                info!("Successfully built {}", wheel.display());
                Ok(wheel.clone())
            }
            _ => Err(Error::WheelError(format!(
                "Expected one new wheel in {}, found {}",
                outdir.display(),
                built.len()
            ))),
        }
    }

    fn vendor_sharedlib(
        &self,
        wheel: &Path,
        wheel_dir: &Path,
        lib_dir: &Path,
        build_env: &BuildEnv,
        log: &mut BuildLog,
    ) -> Result<()> {
        let name = crate::wheel::WheelName::from_path(wheel)?.name;
        // Older Emscripten has no RUNTIME_PATH section to rewrite
        let modify_rpath = build_env
            .get_build_flag("PYODIDE_ABI_VERSION")
            .is_ok_and(|abi| abi > "2025");

        let mut cmd = Command::new(&self.python);
        cmd.arg("-c")
            .arg(VENDOR_SHAREDLIB_SCRIPT)
            .arg(wheel_dir)
            .arg(lib_dir)
            .arg(format!("{}.libs", name))
            .arg(if modify_rpath { "1" } else { "0" });
        log.line("Copied shared libraries:");
        self.run(cmd, "vendor shared libraries", log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::format::ExportsMode;

    #[test]
    fn test_parse_backend_flags() {
        let settings = parse_backend_flags(&["a=1", "b=2", "a=3", "c", "a=4"]);
        assert_eq!(
            settings["a"],
            ConfigValue::Multiple(vec!["1".into(), "3".into(), "4".into()])
        );
        assert_eq!(settings["b"], ConfigValue::Single("2".into()));
        assert_eq!(settings["c"], ConfigValue::Single(String::new()));
        assert!(parse_backend_flags::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_make_command_wrapper_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = dir.path().join("wrapper.py");
        fs::write(&wrapper, "#!/usr/bin/env python3\n").unwrap();
        let links = dir.path().join("links");
        fs::create_dir_all(&links).unwrap();

        let env = make_command_wrapper_symlinks(&links, &wrapper).unwrap();
        for tool in WRAPPED_TOOLS {
            assert!(links.join(tool).symlink_metadata().is_ok(), "{}", tool);
        }
        assert_eq!(env["CC"], links.join("cc").to_string_lossy());
        assert_eq!(env["FC"], links.join("gfortran").to_string_lossy());
        assert!(!env.contains_key("MESON"));

        // re-running replaces existing links
        make_command_wrapper_symlinks(&links, &wrapper).unwrap();
    }

    #[test]
    fn test_cross_build_env() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = dir.path().join("wrapper.py");
        fs::write(&wrapper, "").unwrap();
        let build_env = BuildEnv::from_vars(
            dir.path(),
            [
                ("TARGETINSTALLDIR", "/target"),
                ("PYTHONINCLUDE", "/target/include"),
                ("PYODIDE_ABI_VERSION", "2025_0"),
                ("PYODIDE_EMSCRIPTEN_VERSION", "4.0.9"),
                ("SYSCONFIG_NAME", "_sysconfigdata_emscripten"),
            ],
        );
        let exports = Exports::Mode(ExportsMode::Requested);
        let request = CrossBuildRequest {
            pkgname: "demo",
            cflags: "$(EXTRA) -O2".to_string(),
            cxxflags: String::new(),
            ldflags: String::new(),
            target_install_dir: "/target".to_string(),
            exports: &exports,
            build_dir: dir.path(),
        };
        let mut env = BTreeMap::new();
        env.insert("EXTRA".to_string(), "-g".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());

        let out = cross_build_env(&env, &request, &build_env, &wrapper).unwrap();
        let args: serde_json::Value = serde_json::from_str(&out["PYWASMCROSS_ARGS"]).unwrap();
        assert_eq!(args["cflags"], "-g -O2");
        assert_eq!(args["exports"], "requested");
        assert_eq!(args["abi"], "2025_0");
        assert_eq!(out["_PYTHON_HOST_PLATFORM"], "emscripten_4_0_9_wasm32");
        assert_eq!(out["PYTHONPATH"], "/target/sysconfigdata");
        assert!(dir.path().join(SYMLINK_DIR_NAME).join("pywasmcross_env.json").is_file());
    }
}
