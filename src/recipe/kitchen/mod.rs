// src/recipe/kitchen/mod.rs

//! Kitchen: building a single recipe
//!
//! [`RecipeBuilder`] takes one package from source to artifact:
//!
//! 1. **Prepare source**: download and unpack the archive (or copy a local tree)
//! 2. **Patch**: apply patches and copy extra files, once per source tree
//! 3. **Build**: run the recipe's build script, then the variant-specific steps
//!    - wheels: compile through the [`BuildBackend`], retag, run the post
//!      script inside the unpacked wheel, repack
//!    - static libraries: nothing beyond the build script
//!    - shared libraries: zip the build output into `dist/`
//!
//! Scripts share one environment (see [`ShellRunner`]) seeded with helper
//! variables such as `PKGDIR` and `DISTDIR`. Whether anything runs at all
//! is decided by [`needs_rebuild`] unless the build is forced.

mod archive;
mod config;
pub mod rebuild;
mod shell;

pub use archive::{
    apply_patch, check_checksum, copy_tree, download_source, extract_tarballname,
    remove_dir_all_retrying, trim_archive_extension, unpack_archive,
};
pub use config::{BuildPhase, BuildResult, BuildVariant, KitchenConfig};
pub use rebuild::{PACKAGED_SENTINEL, needs_rebuild};
pub use shell::{BuildLog, ScriptOutput, ShellRunner};

use crate::backend::{BuildBackend, CrossBuildRequest, parse_backend_flags};
use crate::config::{BuildArgs, BuildEnv};
use crate::error::{Error, Result};
use crate::recipe::format::Recipe;
use crate::recipe::graph::find_missing_executables;
use crate::recipe::parser::load_recipe;
use crate::wheel::{
    WheelName, check_versions_match, find_matching_wheel, list_artifacts, make_zip_archive,
    modify_wheel, pyodide_tags, retag_wheel,
};
use chrono::Local;
use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Run before the build script of Rust packages
pub const RUST_BUILD_PRELUDE: &str = "rustup default ${RUST_TOOLCHAIN}\n";

/// Marker in the extracted source tree once patches are applied
const PATCHED_SENTINEL: &str = ".patched";

/// Builds one recipe
pub struct RecipeBuilder {
    pub name: String,
    pub version: String,
    pub fullname: String,
    pub pkg_root: PathBuf,
    pub recipe: Recipe,
    pub variant: BuildVariant,
    /// Scratch directory; wiped when the source is prepared
    pub build_dir: PathBuf,
    /// Where the source is extracted
    pub src_extract_dir: PathBuf,
    /// Where the build puts its artifacts (`DISTDIR`)
    pub src_dist_dir: PathBuf,
    /// Where finished artifacts are collected for installation
    pub dist_dir: PathBuf,
    /// Shared install prefix for libraries, `build_dir/../../.libs`
    pub library_install_prefix: PathBuf,
    build_args: BuildArgs,
    config: KitchenConfig,
    env: Arc<BuildEnv>,
    backend: Arc<dyn BuildBackend>,
    log: BuildLog,
    phase: BuildPhase,
}

impl RecipeBuilder {
    /// Load the recipe at `recipe_path` (package directory or `recipe.toml`)
    pub fn new(
        recipe_path: &Path,
        build_args: BuildArgs,
        config: KitchenConfig,
        env: Arc<BuildEnv>,
        backend: Arc<dyn BuildBackend>,
    ) -> Result<Self> {
        let recipe_path = std::path::absolute(recipe_path)?;
        let (pkg_root, recipe) = load_recipe(&recipe_path)?;

        let build_dir = match &config.build_dir {
            Some(dir) => std::path::absolute(dir)?,
            None => pkg_root.join("build"),
        };
        if build_dir.to_string_lossy().split_whitespace().count() > 1 {
            return Err(Error::ConfigError(
                "PIP_CONSTRAINT contains spaces so pip will misinterpret it. \
                 Make sure the path to the package build directory has no spaces.\n\
                 See https://github.com/pypa/pip/issues/13283"
                    .to_string(),
            ));
        }

        let name = recipe.package.name.clone();
        let version = recipe.package.version.clone();
        let fullname = recipe.fullname();
        let library_install_prefix = build_dir
            .parent()
            .and_then(Path::parent)
            .map(|p| p.join(".libs"))
            .unwrap_or_else(|| PathBuf::from(".libs"));
        let src_extract_dir = build_dir.join(&fullname);
        let src_dist_dir = src_extract_dir.join("dist");
        let dist_dir = pkg_root.join("dist");
        let variant = BuildVariant::from(recipe.build.package_type);
        let config = KitchenConfig {
            force_rebuild: config.force_rebuild || config.continue_build,
            ..config
        };
        let log = BuildLog::stream_only(config.echo_log);

        Ok(Self {
            name,
            version,
            fullname,
            pkg_root,
            recipe,
            variant,
            build_dir,
            src_extract_dir,
            src_dist_dir,
            dist_dir,
            library_install_prefix,
            build_args,
            config,
            env,
            backend,
            log,
            phase: BuildPhase::Unstarted,
        })
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn is_wheel(&self) -> bool {
        matches!(self.variant, BuildVariant::Wheel { .. })
    }

    pub fn log_path(&self) -> PathBuf {
        self.pkg_root.join("build.log")
    }

    fn advance(&mut self, next: BuildPhase) {
        debug_assert!(self.phase.can_advance_to(next), "{} -> {}", self.phase, next);
        debug!("{}: {} -> {}", self.name, self.phase, next);
        self.phase = next;
    }

    fn announce(&mut self, message: &str, failed: bool) {
        if failed {
            error!("{}", message);
        } else if self.config.echo_log {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
        self.log.write_file(message);
    }

    /// Build the package
    ///
    /// Errors and panics mark the builder [`BuildPhase::Failed`]; panics are
    /// resumed after the failure line is logged.
    pub fn build(&mut self) -> Result<BuildResult> {
        self.check_executables()?;

        let started = Instant::now();
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let start_line = format!("[{}] Building package {}...", timestamp, self.name);
        self.announce(&start_line, false);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.build_inner(&start_line)));
        let success = matches!(outcome, Ok(Ok(_)));
        let elapsed = started.elapsed();
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let status = if success { "Succeeded" } else { "Failed" };
        self.announce(
            &format!(
                "[{}] {} building package {} in {:.1} seconds.",
                timestamp,
                status,
                self.name,
                elapsed.as_secs_f64()
            ),
            !success,
        );

        match outcome {
            Ok(Ok((rebuilt, artifact))) => Ok(BuildResult {
                phase: self.phase,
                rebuilt,
                elapsed,
                artifact,
            }),
            Ok(Err(e)) => {
                self.phase = BuildPhase::Failed;
                Err(e)
            }
            Err(payload) => {
                self.phase = BuildPhase::Failed;
                panic::resume_unwind(payload)
            }
        }
    }

    fn check_executables(&self) -> Result<()> {
        let missing = find_missing_executables(&self.recipe.requirements.executable);
        if !missing.is_empty() {
            return Err(Error::ConfigError(format!(
                "The following executables are required to build {}, but missing in the host system: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn build_inner(&mut self, start_line: &str) -> Result<(bool, Option<PathBuf>)> {
        if !self.config.force_rebuild {
            let tags = if self.is_wheel() {
                pyodide_tags(&self.env)?
            } else {
                Vec::new()
            };
            let stale = needs_rebuild(
                &self.pkg_root,
                &self.build_dir,
                &self.recipe.source,
                self.is_wheel(),
                Some(&self.version),
                &tags,
            )?;
            if !stale {
                info!("{} is up to date", self.name);
                return Ok((false, None));
            }
        }

        if self.config.continue_build && !self.src_extract_dir.exists() {
            return Err(Error::NotFound(format!(
                "Cannot find source for rebuild. Expected to find the source directory at the path {}, but that path does not exist.",
                self.src_extract_dir.display()
            )));
        }

        // The log file is truncated here, after the start line was announced
        self.log = BuildLog::create(&self.log_path(), self.config.echo_log)?;
        self.log.write_file(start_line);

        if self.config.continue_build {
            self.advance(BuildPhase::Patched);
        } else {
            self.prepare_source()?;
            self.patch()?;
        }

        let mut runner = ShellRunner::new(self.script_env());
        let artifact = match self.variant {
            BuildVariant::Wheel { cpython_module } => {
                Some(self.build_wheel_package(&mut runner, cpython_module)?)
            }
            BuildVariant::StaticLibrary => {
                self.run_build_script(&mut runner)?;
                self.advance(BuildPhase::Compiled);
                None
            }
            BuildVariant::SharedLibrary => Some(self.build_shared_library(&mut runner)?),
        };

        if !self.is_wheel() {
            fs::create_dir_all(&self.build_dir)?;
            fs::write(self.build_dir.join(PACKAGED_SENTINEL), "")?;
        }
        Ok((true, artifact))
    }

    /// Helper variables exported to every script
    pub fn helper_vars(&self) -> BTreeMap<String, String> {
        let pkgconfig = self.library_install_prefix.join("lib/pkgconfig");
        let path = |p: &Path| p.to_string_lossy().into_owned();
        BTreeMap::from([
            ("PKGDIR".to_string(), path(&self.pkg_root)),
            ("PKG_VERSION".to_string(), self.version.clone()),
            ("PKG_BUILD_DIR".to_string(), path(&self.src_extract_dir)),
            ("DISTDIR".to_string(), path(&self.src_dist_dir)),
            ("WASM_LIBRARY_DIR".to_string(), path(&self.library_install_prefix)),
            ("EM_PKG_CONFIG_PATH".to_string(), path(&pkgconfig)),
            // pkg-config without emconfigure must not search system dirs
            ("PKG_CONFIG_LIBDIR".to_string(), path(&pkgconfig)),
        ])
    }

    /// Helper variables, overridden by the process and build environments
    fn script_env(&self) -> BTreeMap<String, String> {
        let mut env = self.helper_vars();
        env.extend(std::env::vars());
        env.extend(
            self.env
                .vars()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    /// Fetch the source into `src_extract_dir`, starting from a clean build dir
    pub fn prepare_source(&mut self) -> Result<()> {
        if self.build_dir.is_dir() {
            remove_dir_all_retrying(&self.build_dir)?;
        }
        fs::create_dir_all(&self.build_dir)?;

        if self.recipe.source.url.is_some() {
            self.download_and_extract()?;
        } else {
            let Some(path) = &self.recipe.source.path else {
                return Err(Error::ConfigError(
                    "Incorrect source provided. Either a url or a path must be provided."
                        .to_string(),
                ));
            };
            let srcdir = self.pkg_root.join(path);
            if !srcdir.is_dir() {
                return Err(Error::ConfigError(format!(
                    "path={} must point to a directory that exists",
                    srcdir.display()
                )));
            }

            // Stale wheels in a dirty tree would be picked up as build output
            copy_tree(&srcdir, &self.src_extract_dir, |parent, name| {
                parent.file_name().is_some_and(|n| n == "dist") && name.ends_with(".whl")
            })?;
            fs::create_dir_all(&self.src_dist_dir)?;
        }

        self.advance(BuildPhase::SourcePrepared);
        Ok(())
    }

    fn download_and_extract(&mut self) -> Result<()> {
        let url = self
            .env
            .substitute(self.recipe.source.url.as_deref().unwrap_or_default());
        let tarball = download_source(&url, &self.build_dir)?;
        let tarballname = tarball
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(checksum) = &self.recipe.source.sha256 {
            let checksum = self.env.substitute(checksum);
            if let Err(e) = check_checksum(&tarball, &checksum) {
                fs::remove_file(&tarball)?;
                return Err(e);
            }
        }

        // already built
        if tarballname.ends_with(".whl") {
            check_versions_match(&self.name, &tarballname, &self.version)?;
            fs::create_dir_all(&self.src_dist_dir)?;
            fs::copy(&tarball, self.src_dist_dir.join(&tarballname))?;
            return Ok(());
        }

        unpack_archive(&tarball, &self.build_dir)?;

        let extract_dir_name = self
            .recipe
            .source
            .extract_dir
            .clone()
            .unwrap_or_else(|| trim_archive_extension(&tarballname).to_string());
        let extracted = self.build_dir.join(&extract_dir_name);
        if !extracted.is_dir() {
            return Err(Error::NotFound(format!(
                "Expected {} to contain {} after extracting {}",
                self.build_dir.display(),
                extract_dir_name,
                tarballname
            )));
        }
        if extracted != self.src_extract_dir {
            fs::rename(&extracted, &self.src_extract_dir)?;
        }
        fs::create_dir_all(&self.src_dist_dir)?;
        Ok(())
    }

    /// Apply patches and copy extras, at most once per source tree
    pub fn patch(&mut self) -> Result<()> {
        let token = self.src_extract_dir.join(PATCHED_SENTINEL);
        let source = &self.recipe.source;

        if !token.is_file() && (!source.patches.is_empty() || !source.extras.is_empty()) {
            for patch in &source.patches {
                let patch_path = self.pkg_root.join(patch);
                info!("Applying patch: {}", patch);
                match apply_patch(&self.src_extract_dir, &patch_path) {
                    Ok((stdout, stderr)) => self.log.step_output(patch, &stdout, &stderr),
                    Err(e) => {
                        if let Error::CommandFailed { stdout, stderr, .. } = &e {
                            self.log.output(stdout);
                            self.log.output(stderr);
                        }
                        self.log
                            .line(&format!("ERROR: Patch {} failed", patch_path.display()));
                        return Err(e);
                    }
                }
            }

            for (src, dst) in &source.extras {
                let from = self.pkg_root.join(src);
                let to = self.src_extract_dir.join(dst);
                fs::copy(&from, &to).map_err(|e| {
                    Error::io(format!("Failed to copy {} to {}", from.display(), to.display()), e)
                })?;
            }

            fs::write(&token, "")?;
        }

        self.advance(BuildPhase::Patched);
        Ok(())
    }

    fn run_build_script(&mut self, runner: &mut ShellRunner) -> Result<()> {
        runner.run(
            self.recipe.build.script.as_deref(),
            "build script",
            &self.src_extract_dir,
            &mut self.log,
        )
    }

    /// Merge the global constraints file with the recipe's own constraints
    ///
    /// Returns a space separated list of constraint files for `PIP_CONSTRAINT`.
    pub fn create_constraints_file(&self) -> Result<String> {
        let host = self.env.constraints_file()?.unwrap_or_default();
        let constraints = &self.recipe.requirements.constraint;
        if constraints.is_empty() {
            return Ok(host);
        }

        let path = self.build_dir.join("constraints.txt");
        let content: String = constraints.iter().map(|c| format!("{}\n", c)).collect();
        fs::write(&path, content)?;

        let files: Vec<String> = [host, path.to_string_lossy().into_owned()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        Ok(files.join(" "))
    }

    /// Cross-compile the extracted source into a wheel in `src_dist_dir`
    pub fn compile(&mut self, runner: &ShellRunner) -> Result<PathBuf> {
        let build = &self.recipe.build;
        let request = CrossBuildRequest {
            pkgname: &self.name,
            cflags: format!("{} {}", build.cflags, self.build_args.cflags),
            cxxflags: format!("{} {}", build.cxxflags, self.build_args.cxxflags),
            ldflags: format!("{} {}", build.ldflags, self.build_args.ldflags),
            target_install_dir: self.build_args.target_install_dir.clone(),
            exports: &build.exports,
            build_dir: &self.build_dir,
        };
        let config_settings = parse_backend_flags(&build.backend_flags.items());
        let mut env = self
            .backend
            .get_build_env(&runner.env, &request, &self.env)?;

        if let Some(cross_script) = &build.cross_script {
            let mut cross_runner = ShellRunner::new(env);
            cross_runner.run(
                Some(cross_script),
                "cross script",
                &self.src_extract_dir,
                &mut self.log,
            )?;
            env = cross_runner.env;
        }

        env.insert("PIP_CONSTRAINT".to_string(), self.create_constraints_file()?);

        let wheel = self.backend.build(
            &self.src_extract_dir,
            &self.src_dist_dir,
            &env,
            &config_settings,
            &mut self.log,
        )?;
        let wheel_name = wheel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        check_versions_match(&self.name, &wheel_name, &self.version)?;

        self.advance(BuildPhase::Compiled);
        Ok(wheel)
    }

    fn build_wheel_package(
        &mut self,
        runner: &mut ShellRunner,
        cpython_module: bool,
    ) -> Result<PathBuf> {
        if self.recipe.is_rust_package() {
            runner.run(
                Some(RUST_BUILD_PRELUDE),
                "rust build prelude",
                &self.src_extract_dir,
                &mut self.log,
            )?;
        }
        self.run_build_script(runner)?;

        let prebuilt_wheel = self
            .recipe
            .source
            .url
            .as_deref()
            .is_some_and(|u| u.ends_with(".whl"));
        if prebuilt_wheel {
            self.advance(BuildPhase::Compiled);
        } else {
            self.compile(runner)?;
        }

        let wheel = self.package_wheel(runner, cpython_module)?;

        copy_tree(&self.src_dist_dir, &self.dist_dir, |_, _| false)?;
        self.advance(BuildPhase::Installed);

        let file_name = wheel.file_name().map(Path::new).unwrap_or(&wheel);
        Ok(self.dist_dir.join(file_name))
    }

    /// Retag the built wheel and post-process its unpacked contents
    pub fn package_wheel(&mut self, runner: &mut ShellRunner, cpython_module: bool) -> Result<PathBuf> {
        let tags = pyodide_tags(&self.env)?;
        let candidates = list_artifacts(&self.src_dist_dir, "whl")?;
        let Some(mut wheel) = find_matching_wheel(candidates.iter(), &tags, Some(&self.version))?
        else {
            let names: Vec<String> = candidates
                .iter()
                .filter_map(|c| c.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            return Err(Error::WheelError(format!(
                "Found no wheel while building {}. Candidates:\n{}",
                self.name,
                names.join("\n")
            )));
        };

        let platform = self.env.wheel_platform()?;
        let wheel_file_name = wheel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if cpython_module {
            let abi = format!("cp{}{}", self.env.pymajor()?, self.env.pyminor()?);
            wheel = retag_wheel(&wheel, &platform, Some(&abi), Some(&abi))?;
        } else if wheel_file_name.contains("emscripten") {
            wheel = retag_wheel(&wheel, &platform, None, None)?;
        }

        info!("Unpacking wheel to {}", wheel.display());
        let parsed = WheelName::from_path(&wheel)?;
        let host_site_packages = Path::new(&self.build_args.host_install_dir)
            .join("lib")
            .join(format!("python{}", self.env.pyversion_major_minor()?))
            .join("site-packages");

        let build = &self.recipe.build;
        let log = &mut self.log;
        let backend = &self.backend;
        let env = &self.env;
        let lib_dir = &self.library_install_prefix;
        let original = wheel.clone();

        let wheel = modify_wheel(&wheel, |wheel_dir| {
            runner.run(build.post.as_deref(), "post script", wheel_dir, log)?;

            if build.vendor_sharedlib {
                backend.vendor_sharedlib(&original, wheel_dir, lib_dir, env, log)?;
            }

            if build.cross_build_env {
                install_into_host(&parsed, &host_site_packages, log)?;
            }

            for file in &build.cross_build_files {
                let to = host_site_packages.join(file);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(wheel_dir.join(file), &to)?;
            }
            Ok(())
        })?;

        self.advance(BuildPhase::Packaged);
        Ok(wheel)
    }

    fn build_shared_library(&mut self, runner: &mut ShellRunner) -> Result<PathBuf> {
        self.run_build_script(runner)?;
        self.advance(BuildPhase::Compiled);

        if self.dist_dir.exists() {
            fs::remove_dir_all(&self.dist_dir)?;
        }
        fs::create_dir_all(&self.dist_dir)?;
        let archive = self.dist_dir.join(format!("{}.zip", self.fullname));
        make_zip_archive(&archive, &self.src_dist_dir, self.env.zip_compression_level())?;
        self.advance(BuildPhase::Packaged);
        self.advance(BuildPhase::Installed);
        Ok(archive)
    }
}

/// Install a cross-build package into the host site-packages
///
/// The first pass upgrades the package itself without touching its
/// dependencies, whose cross-build files may already be in place. The second
/// pass adds any missing dependencies without upgrading them.
fn install_into_host(wheel: &WheelName, site_packages: &Path, log: &mut BuildLog) -> Result<()> {
    let requirement = format!("{}=={}", wheel.name, wheel.version);
    let passes: [&[&str]; 2] = [&["install", "--upgrade", "--no-deps", "-t"], &["install", "-t"]];

    for args in passes {
        let output = Command::new("pip")
            .args(args)
            .arg(site_packages)
            .arg(&requirement)
            .output()
            .map_err(|e| Error::io("Failed to run pip", e))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        log.step_output("pip install", &stdout, &stderr);
        if !output.status.success() {
            return Err(Error::CommandFailed {
                phase: format!("pip install {}", requirement),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConfigSettings;
    use crate::wheel::archive::tests::write_test_wheel;
    use super::archive::tests::serve;
    use std::sync::Mutex;

    /// Backend that drops a fixed wheel into the output directory
    struct FakeBackend {
        wheel_name: String,
        builds: Mutex<usize>,
    }

    impl BuildBackend for FakeBackend {
        fn get_build_env(
            &self,
            env: &BTreeMap<String, String>,
            _request: &CrossBuildRequest<'_>,
            _build_env: &BuildEnv,
        ) -> Result<BTreeMap<String, String>> {
            Ok(env.clone())
        }

        fn build(
            &self,
            _srcdir: &Path,
            outdir: &Path,
            env: &BTreeMap<String, String>,
            _config_settings: &ConfigSettings,
            _log: &mut BuildLog,
        ) -> Result<PathBuf> {
            *self.builds.lock().unwrap() += 1;
            assert!(env.contains_key("PIP_CONSTRAINT"));
            fs::create_dir_all(outdir).unwrap();
            Ok(write_test_wheel(outdir, &self.wheel_name, &[("demo/__init__.py", "")]))
        }

        fn vendor_sharedlib(
            &self,
            _wheel: &Path,
            _wheel_dir: &Path,
            _lib_dir: &Path,
            _build_env: &BuildEnv,
            _log: &mut BuildLog,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn test_env(root: &Path) -> Arc<BuildEnv> {
        Arc::new(BuildEnv::from_vars(
            root,
            [
                ("PYMAJOR", "3"),
                ("PYMINOR", "12"),
                ("PYODIDE_EMSCRIPTEN_VERSION", "3.1.58"),
                ("PYODIDE_ABI_VERSION", "2024_0"),
            ],
        ))
    }

    fn write_package(root: &Path, name: &str, build: &str, extra: &str) -> PathBuf {
        let pkg = root.join(name);
        fs::create_dir_all(pkg.join("src")).unwrap();
        fs::write(pkg.join("src/setup.py"), "").unwrap();
        fs::write(
            pkg.join("recipe.toml"),
            format!(
                "[package]\nname = \"{}\"\nversion = \"1.0\"\n{}\n[source]\npath = \"src\"\n[build]\n{}\n",
                name, extra, build
            ),
        )
        .unwrap();
        pkg
    }

    fn builder(pkg: &Path, env: Arc<BuildEnv>, wheel_name: &str, force: bool) -> RecipeBuilder {
        let backend = Arc::new(FakeBackend {
            wheel_name: wheel_name.to_string(),
            builds: Mutex::new(0),
        });
        RecipeBuilder::new(
            pkg,
            BuildArgs::default(),
            KitchenConfig {
                force_rebuild: force,
                ..Default::default()
            },
            env,
            backend,
        )
        .unwrap()
    }

    #[test]
    fn test_paths_and_helper_vars() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(dir.path(), "demo", "", "");
        let b = builder(&pkg, test_env(dir.path()), "demo-1.0-py3-none-any.whl", true);

        assert_eq!(b.build_dir, pkg.join("build"));
        assert_eq!(b.src_extract_dir, pkg.join("build/demo-1.0"));
        assert_eq!(b.src_dist_dir, pkg.join("build/demo-1.0/dist"));
        assert_eq!(b.library_install_prefix, dir.path().join(".libs"));

        let vars = b.helper_vars();
        assert_eq!(vars["PKG_VERSION"], "1.0");
        assert_eq!(vars["DISTDIR"], b.src_dist_dir.to_string_lossy());
        assert_eq!(vars["EM_PKG_CONFIG_PATH"], vars["PKG_CONFIG_LIBDIR"]);
    }

    #[test]
    fn test_build_dir_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(dir.path(), "demo", "", "");
        let result = RecipeBuilder::new(
            &pkg,
            BuildArgs::default(),
            KitchenConfig {
                build_dir: Some(dir.path().join("has space")),
                ..Default::default()
            },
            test_env(dir.path()),
            Arc::new(FakeBackend {
                wheel_name: String::new(),
                builds: Mutex::new(0),
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_build_wheel_package() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(
            dir.path(),
            "demo",
            "script = \"export FROM_SCRIPT=1\"\npost = \"touch post_ran\"",
            "",
        );
        let mut b = builder(&pkg, test_env(dir.path()), "demo-1.0-py3-none-any.whl", true);

        let result = b.build().unwrap();
        assert!(result.rebuilt);
        assert_eq!(result.phase, BuildPhase::Installed);
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact, pkg.join("dist/demo-1.0-py3-none-any.whl"));
        assert!(artifact.is_file());
        assert!(pkg.join("build.log").is_file());
        assert!(!pkg.join("build").join(PACKAGED_SENTINEL).exists());
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(dir.path(), "demo", "", "");
        let mut b = builder(&pkg, test_env(dir.path()), "demo-2.0-py3-none-any.whl", true);

        let err = b.build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Version mismatch in demo: version in meta.yaml is '1.0' but version from wheel name is '2.0'"
        );
        assert_eq!(b.phase(), BuildPhase::Failed);
    }

    fn write_url_package(root: &Path, name: &str, url: &str, sha256: Option<&str>) -> PathBuf {
        let pkg = root.join(name);
        fs::create_dir_all(&pkg).unwrap();
        let checksum = sha256
            .map(|c| format!("sha256 = \"{}\"\n", c))
            .unwrap_or_default();
        fs::write(
            pkg.join("recipe.toml"),
            format!(
                "[package]\nname = \"{}\"\nversion = \"1.0\"\n[source]\nurl = \"{}\"\n{}",
                name, url, checksum
            ),
        )
        .unwrap();
        pkg
    }

    #[test]
    fn test_prebuilt_wheel_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _) = serve(vec![(200, b"not really a wheel".to_vec())]);
        let url = format!("{}/demo-2.0-py3-none-any.whl", base);
        let pkg = write_url_package(dir.path(), "demo", &url, None);
        let mut b = builder(&pkg, test_env(dir.path()), "", true);

        let err = b.build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Version mismatch in demo: version in meta.yaml is '1.0' but version from wheel name is '2.0'"
        );
        assert_eq!(b.phase(), BuildPhase::Failed);
        assert!(!b.src_dist_dir.join("demo-2.0-py3-none-any.whl").exists());
    }

    #[test]
    fn test_checksum_mismatch_removes_download() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"tarball bytes".to_vec();
        let real = crate::hash::sha256_bytes(&body);
        let (base, _) = serve(vec![(200, body)]);
        let url = format!("{}/demo-1.0.tar.gz", base);
        let pkg = write_url_package(dir.path(), "demo", &url, Some("deadbeef"));
        let mut b = builder(&pkg, test_env(dir.path()), "", true);

        let err = b.build().unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Invalid sha256 checksum: {} != deadbeef (expected)", real)
        );
        assert!(!b.build_dir.join("demo-1.0.tar.gz").exists());
        assert!(!b.src_extract_dir.exists());
    }

    #[test]
    fn test_static_library_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(
            dir.path(),
            "libdemo",
            "type = \"static_library\"\nscript = \"touch built\"",
            "",
        );
        let mut b = builder(&pkg, test_env(dir.path()), "", false);
        let result = b.build().unwrap();
        assert!(result.rebuilt);
        assert!(result.artifact.is_none());
        assert!(pkg.join("build/libdemo-1.0/built").is_file());
        assert!(pkg.join("build").join(PACKAGED_SENTINEL).is_file());

        // nothing changed, so the second build is skipped
        let mut b = builder(&pkg, test_env(dir.path()), "", false);
        assert!(!b.build().unwrap().rebuilt);
    }

    #[test]
    fn test_shared_library_archive() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(
            dir.path(),
            "libshared",
            "type = \"shared_library\"\nscript = \"mkdir -p $DISTDIR && touch $DISTDIR/libshared.so\"",
            "",
        );
        let mut b = builder(&pkg, test_env(dir.path()), "", true);
        let result = b.build().unwrap();
        assert_eq!(result.artifact, Some(pkg.join("dist/libshared-1.0.zip")));
        assert!(pkg.join("dist/libshared-1.0.zip").is_file());
    }

    #[test]
    fn test_failed_script_reports() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(dir.path(), "broken", "type = \"static_library\"\nscript = \"exit 3\"", "");
        let mut b = builder(&pkg, test_env(dir.path()), "", true);
        let err = b.build().unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: Some(3), .. }));
        let log = fs::read_to_string(pkg.join("build.log")).unwrap();
        assert!(log.starts_with("["));
        assert!(log.lines().next().unwrap().ends_with("Building package broken..."));
        assert!(log.contains("ERROR: build script failed"));
        assert!(log.contains("Failed building package broken"));
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(
            dir.path(),
            "needs_exe",
            "",
            "[requirements]\nexecutable = [\"a-command-that-does-not-exist\"]",
        );
        let mut b = builder(&pkg, test_env(dir.path()), "", true);
        let err = b.build().unwrap_err();
        assert!(
            err.to_string()
                .ends_with("missing in the host system: a-command-that-does-not-exist")
        );
    }

    #[test]
    fn test_continue_requires_source() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(dir.path(), "demo", "", "");
        let mut b = RecipeBuilder::new(
            &pkg,
            BuildArgs::default(),
            KitchenConfig::interactive(None, false, true),
            test_env(dir.path()),
            Arc::new(FakeBackend {
                wheel_name: String::new(),
                builds: Mutex::new(0),
            }),
        )
        .unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().starts_with("Cannot find source for rebuild"));
    }

    #[test]
    fn test_constraints_file() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global-constraints.txt");
        let env = Arc::new(BuildEnv::from_vars(
            dir.path(),
            [("PIP_CONSTRAINT", global.to_string_lossy().into_owned())],
        ));
        let pkg = write_package(
            dir.path(),
            "pkg_test_constraint",
            "",
            "[requirements]\nconstraint = [\"numpy < 2.0\", \"pytest == 7.0\"]",
        );
        let b = builder(&pkg, env, "", true);
        fs::create_dir_all(&b.build_dir).unwrap();

        let files = b.create_constraints_file().unwrap();
        let paths: Vec<&str> = files.split(' ').collect();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], global.to_string_lossy());
        assert!(global.is_file());
        let local = fs::read_to_string(paths[1]).unwrap();
        assert_eq!(local, "numpy < 2.0\npytest == 7.0\n");
    }

    #[test]
    fn test_patch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("patched");
        fs::create_dir_all(pkg.join("extras")).unwrap();
        fs::write(pkg.join("extras/extra.py"), "x = 1\n").unwrap();
        fs::write(
            pkg.join("recipe.toml"),
            "[package]\nname = \"patched\"\nversion = \"1.0\"\n[source]\nurl = \"https://example.com/patched-1.0.tar.gz\"\nsha256 = \"0\"\nextras = [[\"extras/extra.py\", \"extra.py\"]]\n",
        )
        .unwrap();
        let mut b = builder(&pkg, test_env(dir.path()), "", true);
        fs::create_dir_all(&b.src_extract_dir).unwrap();

        b.patch().unwrap();
        let copied = b.src_extract_dir.join("extra.py");
        assert!(copied.is_file());
        assert!(b.src_extract_dir.join(PATCHED_SENTINEL).is_file());

        // the sentinel stops a second application
        fs::remove_file(&copied).unwrap();
        let mut b = builder(&pkg, test_env(dir.path()), "", true);
        b.patch().unwrap();
        assert!(!copied.exists());
    }
}
