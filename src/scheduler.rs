// src/scheduler.rs

//! Parallel build of a dependency graph
//!
//! The scheduler builds every package that needs it, at most `n_jobs` at a
//! time, starting a package only once all of its host dependencies are
//! built. Ready packages are taken in order of how many packages depend on
//! them so that long chains start early.
//!
//! # Failure handling
//!
//! The first failure stops dispatch. Packages already running are allowed
//! to finish, every transitive host dependent of the failed package is
//! marked [`BuildStatus::Skipped`], and the first error is returned once
//! the pool drains. Artifacts from independent subtrees stay on disk.
//!
//! # Rust packages
//!
//! Only one Rust package builds at a time since concurrent cargo builds
//! share the same toolchain directories. The toolchain itself is installed
//! before the pass when any Rust package needs building.

use crate::backend::BuildBackend;
use crate::config::{BuildArgs, BuildEnv};
use crate::error::{Error, Result};
use crate::lockfile::generate_lockfile;
use crate::progress::BuildProgress;
use crate::recipe::graph::{DependencyGraph, PackageNode, format_name_list, graph_for_query};
use crate::recipe::kitchen::{KitchenConfig, RecipeBuilder, download_source, unpack_archive};
use crate::wheel::{Tag, extract_wheel_metadata_file, pyodide_tags, repack_zip_archive};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

const RUST_TARGET: &str = "wasm32-unknown-emscripten";
const RUST_INSTALL_TOKEN: &str = "wasm32-unknown-emscripten_install-url.txt";

/// Per-package state within a build pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BuildStatus {
    /// Waiting for host dependencies, or never started because the pass failed
    Pending,
    Building,
    /// Built in this pass, or already up to date
    Built,
    Failed,
    /// Not attempted because a host dependency failed
    Skipped,
}

/// Builds one graph node
///
/// The scheduler calls this from worker threads.
pub trait PackageBuilder: Send + Sync {
    fn build_package(&self, node: &PackageNode, build_args: &BuildArgs, build_dir: &Path) -> Result<()>;
}

/// Builds packages in-process with [`RecipeBuilder`]
pub struct RecipeRunner {
    env: Arc<BuildEnv>,
    backend: Arc<dyn BuildBackend>,
}

impl RecipeRunner {
    pub fn new(env: Arc<BuildEnv>, backend: Arc<dyn BuildBackend>) -> Self {
        Self { env, backend }
    }
}

impl PackageBuilder for RecipeRunner {
    fn build_package(&self, node: &PackageNode, build_args: &BuildArgs, build_dir: &Path) -> Result<()> {
        let build = || -> Result<()> {
            // Either this package changed or one of its host dependencies
            // did, so the package's own timestamps are irrelevant
            let config = KitchenConfig::for_graph_node(node.build_path(build_dir));
            let mut builder = RecipeBuilder::new(
                &node.pkgdir,
                build_args.clone(),
                config,
                Arc::clone(&self.env),
                Arc::clone(&self.backend),
            )?;
            builder.build()?;
            Ok(())
        };

        build().map_err(|e| Error::BuildFailed {
            package: node.name.clone(),
            log: node.log_path(),
            source: Box::new(e),
        })
    }
}

/// Options for one build pass
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker count, at least one
    pub n_jobs: usize,
    /// Build every package regardless of timestamps
    pub force_rebuild: bool,
    /// Do not install the Rust toolchain before building Rust packages
    pub skip_rust_setup: bool,
    /// Draw progress bars on stderr
    pub show_progress: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            n_jobs: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            force_rebuild: false,
            skip_rust_setup: false,
            show_progress: false,
        }
    }
}

/// Outcome of a build pass
#[derive(Debug)]
pub struct BuildReport {
    /// Final status of every package in the graph
    pub statuses: BTreeMap<String, BuildStatus>,
    /// Packages that were up to date and not rebuilt
    pub already_built: BTreeSet<String>,
    /// Packages in the order they finished building
    pub completed: Vec<String>,
    /// First failure of the pass
    pub failure: Option<(String, Error)>,
}

impl BuildReport {
    pub fn status(&self, name: &str) -> Option<BuildStatus> {
        self.statuses.get(name).copied()
    }

    /// Names with the given status
    pub fn with_status(&self, status: BuildStatus) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Turn a failed pass into its first error
    pub fn into_result(mut self) -> Result<Self> {
        match self.failure.take() {
            Some((_, e)) => Err(e),
            None => Ok(self),
        }
    }
}

/// Packages whose sources changed, plus everything built on top of them
pub fn generate_needs_build_set(
    graph: &DependencyGraph,
    build_dir: &Path,
    tags: &[Tag],
) -> Result<BTreeSet<String>> {
    let mut needs_build = BTreeSet::new();
    for node in graph.nodes() {
        if needs_build.contains(&node.name) {
            continue;
        }
        if node.needs_rebuild(build_dir, tags)? {
            needs_build.insert(node.name.clone());
            needs_build.extend(graph.transitive_host_dependents(&node.name));
        }
    }
    Ok(needs_build)
}

/// Entry in the ready queue
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: usize,
    name: String,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // ties go to the alphabetically first name
            .then_with(|| other.name.cmp(&self.name))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Message from a worker to the coordinator
struct Finished {
    name: String,
    worker: usize,
    elapsed: Duration,
    outcome: Result<()>,
}

/// Build the packages of `graph` that need building
///
/// Returns the report even when a package failed; use
/// [`BuildReport::into_result`] or [`build_from_graph`] to get the error.
pub fn run_build_pass(
    graph: &DependencyGraph,
    builder: Arc<dyn PackageBuilder>,
    build_args: &BuildArgs,
    build_dir: &Path,
    env: &BuildEnv,
    options: &SchedulerOptions,
) -> Result<BuildReport> {
    // Cycles would leave packages waiting forever
    graph.build_order()?;

    let needs_build = if options.force_rebuild {
        graph.names().map(str::to_string).collect()
    } else {
        generate_needs_build_set(graph, build_dir, &pyodide_tags(env)?)?
    };
    let already_built: BTreeSet<String> = graph
        .names()
        .filter(|n| !needs_build.contains(*n))
        .map(str::to_string)
        .collect();

    let mut statuses: BTreeMap<String, BuildStatus> = graph
        .names()
        .map(|n| {
            let status = if needs_build.contains(n) {
                BuildStatus::Pending
            } else {
                BuildStatus::Built
            };
            (n.to_string(), status)
        })
        .collect();

    if !already_built.is_empty() {
        let names: Vec<&String> = already_built.iter().collect();
        info!(
            "The following packages are already built: {}",
            format_name_list(&names)
        );
    }
    if needs_build.is_empty() {
        info!("All packages already built. Quitting.");
        return Ok(BuildReport {
            statuses,
            already_built,
            completed: Vec::new(),
            failure: None,
        });
    }

    let names: Vec<&String> = needs_build.iter().collect();
    info!("Building the following packages: {}", format_name_list(&names));

    let needs_rust = needs_build
        .iter()
        .filter_map(|n| graph.get(n))
        .any(PackageNode::is_rust_package);
    if needs_rust && !options.skip_rust_setup {
        ensure_rust_toolchain(env)?;
    }

    let n_jobs = options.n_jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_jobs)
        .thread_name(|i| format!("build-worker-{}", i + 1))
        .build()
        .map_err(|e| Error::ConfigError(format!("Failed to create build worker pool: {}", e)))?;

    let progress = if options.show_progress {
        BuildProgress::new(needs_build.len())
    } else {
        BuildProgress::hidden(needs_build.len())
    };

    // Host dependencies still to be built, per package
    let mut unbuilt: BTreeMap<String, BTreeSet<String>> = needs_build
        .iter()
        .filter_map(|n| graph.get(n))
        .map(|node| {
            let deps = node
                .host_dependencies
                .iter()
                .filter(|d| needs_build.contains(*d))
                .cloned()
                .collect();
            (node.name.clone(), deps)
        })
        .collect();

    let priority = |name: &str| graph.get(name).map_or(0, |n| n.host_dependents.len());
    let mut ready: BinaryHeap<Ready> = unbuilt
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| Ready {
            priority: priority(name),
            name: name.clone(),
        })
        .collect();

    let (tx, rx) = mpsc::channel::<Finished>();
    let mut spinners = BTreeMap::new();
    let mut free_workers: Vec<usize> = (1..=n_jobs).rev().collect();
    let mut in_flight = 0usize;
    let mut rust_in_flight = false;
    let mut started = 0usize;
    let mut completed = Vec::new();
    let mut failure: Option<(String, Error)> = None;

    loop {
        if failure.is_none() {
            let mut deferred = Vec::new();
            while in_flight < n_jobs {
                let Some(next) = ready.pop() else { break };
                let Some(node) = graph.get(&next.name) else {
                    continue;
                };
                let is_rust = node.is_rust_package();
                if is_rust && rust_in_flight {
                    deferred.push(next);
                    continue;
                }
                rust_in_flight |= is_rust;

                let worker = free_workers.pop().unwrap_or(in_flight + 1);
                started += 1;
                in_flight += 1;
                statuses.insert(node.name.clone(), BuildStatus::Building);
                spinners.insert(
                    node.name.clone(),
                    progress.start_package(&node.name, started, worker),
                );
                debug!("[{}/{}] starting {}", started, needs_build.len(), node.name);

                let node = node.clone();
                let builder = Arc::clone(&builder);
                let build_args = build_args.clone();
                let build_dir = build_dir.to_path_buf();
                let tx = tx.clone();
                pool.spawn(move || {
                    let t0 = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        builder.build_package(&node, &build_args, &build_dir)
                    }))
                    .unwrap_or_else(|_| Err(Error::Interrupted(node.name.clone())));
                    // The coordinator only hangs up after every job reported
                    let _ = tx.send(Finished {
                        name: node.name,
                        worker,
                        elapsed: t0.elapsed(),
                        outcome,
                    });
                });
            }
            ready.extend(deferred);
        }

        if in_flight == 0 {
            break;
        }

        let finished = rx
            .recv()
            .map_err(|_| Error::Interrupted("build worker pool".to_string()))?;
        in_flight -= 1;
        free_workers.push(finished.worker);
        if graph
            .get(&finished.name)
            .is_some_and(PackageNode::is_rust_package)
        {
            rust_in_flight = false;
        }

        let success = finished.outcome.is_ok();
        if let Some(pb) = spinners.remove(&finished.name) {
            progress.finish_package(&pb, &finished.name, success, finished.elapsed);
        }

        match finished.outcome {
            Ok(()) => {
                statuses.insert(finished.name.clone(), BuildStatus::Built);
                let dependents = graph
                    .get(&finished.name)
                    .map(|n| n.host_dependents.clone())
                    .unwrap_or_default();
                for dependent in dependents {
                    let Some(deps) = unbuilt.get_mut(&dependent) else {
                        continue;
                    };
                    if deps.remove(&finished.name) && deps.is_empty() {
                        ready.push(Ready {
                            priority: priority(&dependent),
                            name: dependent,
                        });
                    }
                }
                completed.push(finished.name);
            }
            Err(e) => {
                error!("{}", e);
                statuses.insert(finished.name.clone(), BuildStatus::Failed);
                for dependent in graph.transitive_host_dependents(&finished.name) {
                    if statuses.get(&dependent) == Some(&BuildStatus::Pending) {
                        statuses.insert(dependent, BuildStatus::Skipped);
                    }
                }
                if failure.is_none() {
                    error!(
                        "Cancelling the build pass due to error building {}",
                        finished.name
                    );
                    failure = Some((finished.name, e));
                }
            }
        }
    }

    match &failure {
        Some((name, _)) => progress.abandon(&format!("Failed building {}", name)),
        None => progress.finish("All packages built"),
    }

    Ok(BuildReport {
        statuses,
        already_built,
        completed,
        failure,
    })
}

/// Build the packages of `graph`, failing with the first build error
pub fn build_from_graph(
    graph: &DependencyGraph,
    builder: Arc<dyn PackageBuilder>,
    build_args: &BuildArgs,
    build_dir: &Path,
    env: &BuildEnv,
    options: &SchedulerOptions,
) -> Result<BuildReport> {
    run_build_pass(graph, builder, build_args, build_dir, env, options)?.into_result()
}

/// Resolve `targets`, build the resulting graph and record artifact names
///
/// `targets` is a package query as taken by [`graph_for_query`].
pub fn build_packages(
    recipe_dir: &Path,
    targets: &[String],
    builder: Arc<dyn PackageBuilder>,
    build_args: &BuildArgs,
    build_dir: &Path,
    env: &BuildEnv,
    options: &SchedulerOptions,
) -> Result<(DependencyGraph, BuildReport)> {
    let mut graph = graph_for_query(recipe_dir, targets)?;

    let report = build_from_graph(&graph, builder, build_args, build_dir, env, options)?;

    let tags = pyodide_tags(env)?;
    for node in graph.nodes_mut() {
        if let Some(path) = node.dist_artifact_path(&tags)? {
            node.file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
        }
    }

    Ok((graph, report))
}

/// Copy each package's `build.log` to `<log_dir>/<name>.log`
pub fn copy_logs(graph: &DependencyGraph, log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    info!("Copying build logs to {}", log_dir.display());

    for node in graph.nodes() {
        let log = node.log_path();
        if log.exists() {
            fs::copy(&log, log_dir.join(format!("{}.log", node.name)))?;
        } else {
            warn!("Warning: {} has no build log", node.name);
        }
    }
    Ok(())
}

/// Copy built artifacts to `output_dir` and write `pyodide-lock.json`
///
/// Artifacts are recompressed at `compression_level`. With `metadata_files`
/// each wheel's METADATA is extracted next to it as `<wheel>.metadata`.
pub fn install_packages(
    graph: &DependencyGraph,
    output_dir: &Path,
    env: &BuildEnv,
    compression_level: i64,
    metadata_files: bool,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    info!("Copying built packages to {}", output_dir.display());

    let tags = pyodide_tags(env)?;
    for node in graph.nodes() {
        let Some(artifact) = node.dist_artifact_path(&tags)? else {
            continue;
        };
        let Some(file_name) = artifact.file_name() else {
            continue;
        };
        let dest = output_dir.join(file_name);
        fs::copy(&artifact, &dest)?;
        repack_zip_archive(&dest, compression_level)?;

        if metadata_files && artifact.extension().is_some_and(|e| e == "whl") {
            let metadata = output_dir.join(format!("{}.metadata", file_name.to_string_lossy()));
            extract_wheel_metadata_file(&artifact, &metadata)?;
        }
    }

    let lockfile_path = output_dir.join("pyodide-lock.json");
    info!("Writing pyodide-lock.json to {}", lockfile_path.display());
    let lockfile = generate_lockfile(output_dir, graph, env)?;
    lockfile.write(&lockfile_path)?;
    Ok(lockfile_path)
}

fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::io(format!("Failed to run {}", program), e))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let cmd = format!("{} {}", program, args.join(" "));
        error!("ERROR: command failed {}", cmd);
        return Err(Error::CommandFailed {
            phase: cmd,
            code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(stdout)
}

/// Install the Rust toolchain and the emscripten target
///
/// When `RUST_EMSCRIPTEN_TARGET_URL` is set, the stock target sysroot is
/// replaced by the archive at that URL. A token file records which URL is
/// installed so the download happens once.
pub fn ensure_rust_toolchain(env: &BuildEnv) -> Result<()> {
    let toolchain = env.get_build_flag("RUST_TOOLCHAIN")?;
    run_checked("rustup", &["toolchain", "install", toolchain])?;
    run_checked("rustup", &["default", toolchain])?;

    let url = env
        .vars()
        .get("RUST_EMSCRIPTEN_TARGET_URL")
        .map(|s| s.trim())
        .unwrap_or("");
    if url.is_empty() {
        run_checked(
            "rustup",
            &["target", "add", RUST_TARGET, "--toolchain", toolchain],
        )?;
        return Ok(());
    }

    let rustc = run_checked("rustup", &["which", "--toolchain", toolchain, "rustc"])?;
    let toolchain_root = Path::new(rustc.trim())
        .parent()
        .and_then(Path::parent)
        .ok_or_else(|| Error::NotFound(format!("Unexpected rustc location: {}", rustc.trim())))?;
    let rustlib = toolchain_root.join("lib/rustlib");
    let token = rustlib.join(RUST_INSTALL_TOKEN);
    if fs::read_to_string(&token).is_ok_and(|installed| installed == url) {
        return Ok(());
    }

    let target_dir = rustlib.join(RUST_TARGET);
    if target_dir.exists()
        && let Err(e) = fs::remove_dir_all(&target_dir)
    {
        warn!("Failed to remove {}: {}", target_dir.display(), e);
    }

    info!("Installing {} target from {}", RUST_TARGET, url);
    let scratch = tempfile::tempdir().map_err(|e| Error::io("Failed to create temp dir", e))?;
    let archive = download_source(url, scratch.path())?;
    unpack_archive(&archive, &rustlib)?;
    fs::write(&token, url)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::graph::generate_dependency_graph;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct Recorder {
        order: Mutex<Vec<String>>,
        fail: Option<&'static str>,
    }

    impl PackageBuilder for Recorder {
        fn build_package(&self, node: &PackageNode, _: &BuildArgs, _: &Path) -> Result<()> {
            self.order.lock().unwrap().push(node.name.clone());
            if self.fail == Some(node.name.as_str()) {
                return Err(Error::CommandFailed {
                    phase: "build script".to_string(),
                    code: Some(1),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            Ok(())
        }
    }

    fn write_recipe(root: &Path, name: &str, host: &[&str]) {
        let pkg = root.join(name);
        fs::create_dir_all(pkg.join("src")).unwrap();
        let host: Vec<String> = host.iter().map(|h| format!("\"{}\"", h)).collect();
        fs::write(
            pkg.join("recipe.toml"),
            format!(
                "[package]\nname = \"{}\"\nversion = \"1.0\"\n[source]\npath = \"src\"\n\
                 [build]\ntype = \"static_library\"\n[requirements]\nhost = [{}]\n",
                name,
                host.join(", ")
            ),
        )
        .unwrap();
    }

    /// a <- b <- c, and d standing alone
    fn chain(root: &Path) -> DependencyGraph {
        write_recipe(root, "a", &[]);
        write_recipe(root, "b", &["a"]);
        write_recipe(root, "c", &["b"]);
        write_recipe(root, "d", &[]);
        let requested = ["c", "d"].iter().map(|s| s.to_string()).collect();
        generate_dependency_graph(root, &requested, &BTreeSet::new()).unwrap()
    }

    fn env(root: &Path) -> BuildEnv {
        BuildEnv::from_vars(
            root,
            [
                ("PYMAJOR", "3"),
                ("PYMINOR", "12"),
                ("PYODIDE_EMSCRIPTEN_VERSION", "3.1.58"),
                ("PYODIDE_ABI_VERSION", "2024_0"),
            ],
        )
    }

    fn options(n_jobs: usize) -> SchedulerOptions {
        SchedulerOptions {
            n_jobs,
            force_rebuild: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_queue_prefers_more_dependents() {
        let mut heap = BinaryHeap::new();
        heap.push(Ready {
            priority: 0,
            name: "leaf".into(),
        });
        heap.push(Ready {
            priority: 3,
            name: "numpy".into(),
        });
        heap.push(Ready {
            priority: 0,
            name: "aaa".into(),
        });
        assert_eq!(heap.pop().unwrap().name, "numpy");
        assert_eq!(heap.pop().unwrap().name, "aaa");
    }

    #[test]
    fn test_force_rebuild_builds_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let graph = chain(dir.path());
        for n_jobs in [1, 4] {
            let recorder = Arc::new(Recorder {
                order: Mutex::new(Vec::new()),
                fail: None,
            });
            let report = build_from_graph(
                &graph,
                recorder.clone(),
                &BuildArgs::default(),
                &dir.path().join("build"),
                &env(dir.path()),
                &options(n_jobs),
            )
            .unwrap();

            let order = recorder.order.lock().unwrap().clone();
            assert_eq!(order.len(), 4);
            let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
            assert!(pos("a") < pos("b"));
            assert!(pos("b") < pos("c"));
            assert_eq!(report.with_status(BuildStatus::Built).len(), 4);
            let done = |n: &str| report.completed.iter().position(|o| o == n).unwrap();
            assert!(done("a") < done("b"));
        }
    }

    #[test]
    fn test_failure_skips_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let graph = chain(dir.path());
        let recorder = Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
            fail: Some("a"),
        });
        let report = run_build_pass(
            &graph,
            recorder.clone(),
            &BuildArgs::default(),
            &dir.path().join("build"),
            &env(dir.path()),
            &options(1),
        )
        .unwrap();

        assert_eq!(report.status("a"), Some(BuildStatus::Failed));
        assert_eq!(report.status("b"), Some(BuildStatus::Skipped));
        assert_eq!(report.status("c"), Some(BuildStatus::Skipped));
        let order = recorder.order.lock().unwrap().clone();
        assert!(!order.contains(&"b".to_string()));
        assert!(!order.contains(&"c".to_string()));
        assert!(matches!(
            report.into_result(),
            Err(Error::CommandFailed { code: Some(1), .. })
        ));
    }

    /// Builder that sleeps and records how many builds overlap
    #[derive(Default)]
    struct Timed {
        order: Mutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        rust_running: AtomicUsize,
        max_rust_running: AtomicUsize,
        fail: Option<&'static str>,
        slow: Option<&'static str>,
    }

    impl PackageBuilder for Timed {
        fn build_package(&self, node: &PackageNode, _: &BuildArgs, _: &Path) -> Result<()> {
            self.order.lock().unwrap().push(node.name.clone());
            if self.fail == Some(node.name.as_str()) {
                return Err(Error::Interrupted(node.name.clone()));
            }

            let running = self.running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.max_running.fetch_max(running, AtomicOrdering::SeqCst);
            if node.is_rust_package() {
                let rust = self.rust_running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                self.max_rust_running.fetch_max(rust, AtomicOrdering::SeqCst);
            }

            let pause = if self.slow == Some(node.name.as_str()) { 300 } else { 50 };
            std::thread::sleep(Duration::from_millis(pause));

            if node.is_rust_package() {
                self.rust_running.fetch_sub(1, AtomicOrdering::SeqCst);
            }
            self.running.fetch_sub(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_rust_packages_build_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plain_1", "plain_2", "rust_1", "rust_2", "rust_3"] {
            write_recipe(dir.path(), name, &[]);
        }
        let requested = ["plain_1", "plain_2", "rust_1", "rust_2", "rust_3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut graph = generate_dependency_graph(dir.path(), &requested, &BTreeSet::new()).unwrap();
        for name in ["rust_1", "rust_2", "rust_3"] {
            let node = graph.get_mut(name).unwrap();
            node.recipe.requirements.executable = vec!["cargo".to_string()];
            assert!(node.is_rust_package());
        }

        let timed = Arc::new(Timed::default());
        let report = build_from_graph(
            &graph,
            timed.clone(),
            &BuildArgs::default(),
            &dir.path().join("build"),
            &env(dir.path()),
            &SchedulerOptions {
                skip_rust_setup: true,
                ..options(4)
            },
        )
        .unwrap();

        assert_eq!(report.with_status(BuildStatus::Built).len(), 5);
        assert_eq!(timed.max_rust_running.load(AtomicOrdering::SeqCst), 1);
        assert!(timed.max_running.load(AtomicOrdering::SeqCst) > 1);
    }

    #[test]
    fn test_failure_drains_in_flight_builds() {
        let dir = tempfile::tempdir().unwrap();
        chain(dir.path());
        write_recipe(dir.path(), "e", &[]);
        let requested = ["c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let graph = generate_dependency_graph(dir.path(), &requested, &BTreeSet::new()).unwrap();

        let timed = Arc::new(Timed {
            fail: Some("a"),
            slow: Some("d"),
            ..Default::default()
        });
        let report = run_build_pass(
            &graph,
            timed.clone(),
            &BuildArgs::default(),
            &dir.path().join("build"),
            &env(dir.path()),
            &options(2),
        )
        .unwrap();

        // a and d start together; d is still running when a fails
        assert_eq!(report.status("a"), Some(BuildStatus::Failed));
        assert_eq!(report.status("d"), Some(BuildStatus::Built));
        assert_eq!(report.status("b"), Some(BuildStatus::Skipped));
        assert_eq!(report.status("c"), Some(BuildStatus::Skipped));
        assert_ne!(report.status("e"), Some(BuildStatus::Built));

        let mut order = timed.order.lock().unwrap().clone();
        order.sort();
        assert_eq!(order, vec!["a", "d"]);
        assert!(matches!(report.into_result(), Err(Error::Interrupted(name)) if name == "a"));
    }

    #[test]
    fn test_up_to_date_packages_are_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let graph = chain(dir.path());
        let build_dir = dir.path().join("build");
        for name in ["a", "b", "c", "d"] {
            let token = graph.get(name).unwrap().build_path(&build_dir);
            fs::create_dir_all(&token).unwrap();
            fs::write(token.join(crate::recipe::kitchen::PACKAGED_SENTINEL), "").unwrap();
        }
        let stale = graph.get("b").unwrap().build_path(&build_dir);
        fs::remove_file(stale.join(crate::recipe::kitchen::PACKAGED_SENTINEL)).unwrap();

        let needs = generate_needs_build_set(&graph, &build_dir, &[]).unwrap();
        let expected: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(needs, expected);

        let recorder = Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
            fail: None,
        });
        let report = build_from_graph(
            &graph,
            recorder.clone(),
            &BuildArgs::default(),
            &build_dir,
            &env(dir.path()),
            &SchedulerOptions {
                n_jobs: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(*recorder.order.lock().unwrap(), vec!["b", "c"]);
        assert!(report.already_built.contains("a"));
    }

    #[test]
    fn test_copy_logs() {
        let dir = tempfile::tempdir().unwrap();
        let graph = chain(dir.path());
        fs::write(dir.path().join("a/build.log"), "built a").unwrap();

        let logs = dir.path().join("logs");
        copy_logs(&graph, &logs).unwrap();
        assert_eq!(fs::read_to_string(logs.join("a.log")).unwrap(), "built a");
        assert!(!logs.join("b.log").exists());
    }
}
