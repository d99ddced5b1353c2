// tests/builder.rs

//! Single package builds that run real shell scripts.
//!
//! Only library recipes are built here; wheel builds need an emscripten
//! toolchain and are covered with a fake backend in the unit tests.

mod common;

use common::{copy_fixtures, test_env};
use pyodide_recipes::backend::{BuildBackend, PypaBuildBackend};
use pyodide_recipes::config::BuildArgs;
use pyodide_recipes::lockfile::Lockfile;
use pyodide_recipes::recipe::{BuildPhase, KitchenConfig, RecipeBuilder};
use pyodide_recipes::scheduler::{
    BuildStatus, RecipeRunner, SchedulerOptions, build_packages, install_packages,
};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use zip::ZipArchive;

fn backend() -> Arc<dyn BuildBackend> {
    Arc::new(PypaBuildBackend::default())
}

fn builder(recipe_dir: &Path, name: &str, build_root: &Path) -> RecipeBuilder {
    let env = Arc::new(test_env(recipe_dir.parent().unwrap()));
    RecipeBuilder::new(
        &recipe_dir.join(name),
        BuildArgs::default(),
        KitchenConfig::interactive(Some(build_root.join(name).join("build")), false, false),
        env,
        backend(),
    )
    .unwrap()
}

#[test]
fn test_static_library_build() {
    let (temp, recipe_dir) = copy_fixtures();
    let build_root = temp.path().join("build");

    let mut libtest = builder(&recipe_dir, "libtest", &build_root);
    let result = libtest.build().unwrap();
    assert!(result.rebuilt);
    assert!(result.artifact.is_none());
    assert_eq!(result.phase, BuildPhase::Compiled);

    assert!(build_root.join("libtest/build/.packaged").is_file());
    let installed = build_root.join(".libs/lib/libtest.a");
    assert_eq!(fs::read_to_string(installed).unwrap(), "static\n");

    let log = fs::read_to_string(recipe_dir.join("libtest/build.log")).unwrap();
    assert!(log.contains("Building package libtest..."));
    assert!(log.contains("Succeeded building package libtest in"));

    // Nothing changed since the sentinel was written
    let mut again = builder(&recipe_dir, "libtest", &build_root);
    assert!(!again.build().unwrap().rebuilt);
}

#[test]
fn test_shared_library_build() {
    let (temp, recipe_dir) = copy_fixtures();
    let build_root = temp.path().join("build");

    let mut shared = builder(&recipe_dir, "libtest_shared", &build_root);
    let result = shared.build().unwrap();
    let artifact = result.artifact.unwrap();
    assert_eq!(artifact, recipe_dir.join("libtest_shared/dist/libtest_shared-1.0.0.zip"));
    assert_eq!(result.phase, BuildPhase::Installed);

    let archive = ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
    assert!(archive.file_names().any(|n| n == "libtest_shared.so"));
}

#[test]
fn test_failing_script_marks_build_failed() {
    let (temp, recipe_dir) = copy_fixtures();
    fs::write(
        recipe_dir.join("libtest/recipe.toml"),
        "[package]\nname = \"libtest\"\nversion = \"1.0.0\"\n\n[source]\npath = \"src\"\n\n\
         [build]\ntype = \"static_library\"\nscript = \"echo about to fail; exit 3\"\n",
    )
    .unwrap();

    let mut libtest = builder(&recipe_dir, "libtest", &temp.path().join("build"));
    assert!(libtest.build().is_err());
    assert_eq!(libtest.phase(), BuildPhase::Failed);

    let log = fs::read_to_string(recipe_dir.join("libtest/build.log")).unwrap();
    assert!(log.contains("about to fail"));
    assert!(log.contains("Failed building package libtest in"));
}

#[test]
fn test_scheduled_library_builds_and_install() {
    let (temp, recipe_dir) = copy_fixtures();
    let env = Arc::new(test_env(temp.path()));
    let build_root = temp.path().join("build");

    let runner = Arc::new(RecipeRunner::new(Arc::clone(&env), backend()));
    let options = SchedulerOptions {
        n_jobs: 2,
        force_rebuild: false,
        skip_rust_setup: true,
        show_progress: false,
    };
    let (graph, report) = build_packages(
        &recipe_dir,
        &["libtest,libtest_shared".to_string()],
        runner,
        &BuildArgs::default(),
        &build_root,
        &env,
        &options,
    )
    .unwrap();
    assert_eq!(report.status("libtest"), Some(BuildStatus::Built));
    assert_eq!(report.status("libtest_shared"), Some(BuildStatus::Built));

    let dist = temp.path().join("dist");
    let lockfile = Lockfile::load(&install_packages(&graph, &dist, &env, 0, false).unwrap()).unwrap();
    assert_eq!(lockfile.packages.len(), 1);
    assert_eq!(lockfile.packages["libtest-shared"].file_name, "libtest_shared-1.0.0.zip");
    assert!(dist.join("libtest_shared-1.0.0.zip").is_file());
}
