// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn packages_arg(help: &'static str) -> Arg {
    Arg::new("packages")
        .required(true)
        .num_args(1..)
        .help(help)
}

fn recipe_dir_arg() -> Arg {
    Arg::new("recipe_dir")
        .long("recipe-dir")
        .value_name("DIR")
        .help("The directory containing the recipes. Default: <root>/packages")
}

fn build_dir_arg() -> Arg {
    Arg::new("build_dir")
        .long("build-dir")
        .value_name("DIR")
        .env("PYODIDE_RECIPE_BUILD_DIR")
        .help("The directory where package build directories are created. Default: recipe dir")
}

fn flag(long: &'static str, help: &'static str) -> Arg {
    Arg::new(long)
        .long(long)
        .action(ArgAction::SetTrue)
        .help(help)
}

/// Compiler flags shared by both build commands
fn build_flag_args() -> Vec<Arg> {
    vec![
        Arg::new("cflags")
            .long("cflags")
            .allow_hyphen_values(true)
            .help("Extra compiling flags. Default: SIDE_MODULE_CFLAGS"),
        Arg::new("cxxflags")
            .long("cxxflags")
            .allow_hyphen_values(true)
            .help("Extra compiling flags. Default: SIDE_MODULE_CXXFLAGS"),
        Arg::new("ldflags")
            .long("ldflags")
            .allow_hyphen_values(true)
            .help("Extra linking flags. Default: SIDE_MODULE_LDFLAGS"),
        Arg::new("target_install_dir")
            .long("target-install-dir")
            .help("The path to the target Python installation. Default: TARGETINSTALLDIR"),
        Arg::new("host_install_dir")
            .long("host-install-dir")
            .help("Directory for installing built host packages. Default: HOSTINSTALLDIR"),
    ]
}

fn build_cli() -> Command {
    Command::new("pyodide-recipes")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Pyodide Recipes Contributors")
        .about("Build WebAssembly Python packages from recipes")
        .subcommand_required(true)
        .subcommand(
            Command::new("build-recipes")
                .about("Build packages and their dependencies")
                .arg(packages_arg("Packages to build, or * for all packages"))
                .arg(recipe_dir_arg())
                .arg(build_dir_arg())
                .args(build_flag_args())
                .arg(flag("install", "Install the built packages into the install directory"))
                .arg(
                    Arg::new("install_dir")
                        .long("install-dir")
                        .help("Where to install packages and pyodide-lock.json. Default: <root>/dist"),
                )
                .arg(flag("metadata-files", "Extract each wheel's METADATA to a *.whl.metadata file"))
                .arg(Arg::new("log_dir").long("log-dir").help("Directory to place log files"))
                .arg(flag("force-rebuild", "Rebuild all packages"))
                .arg(
                    Arg::new("n_jobs")
                        .long("n-jobs")
                        .help("Number of packages to build in parallel. Default: number of cores"),
                )
                .arg(
                    Arg::new("compression_level")
                        .long("compression-level")
                        .default_value("6")
                        .env("PYODIDE_ZIP_COMPRESSION_LEVEL")
                        .help("Zip compression level applied when installing"),
                )
                .arg(flag("skip-rust-setup", "Don't set up the Rust toolchain")),
        )
        .subcommand(
            Command::new("build-recipes-no-deps")
                .about("Build packages without resolving dependencies")
                .arg(packages_arg("Packages to build"))
                .arg(recipe_dir_arg())
                .arg(build_dir_arg())
                .args(build_flag_args())
                .arg(flag("force-rebuild", "Rebuild even when nothing changed"))
                .arg(
                    Arg::new("continue")
                        .long("continue")
                        .action(ArgAction::SetTrue)
                        .help("Continue a build from the middle. Implies --force-rebuild"),
                )
                .arg(flag("skip-rust-setup", "Don't set up the Rust toolchain")),
        )
        .subcommand(
            Command::new("graph")
                .about("Show the resolved dependency graph")
                .arg(packages_arg("Packages to resolve"))
                .arg(recipe_dir_arg()),
        )
        .subcommand(
            Command::new("clean-recipes")
                .about("Remove build artifacts for recipe packages")
                .arg(
                    Arg::new("targets")
                        .num_args(0..)
                        .help("Packages or tags (tag:<name>) to clean"),
                )
                .arg(recipe_dir_arg())
                .arg(build_dir_arg())
                .arg(flag("include-dist", "Also remove dist directories"))
                .arg(Arg::new("install_dir").long("install-dir").help("Where packages were installed"))
                .arg(flag("include-always-tag", "Also clean packages tagged always")),
        )
        .subcommand(
            Command::new("unisolated")
                .about("List packages that install into the host environment")
                .arg(recipe_dir_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("pyodide-recipes.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
