// src/recipe/kitchen/config.rs

//! Configuration types for the recipe builder

use crate::recipe::format::PackageType;
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::{AsRefStr, Display};

/// Options for a single package build
#[derive(Debug, Clone, Default)]
pub struct KitchenConfig {
    /// Build directory, `<pkg_root>/build` when unset
    pub build_dir: Option<PathBuf>,
    /// Build even when nothing changed since the last build
    pub force_rebuild: bool,
    /// Reuse the existing source tree, skipping download and patching
    ///
    /// Implies `force_rebuild`.
    pub continue_build: bool,
    /// Mirror build output at `info` level instead of `debug`
    ///
    /// Enabled for single-package builds, disabled inside parallel passes
    /// where interleaved output is unreadable.
    pub echo_log: bool,
}

impl KitchenConfig {
    /// Configuration used by the scheduler for one node of a parallel pass
    pub fn for_graph_node(build_dir: PathBuf) -> Self {
        Self {
            build_dir: Some(build_dir),
            force_rebuild: true,
            continue_build: false,
            echo_log: false,
        }
    }

    /// Configuration for building one package from the command line
    pub fn interactive(build_dir: Option<PathBuf>, force_rebuild: bool, continue_build: bool) -> Self {
        Self {
            build_dir,
            force_rebuild: force_rebuild || continue_build,
            continue_build,
            echo_log: true,
        }
    }
}

/// Build pipeline states
///
/// `Failed` is absorbing and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BuildPhase {
    Unstarted,
    SourcePrepared,
    Patched,
    Compiled,
    Packaged,
    Installed,
    Failed,
}

impl BuildPhase {
    /// Whether the pipeline may move from `self` to `next`
    pub fn can_advance_to(self, next: BuildPhase) -> bool {
        use BuildPhase::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Unstarted, SourcePrepared)
            | (SourcePrepared, Patched)
            | (Patched, Compiled)
            | (Compiled, Packaged)
            | (Packaged, Installed) => true,
            // A continued build resumes from an existing patched tree
            (Unstarted, Patched) => true,
            _ => false,
        }
    }
}

/// Variant driver selected from the recipe's package type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildVariant {
    /// `package` and `cpython_module`: full pipeline producing a wheel
    Wheel { cpython_module: bool },
    /// Build script only, completion marked by the `.packaged` sentinel
    StaticLibrary,
    /// Build script, then the shared objects are zipped into `dist/`
    SharedLibrary,
}

impl From<PackageType> for BuildVariant {
    fn from(package_type: PackageType) -> Self {
        match package_type {
            PackageType::Package => Self::Wheel {
                cpython_module: false,
            },
            PackageType::CpythonModule => Self::Wheel {
                cpython_module: true,
            },
            PackageType::StaticLibrary => Self::StaticLibrary,
            PackageType::SharedLibrary => Self::SharedLibrary,
        }
    }
}

/// Outcome of [`super::RecipeBuilder::build`]
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Final phase reached
    pub phase: BuildPhase,
    /// False when the package was up to date and nothing ran
    pub rebuilt: bool,
    pub elapsed: Duration,
    /// Artifact copied into `<pkg_root>/dist`, if the variant produces one
    pub artifact: Option<PathBuf>,
}
