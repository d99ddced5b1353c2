// src/recipe/format.rs

//! Recipe file format definitions
//!
//! Each package directory holds a `recipe.toml` describing where the source
//! comes from, how to build it and what it depends on. Section and key names
//! use kebab-case (`top-level`, `cross-build-env`, ...).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{AsRefStr, Display, EnumString};

/// File name of the descriptor inside each package directory
pub const RECIPE_FILE_NAME: &str = "recipe.toml";

/// Tag that pulls a recipe into every build that asks for it
pub const ALWAYS_TAG: &str = "always";

/// A complete recipe for building a package
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Package metadata
    pub package: PackageSection,

    /// Source location and modifications
    pub source: SourceSection,

    /// Build instructions
    #[serde(default)]
    pub build: BuildSection,

    /// Dependencies
    #[serde(default)]
    pub requirements: RequirementsSection,

    /// Import checks, consumed by the test runner
    #[serde(default)]
    pub test: TestSection,

    /// Free-form metadata, passed through untouched
    #[serde(default)]
    pub about: toml::Table,
}

impl Recipe {
    /// Whether the produced artifact is a wheel
    pub fn is_wheel(&self) -> bool {
        self.build.package_type.is_wheel()
    }

    /// Whether building needs a Rust toolchain
    pub fn is_rust_package(&self) -> bool {
        self.requirements
            .executable
            .iter()
            .any(|e| e == "rustup" || e == "cargo")
    }

    /// Whether the recipe carries `tag`
    pub fn has_tag(&self, tag: &str) -> bool {
        self.package.tag.iter().any(|t| t == tag)
    }

    /// `{name}-{version}`
    pub fn fullname(&self) -> String {
        format!("{}-{}", self.package.name, self.package.version)
    }
}

/// Package metadata section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PackageSection {
    /// Package name
    pub name: String,

    /// Package version
    pub version: String,

    /// Tags used by `tag:<name>` selectors
    #[serde(default)]
    pub tag: Vec<String>,

    /// Excluded from default builds unless requested by name
    #[serde(default)]
    pub disabled: bool,

    /// Not updated automatically
    #[serde(default)]
    pub pinned: bool,

    /// Import names recorded in the lockfile
    #[serde(default)]
    pub top_level: Vec<String>,
}

/// Source section: exactly one of `url` or `path`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SourceSection {
    /// Remote archive (or prebuilt wheel) URL, may contain `$(VAR)` references
    #[serde(default)]
    pub url: Option<String>,

    /// Local source tree, relative to the package directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Expected sha256 of the download
    #[serde(default)]
    pub sha256: Option<String>,

    /// Patch files applied in order with `patch -p1`
    #[serde(default)]
    pub patches: Vec<String>,

    /// Extra `[src, dst]` files copied into the source tree after patching
    #[serde(default)]
    pub extras: Vec<(String, String)>,

    /// Top-level directory inside the archive, if not `{name}-{version}`
    #[serde(default, rename = "extract_dir", alias = "extract-dir")]
    pub extract_dir: Option<String>,
}

/// Kind of artifact a recipe produces
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PackageType {
    #[default]
    Package,
    CpythonModule,
    StaticLibrary,
    SharedLibrary,
}

impl PackageType {
    /// Packages and CPython modules produce wheels
    pub fn is_wheel(&self) -> bool {
        matches!(self, Self::Package | Self::CpythonModule)
    }

    /// Directory the artifact is installed into at runtime
    pub fn install_dir(&self) -> &'static str {
        match self {
            Self::SharedLibrary => "dynlib",
            _ => "site",
        }
    }
}

/// Which symbols a side module exports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Exports {
    Mode(ExportsMode),
    Symbols(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportsMode {
    Pyinit,
    Requested,
    WholeArchive,
}

impl Default for Exports {
    fn default() -> Self {
        Self::Mode(ExportsMode::Pyinit)
    }
}

/// A value written either as one whitespace-separated string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl StringOrList {
    pub fn items(&self) -> Vec<String> {
        match self {
            Self::String(s) => s.split_whitespace().map(str::to_string).collect(),
            Self::List(items) => items.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

/// Build instructions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildSection {
    /// Artifact kind
    #[serde(default, rename = "type")]
    pub package_type: PackageType,

    /// Shell script run in the source tree before compiling
    #[serde(default)]
    pub script: Option<String>,

    /// Shell script run inside the unpacked wheel
    #[serde(default)]
    pub post: Option<String>,

    /// Shell script run before the cross build, with the cross env applied
    #[serde(default)]
    pub cross_script: Option<String>,

    #[serde(default)]
    pub cflags: String,

    #[serde(default)]
    pub cxxflags: String,

    #[serde(default)]
    pub ldflags: String,

    #[serde(default)]
    pub exports: Exports,

    /// `key=value` settings forwarded to the build backend
    #[serde(default)]
    pub backend_flags: StringOrList,

    /// Install into the host site-packages for use by later cross builds
    #[serde(default)]
    pub cross_build_env: bool,

    /// Files copied from the wheel into the host site-packages
    #[serde(default)]
    pub cross_build_files: Vec<String>,

    /// Bundle shared-library dependencies into the wheel
    #[serde(default)]
    pub vendor_sharedlib: bool,

    /// Move test suites into a separate `-tests.tar`
    #[serde(default = "default_true")]
    pub unvendor_tests: bool,

    /// Test file patterns kept in the wheel
    #[serde(default)]
    pub retain_test_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            package_type: PackageType::default(),
            script: None,
            post: None,
            cross_script: None,
            cflags: String::new(),
            cxxflags: String::new(),
            ldflags: String::new(),
            exports: Exports::default(),
            backend_flags: StringOrList::default(),
            cross_build_env: false,
            cross_build_files: Vec::new(),
            vendor_sharedlib: false,
            unvendor_tests: true,
            retain_test_patterns: Vec::new(),
        }
    }
}

/// Dependencies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RequirementsSection {
    /// Needed at runtime; does not gate build order
    #[serde(default)]
    pub run: Vec<String>,

    /// Must be built before this package
    #[serde(default)]
    pub host: Vec<String>,

    /// Executables that must exist on the build machine
    #[serde(default)]
    pub executable: Vec<String>,

    /// pip constraint lines for this package's build isolation
    #[serde(default)]
    pub constraint: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestSection {
    #[serde(default)]
    pub imports: Vec<String>,
}

/// Normalize a package name for comparisons
///
/// Lowercases and collapses runs of `-`, `_` and `.` into a single `-`.
pub fn canonicalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.extend(c.to_lowercase());
            in_sep = false;
        }
    }
    out
}
