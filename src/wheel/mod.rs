// src/wheel/mod.rs

//! Wheel naming, compatibility tags and archive manipulation
//!
//! Wheel file names follow
//! `{name}-{version}(-{build})?-{python}-{abi}-{platform}.whl`, where each
//! of the last three components may be a `.`-separated set (compressed tag
//! set). A wheel matches an interpreter when any of its expanded tags is in
//! the interpreter's supported tag list.

pub mod archive;
pub mod unvendor;

pub use archive::{
    extract_wheel_metadata_file, make_zip_archive, modify_wheel, pack_wheel,
    parse_top_level_import_name, repack_zip_archive, retag_wheel, unpack_wheel, unpack_zip_archive,
};
pub use unvendor::{unvendor_tests, unvendor_tests_in_wheel};

use crate::config::BuildEnv;
use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// A single (interpreter, abi, platform) compatibility triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub interpreter: String,
    pub abi: String,
    pub platform: String,
}

impl Tag {
    pub fn new(
        interpreter: impl Into<String>,
        abi: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            abi: abi.into(),
            platform: platform.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.interpreter, self.abi, self.platform)
    }
}

/// Parsed wheel file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelName {
    pub name: String,
    pub version: String,
    pub build: Option<String>,
    pub python_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl WheelName {
    /// Parse a wheel file name (not a path)
    pub fn parse(filename: &str) -> Result<Self> {
        let stem = filename.strip_suffix(".whl").ok_or_else(|| {
            Error::ParseError(format!("Invalid wheel filename (extension must be '.whl'): {}", filename))
        })?;

        let parts: Vec<&str> = stem.split('-').collect();
        let (name, version, build, py, abi, plat) = match parts.as_slice() {
            [name, version, py, abi, plat] => (*name, *version, None, *py, *abi, *plat),
            [name, version, build, py, abi, plat] => {
                if !build.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(Error::ParseError(format!(
                        "Invalid build number: {} in '{}'",
                        build, filename
                    )));
                }
                (*name, *version, Some(build.to_string()), *py, *abi, *plat)
            }
            _ => {
                return Err(Error::ParseError(format!(
                    "Invalid wheel filename (wrong number of parts): {}",
                    filename
                )));
            }
        };

        if name.is_empty() || version.is_empty() {
            return Err(Error::ParseError(format!("Invalid wheel filename: {}", filename)));
        }

        let split = |s: &str| s.split('.').map(str::to_string).collect::<Vec<_>>();
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            build,
            python_tags: split(py),
            abi_tags: split(abi),
            platform_tags: split(plat),
        })
    }

    /// Parse the file name component of a wheel path
    pub fn from_path(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::ParseError(format!("Invalid wheel path: {}", path.display())))?;
        Self::parse(filename)
    }

    /// Expanded tag set (cartesian product of the compressed components)
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags = Vec::new();
        for py in &self.python_tags {
            for abi in &self.abi_tags {
                for plat in &self.platform_tags {
                    tags.push(Tag::new(py.as_str(), abi.as_str(), plat.as_str()));
                }
            }
        }
        tags
    }

    /// Render back into a file name
    pub fn filename(&self) -> String {
        let mut out = format!("{}-{}", self.name, self.version);
        if let Some(build) = &self.build {
            out.push('-');
            out.push_str(build);
        }
        out.push_str(&format!(
            "-{}-{}-{}.whl",
            self.python_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join(".")
        ));
        out
    }
}

/// Python tags in the order pip's `packaging` generates them for `py` wheels:
/// `pyXY`, `pyX`, then `pyX(Y-1)` down to `pyX0`
fn py_interpreter_range(major: u32, minor: u32) -> Vec<String> {
    let mut out = vec![format!("py{}{}", major, minor), format!("py{}", major)];
    for m in (0..minor).rev() {
        out.push(format!("py{}{}", major, m));
    }
    out
}

/// Supported tags for the target interpreter, most specific first
pub fn compute_tags(major: u32, minor: u32, platforms: &[String]) -> Vec<Tag> {
    let interpreter = format!("cp{}{}", major, minor);
    let mut tags = Vec::new();

    for plat in platforms {
        tags.push(Tag::new(&interpreter, &interpreter, plat));
    }
    for plat in platforms {
        tags.push(Tag::new(&interpreter, "abi3", plat));
    }
    for plat in platforms {
        tags.push(Tag::new(&interpreter, "none", plat));
    }
    // abi3 wheels built for older minors remain loadable
    for m in (2..minor).rev() {
        for plat in platforms {
            tags.push(Tag::new(format!("cp{}{}", major, m), "abi3", plat));
        }
    }

    let py_range = py_interpreter_range(major, minor);
    for version in &py_range {
        for plat in platforms {
            tags.push(Tag::new(version, "none", plat));
        }
    }
    for version in &py_range {
        tags.push(Tag::new(version, "none", "any"));
    }

    tags.push(Tag::new(&interpreter, "none", "any"));
    tags
}

/// Supported tags for the interpreter described by the build environment
pub fn pyodide_tags(env: &BuildEnv) -> Result<Vec<Tag>> {
    let platforms = [env.platform()?, env.wheel_platform()?];
    Ok(compute_tags(env.pymajor()?, env.pyminor()?, &platforms))
}

/// Find the single wheel among `paths` matching `tags` (and `version` if given)
///
/// Returns `Ok(None)` when nothing matches; more than one match is an error.
pub fn find_matching_wheel<I, P>(paths: I, tags: &[Tag], version: Option<&str>) -> Result<Option<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut matches = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let Ok(wheel) = WheelName::from_path(path) else {
            continue;
        };
        if let Some(v) = version
            && wheel.version != v
        {
            continue;
        }
        let wheel_tags = wheel.tags();
        if tags.iter().any(|t| wheel_tags.contains(t)) {
            matches.push(path.to_path_buf());
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => {
            let names: Vec<String> = matches
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            Err(Error::WheelError(format!(
                "Found multiple matching wheels:\n{}",
                names.join("\n")
            )))
        }
    }
}

/// Files directly inside `dir` ending in `.{extension}`, sorted by name
///
/// A missing directory yields an empty list.
pub fn list_artifacts(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == extension) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Fail when the version encoded in `wheel_name` differs from the declared one
pub fn check_versions_match(pkg_name: &str, wheel_name: &str, version: &str) -> Result<()> {
    let wheel = WheelName::parse(wheel_name)?;
    if wheel.version != version {
        return Err(Error::VersionMismatch {
            name: pkg_name.to_string(),
            declared: version.to_string(),
            actual: wheel.version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platforms() -> Vec<String> {
        vec![
            "emscripten_3_1_58_wasm32".to_string(),
            "pyodide_2025_0_wasm32".to_string(),
        ]
    }

    #[test]
    fn test_parse_wheel_name() {
        let w = WheelName::parse("numpy-1.26.4-cp312-cp312-pyodide_2025_0_wasm32.whl").unwrap();
        assert_eq!(w.name, "numpy");
        assert_eq!(w.version, "1.26.4");
        assert!(w.build.is_none());
        assert_eq!(w.tags().len(), 1);
    }

    #[test]
    fn test_parse_compressed_tags_and_build() {
        let w = WheelName::parse("six-1.16.0-1-py2.py3-none-any.whl").unwrap();
        assert_eq!(w.build.as_deref(), Some("1"));
        assert_eq!(
            w.tags(),
            vec![Tag::new("py2", "none", "any"), Tag::new("py3", "none", "any")]
        );
        assert_eq!(w.filename(), "six-1.16.0-1-py2.py3-none-any.whl");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(WheelName::parse("foo-1.0.tar.gz").is_err());
        assert!(WheelName::parse("foo-1.0-py3.whl").is_err());
        assert!(WheelName::parse("foo-1.0-x1-py3-none-any.whl").is_err());
    }

    #[test]
    fn test_compute_tags_order() {
        let tags = compute_tags(3, 12, &platforms());
        assert_eq!(tags[0].to_string(), "cp312-cp312-emscripten_3_1_58_wasm32");
        assert_eq!(tags[1].to_string(), "cp312-cp312-pyodide_2025_0_wasm32");
        assert_eq!(tags[2].to_string(), "cp312-abi3-emscripten_3_1_58_wasm32");
        assert!(tags.contains(&Tag::new("cp311", "abi3", "pyodide_2025_0_wasm32")));
        assert!(tags.contains(&Tag::new("py3", "none", "any")));
        assert!(!tags.contains(&Tag::new("cp313", "abi3", "pyodide_2025_0_wasm32")));
        assert_eq!(tags.last().unwrap().to_string(), "cp312-none-any");
    }

    #[test]
    fn test_find_matching_wheel() {
        let tags = compute_tags(3, 12, &platforms());
        let paths = [
            "pkg-1.0-cp312-cp312-pyodide_2025_0_wasm32.whl",
            "pkg-1.0-cp311-cp311-manylinux_2_17_x86_64.whl",
            "pkg-1.0.tar.gz",
        ];
        let found = find_matching_wheel(paths, &tags, Some("1.0")).unwrap();
        assert_eq!(found, Some(PathBuf::from(paths[0])));

        assert_eq!(find_matching_wheel(paths, &tags, Some("2.0")).unwrap(), None);
    }

    #[test]
    fn test_find_matching_wheel_ambiguous() {
        let tags = compute_tags(3, 12, &platforms());
        let paths = [
            "pkg-1.0-cp312-cp312-pyodide_2025_0_wasm32.whl",
            "pkg-1.0-py3-none-any.whl",
        ];
        let err = find_matching_wheel(paths, &tags, None).unwrap_err();
        assert!(err.to_string().starts_with("Found multiple matching wheels:\n"));
    }

    #[test]
    fn test_wheel_with_several_matching_tags_is_one_match() {
        let tags = compute_tags(3, 12, &platforms());
        let paths = ["pkg-1.0-py2.py3-none-any.whl"];
        assert!(find_matching_wheel(paths, &tags, None).unwrap().is_some());
    }

    #[test]
    fn test_check_versions_match() {
        check_versions_match("black", "black-22.8.0-py3-none-any.whl", "22.8.0").unwrap();
        let err =
            check_versions_match("black", "black-22.8.0-py3-none-any.whl", "0.0.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Version mismatch in black: version in meta.yaml is '0.0.1' but version from wheel name is '22.8.0'"
        );
    }
}
