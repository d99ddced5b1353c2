// src/error.rs

//! Error types shared across the recipe toolchain

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading, resolving, building or installing recipes
#[derive(Error, Debug)]
pub enum Error {
    /// Raw IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO failure with context already attached
    #[error("{0}")]
    IoError(String),

    /// Malformed descriptor, wheel name or flag value
    #[error("{0}")]
    ParseError(String),

    /// Something that should exist on disk does not
    #[error("{0}")]
    NotFound(String),

    /// Invalid or inconsistent configuration (recipe fields, selectors, build flags)
    #[error("{0}")]
    ConfigError(String),

    /// Dependency graph could not be resolved
    #[error("{0}")]
    ResolutionError(String),

    /// Source download failed
    #[error("{0}")]
    DownloadError(String),

    /// Downloaded file does not match its declared sha256
    #[error("Invalid sha256 checksum: {actual} != {expected} (expected)")]
    ChecksumMismatch { expected: String, actual: String },

    /// Declared version disagrees with the version encoded in a wheel name
    #[error(
        "Version mismatch in {name}: version in meta.yaml is '{declared}' but version from wheel name is '{actual}'"
    )]
    VersionMismatch {
        name: String,
        declared: String,
        actual: String,
    },

    /// Wheel lookup, retagging or repacking failed
    #[error("{0}")]
    WheelError(String),

    /// A shell step or external tool exited unsuccessfully
    #[error("{phase} failed with exit code {code:?}")]
    CommandFailed {
        phase: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A package build failed; carries the path of its build log
    #[error("Error building {package}. See {} for details.", log.display())]
    BuildFailed {
        package: String,
        log: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// A build worker panicked
    #[error("Build of {0} was interrupted")]
    Interrupted(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Zip archive error
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Wrap any displayable error as an IO error with context
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::IoError(format!("{}: {}", context, err))
    }
}
