//! Crate-wide error types using thiserror
//!
//! User-facing messages are routed through [`crate::ui::Ui`]; operations
//! that have already surfaced their message return
//! [`Error::AlreadyReported`] so callers can abort without printing twice.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::git::TransportError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Package-management error.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// YAML (de)serialization failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A version string did not parse.
    #[error("Invalid version: '{0}'")]
    MalformedVersion(String),

    /// A version-constraint string did not parse.
    #[error("Invalid constraint: '{0}'")]
    MalformedConstraint(String),

    /// An install was attempted under a prefix that is already taken.
    #[error("Project has already a package with prefix '{0}'")]
    DuplicatePrefix(String),

    /// The resolver exhausted the search space.
    #[error("Couldn't find a valid solution for the package constraints")]
    Unsolvable,

    /// A referenced package, path, or registry entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A short URL or name matched multiple packages.
    #[error("More than one matching package '{0}' found")]
    Ambiguous(String),

    /// A package directory is present but its spec file is missing.
    #[error("Missing spec file for package '{url}@{version}'")]
    MissingSpec { url: String, version: String },

    /// The inter-process sync lock could not be acquired in time.
    #[error("Unable to acquire sync lock '{}'", .0.display())]
    LockTimeout(PathBuf),

    /// The git transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation was cancelled by the embedder.
    #[error("Operation cancelled")]
    Cancelled,

    /// The error has already been surfaced through the UI.
    ///
    /// In case the error gets printed anyway we still have a sensible
    /// message instead of "already reported".
    #[error("package management error")]
    AlreadyReported,
}

impl Error {
    /// Whether this error has already been surfaced to the user.
    pub fn is_already_reported(&self) -> bool {
        matches!(self, Error::AlreadyReported)
    }
}
