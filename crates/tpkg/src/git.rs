//! Source-control transport capability
//!
//! The core never talks the git protocol itself. Embedders provide an
//! implementation of [`GitTransport`]; tests use a filesystem-backed fake.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::error::{Error, Result};

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The requested branch or tag does not exist in the remote.
    ///
    /// Reported distinctly so that registry sync can try the next default
    /// branch name.
    #[error("couldn't find remote ref '{0}'")]
    MissingRef(String),

    /// Any other clone/pull failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

impl TransportError {
    pub fn is_missing_ref(&self) -> bool {
        matches!(self, TransportError::MissingRef(_))
    }
}

/// Options for cloning a repository.
///
/// Order of preference for the checked-out revision: hash > branch > tag.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub url: String,
    pub hash: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub single_branch: bool,
    pub depth: Option<u32>,
    pub ssh_key_path: Option<PathBuf>,
}

/// Options for updating an existing clone.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub ssh_key_path: Option<PathBuf>,
}

/// The narrow interface the core needs from a source-control transport.
pub trait GitTransport {
    /// Clones the repository described by `options` into `dir`.
    /// Returns the checked-out commit hash.
    fn clone_repo(&self, dir: &Path, options: &CloneOptions)
        -> std::result::Result<String, TransportError>;

    /// Updates the existing clone at `dir`.
    fn pull(&self, dir: &Path, options: &PullOptions) -> std::result::Result<(), TransportError>;
}

/// Cooperative cancellation signal for long operations.
///
/// Clones share the same flag. Long operations poll the token at blocking
/// points; once cancelled they clean up partial state and return
/// [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every operation holding a clone of this
    /// token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
