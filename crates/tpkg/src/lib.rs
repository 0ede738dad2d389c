//! Toit package management core
//!
//! This crate provides the package-management machinery that sits between a
//! project's declared dependencies and the compiler, including:
//! - Spec (`package.yaml`) and lock (`package.lock`) models
//! - Semver version parsing and constraint matching
//! - Dependency resolution with backtracking
//! - Registries of package descriptions (local directories or git clones)
//! - The content-addressed package cache and download machinery
//! - The project manager composing install/uninstall/update/clean
//!
//! The command-line front-end, persistent user configuration, and the git
//! transport itself are intentionally not part of this crate; embedders
//! provide them through the narrow interfaces defined here ([`ui::Ui`],
//! [`git::GitTransport`], [`config::Config`]).

pub mod cache;
pub mod config;
pub mod desc;
pub mod error;
pub mod fetch;
pub mod git;
pub mod lockfile;
pub mod manager;
pub mod path;
pub mod registry;
pub mod semver;
pub mod solver;
pub mod spec;
pub mod ui;

pub use cache::Cache;
pub use config::Config;
pub use desc::Desc;
pub use error::{Error, Result};
pub use git::{Cancellation, CloneOptions, GitTransport, PullOptions, TransportError};
pub use lockfile::{LockFile, PackageEntry, PrefixMap};
pub use manager::{Manager, ProjectPaths, ProjectPkgManager};
pub use registry::{Registries, Registry, RegistryConfig, RegistryConfigs, RegistryKind};
pub use semver::{Constraint, Version};
pub use solver::{Solution, Solver, SolverDep};
pub use spec::{Spec, SpecPackage};
pub use ui::Ui;

/// Directory, relative to the project root, into which packages are
/// downloaded.
pub const PROJECT_PACKAGES_PATH: &str = ".packages";

/// File name of the user-authored project spec.
pub const DEFAULT_SPEC_NAME: &str = "package.yaml";

/// File name of the tool-authored lock file.
pub const DEFAULT_LOCK_FILE_NAME: &str = "package.lock";

/// Directory inside registries where descriptions are stored.
pub const PACKAGE_DESCRIPTION_DIR: &str = "packages";

/// File name of description files inside registries.
pub const DESCRIPTION_FILE_NAME: &str = "desc.yaml";
