//! Embedder configuration
//!
//! The persistent user configuration is owned by the embedder; the core
//! receives a typed [`Config`] at construction time and never reads
//! configuration from a global. [`Config::from_env`] builds the default
//! configuration from the environment variables the compiler also honors.

use std::env;
use std::path::PathBuf;

use crate::cache::Cache;
use crate::registry::RegistryConfigs;
use crate::semver::Version;

/// Paths where the compiler looks for cached packages.
pub const PACKAGE_CACHE_PATHS_ENV: &str = "TOIT_PACKAGE_CACHE_PATHS";
/// Paths where the compiler looks for cached registries.
pub const REGISTRY_CACHE_PATHS_ENV: &str = "TOIT_REGISTRY_CACHE_PATHS";
/// Where packages are installed for the project, overriding the default.
pub const PACKAGE_INSTALL_PATH_ENV: &str = "TOIT_PACKAGE_INSTALL_PATH";
/// Directory the user config is loaded from.
pub const USER_CONFIG_DIR_ENV: &str = "TOIT_USER_CONFIG_DIR";

const PACKAGE_CACHE_SUBDIR: &str = "tpkg";
const REGISTRY_CACHE_SUBDIR: &str = "tpkg-registries";

/// Typed configuration handed to the core by the embedder.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Locations where packages can be found.
    pub package_cache_paths: Vec<PathBuf>,
    /// Locations where registry checkouts can be found. The first one is
    /// where new registries are installed.
    pub registry_cache_paths: Vec<PathBuf>,
    /// Overrides the per-project `.packages` install directory.
    pub package_install_path: Option<PathBuf>,
    /// The version of the ambient SDK. When absent all packages are
    /// acceptable.
    pub sdk_version: Option<Version>,
    /// The registries to consult.
    pub registry_configs: RegistryConfigs,
    /// Whether registries are synced before each resolution.
    pub autosync: bool,
}

impl Config {
    /// Builds a configuration from the environment, with `dirs`-based
    /// defaults for the cache locations.
    pub fn from_env() -> Config {
        Config {
            package_cache_paths: paths_from_env(
                PACKAGE_CACHE_PATHS_ENV,
                PACKAGE_CACHE_SUBDIR,
            ),
            registry_cache_paths: paths_from_env(
                REGISTRY_CACHE_PATHS_ENV,
                REGISTRY_CACHE_SUBDIR,
            ),
            package_install_path: env::var_os(PACKAGE_INSTALL_PATH_ENV).map(PathBuf::from),
            sdk_version: None,
            registry_configs: RegistryConfigs::default(),
            autosync: true,
        }
    }

    /// The directory the user configuration lives in.
    pub fn user_config_dir() -> Option<PathBuf> {
        if let Some(dir) = env::var_os(USER_CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir));
        }
        dirs::config_dir().map(|dir| dir.join("toit"))
    }

    /// Builds the package cache described by this configuration.
    pub fn cache(&self) -> Cache {
        let registry_install = self
            .registry_cache_paths
            .first()
            .cloned()
            .unwrap_or_else(|| default_cache_path(REGISTRY_CACHE_SUBDIR));
        let mut cache = Cache::new(registry_install)
            .with_pkg_cache_paths(self.package_cache_paths.iter().cloned())
            .with_registry_cache_paths(self.registry_cache_paths.iter().skip(1).cloned());
        if let Some(install) = &self.package_install_path {
            cache = cache.with_pkg_install_path(install.clone());
        }
        cache
    }
}

fn default_cache_path(subdir: &str) -> PathBuf {
    let base = dirs::home_dir()
        .map(|home| home.join(".cache").join("toit"))
        .unwrap_or_else(|| PathBuf::from(".cache/toit"));
    base.join(subdir)
}

fn paths_from_env(env_name: &str, default_subdir: &str) -> Vec<PathBuf> {
    if let Some(value) = env::var_os(env_name) {
        let paths: Vec<PathBuf> = env::split_paths(&value).collect();
        if !paths.is_empty() {
            return paths;
        }
    }
    vec![default_cache_path(default_subdir)]
}
