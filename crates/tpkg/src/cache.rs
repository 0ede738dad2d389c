//! Package cache
//!
//! Keeps track of where downloaded packages and registry checkouts live,
//! and how to compute paths for them. The cache is a list of directories
//! searched in order; the project's install directory always comes first.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::path::UriPath;
use crate::ui::Ui;
use crate::{DEFAULT_SPEC_NAME, PROJECT_PACKAGES_PATH};

/// Relative path of the package `url`/`version` below a cache root.
pub fn url_version_to_rel_path(url: &str, version: &str) -> PathBuf {
    UriPath::from_url(url).to_file_path().join(version)
}

fn url_to_rel_path(url: &str) -> PathBuf {
    UriPath::from_url(url).to_file_path()
}

/// Locations of package and registry caches.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// Overrides the project install directory when set.
    install_pkg_path: Option<PathBuf>,
    /// Additional locations where packages can be found.
    pkg_cache_paths: Vec<PathBuf>,
    /// Locations where registry checkouts can be found. The first one is
    /// where new registries are installed.
    registry_cache_paths: Vec<PathBuf>,
}

impl Cache {
    /// Creates a cache that installs registries into `registry_path`.
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Cache {
            install_pkg_path: None,
            pkg_cache_paths: Vec::new(),
            registry_cache_paths: vec![registry_path.into()],
        }
    }

    /// Adds locations where packages can be found.
    pub fn with_pkg_cache_paths(
        mut self,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        self.pkg_cache_paths.extend(paths);
        self
    }

    /// Adds locations where registry checkouts can be found.
    pub fn with_registry_cache_paths(
        mut self,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        self.registry_cache_paths.extend(paths);
        self
    }

    /// Overrides the directory new packages are installed into.
    pub fn with_pkg_install_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_pkg_path = Some(path.into());
        self
    }

    fn find(&self, rel: &Path, roots: &[PathBuf], ui: &dyn Ui) -> Result<Option<PathBuf>> {
        for root in roots {
            let candidate = root.join(rel);
            match fs::metadata(&candidate) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
                Ok(metadata) if !metadata.is_dir() => {
                    return Err(ui.report_error(&format!(
                        "Path {} exists but is not a directory",
                        candidate.display()
                    )));
                }
                Ok(_) => return Ok(Some(candidate)),
            }
        }
        Ok(None)
    }

    /// Searches for the sources of `url`/`version`.
    pub fn find_pkg(
        &self,
        project_root: &Path,
        url: &str,
        version: &str,
        ui: &dyn Ui,
    ) -> Result<Option<PathBuf>> {
        let rel = url_version_to_rel_path(url, version);
        let mut roots = vec![self.pkg_install_path(project_root)];
        roots.extend(self.pkg_cache_paths.iter().cloned());
        self.find(&rel, &roots, ui)
    }

    /// Searches for the checkout of the registry with the given URL.
    pub fn find_registry(&self, url: &str, ui: &dyn Ui) -> Result<Option<PathBuf>> {
        self.find(&url_to_rel_path(url), &self.registry_cache_paths, ui)
    }

    /// Path to the spec file of the package `url`/`version`.
    ///
    /// Returns `Ok(None)` when the package isn't cached; fails with
    /// [`Error::MissingSpec`] when the package directory is present but
    /// the spec file inside it is not.
    pub fn spec_path_for(
        &self,
        project_root: &Path,
        url: &str,
        version: &str,
        ui: &dyn Ui,
    ) -> Result<Option<PathBuf>> {
        let Some(pkg_path) = self.find_pkg(project_root, url, version, ui)? else {
            return Ok(None);
        };
        let spec_path = pkg_path.join(DEFAULT_SPEC_NAME);
        if !spec_path.is_file() {
            return Err(Error::MissingSpec {
                url: url.to_string(),
                version: version.to_string(),
            });
        }
        Ok(Some(spec_path))
    }

    /// The directory a fresh download of `url`/`version` should go into.
    pub fn preferred_pkg_path(&self, project_root: &Path, url: &str, version: &str) -> PathBuf {
        self.pkg_install_path(project_root)
            .join(url_version_to_rel_path(url, version))
    }

    /// The directory packages are installed into for this project.
    pub fn pkg_install_path(&self, project_root: &Path) -> PathBuf {
        match &self.install_pkg_path {
            Some(path) => path.clone(),
            None => project_root.join(PROJECT_PACKAGES_PATH),
        }
    }

    /// The directory a fresh checkout of the given registry should go into.
    pub fn preferred_registry_path(&self, url: &str) -> PathBuf {
        self.registry_cache_paths[0].join(url_to_rel_path(url))
    }

    /// Creates the package install dir and deposits a README marking it as
    /// managed by the package manager.
    pub fn create_packages_cache_dir(&self, project_root: &Path, ui: &dyn Ui) -> Result<()> {
        let packages_cache_dir = self.pkg_install_path(project_root);
        match fs::metadata(&packages_cache_dir) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(ui.report_error(&format!(
                    "Package cache path already exists but is not a directory: '{}'",
                    packages_cache_dir.display()
                )));
            }
            Ok(_) => return Ok(()),
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
            Err(_) => {}
        }
        debug!(dir = %packages_cache_dir.display(), "creating package cache directory");
        fs::create_dir_all(&packages_cache_dir)?;
        fs::write(packages_cache_dir.join("README.md"), README_CONTENT)?;
        Ok(())
    }
}

const README_CONTENT: &str = "\
# Package Cache Directory

This directory contains packages that have been downloaded by
the package management system.

Generally, the package manager is able to download these packages again. It
is thus safe to remove the content of this directory.
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NullUi;

    #[test]
    fn test_rel_path_escapes_url() {
        let rel = url_version_to_rel_path("github.com/foo/bar", "1.0.0");
        assert_eq!(rel, PathBuf::from("github.com/foo/bar/1.0.0"));
    }

    #[test]
    fn test_find_pkg_prefers_install_dir() {
        let ui = NullUi;
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("project");
        let shared = tmp.path().join("shared");
        let rel = url_version_to_rel_path("github.com/foo/bar", "1.0.0");
        fs::create_dir_all(project.join(PROJECT_PACKAGES_PATH).join(&rel)).unwrap();
        fs::create_dir_all(shared.join(&rel)).unwrap();

        let cache = Cache::new(tmp.path().join("registries"))
            .with_pkg_cache_paths([shared.clone()]);
        let found = cache
            .find_pkg(&project, "github.com/foo/bar", "1.0.0", &ui)
            .unwrap()
            .unwrap();
        assert!(found.starts_with(project.join(PROJECT_PACKAGES_PATH)));

        // Without a project copy the shared root is used.
        let found = cache
            .find_pkg(&tmp.path().join("other"), "github.com/foo/bar", "1.0.0", &ui)
            .unwrap()
            .unwrap();
        assert!(found.starts_with(&shared));
    }

    #[test]
    fn test_find_pkg_missing() {
        let ui = NullUi;
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path().join("registries"));
        let found = cache
            .find_pkg(tmp.path(), "github.com/foo/bar", "1.0.0", &ui)
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_spec_path_for_missing_spec() {
        let ui = NullUi;
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path();
        let rel = url_version_to_rel_path("github.com/foo/bar", "1.0.0");
        fs::create_dir_all(project.join(PROJECT_PACKAGES_PATH).join(&rel)).unwrap();

        let cache = Cache::new(tmp.path().join("registries"));
        let result = cache.spec_path_for(project, "github.com/foo/bar", "1.0.0", &ui);
        assert!(matches!(result, Err(Error::MissingSpec { .. })));
    }

    #[test]
    fn test_create_packages_cache_dir_writes_readme() {
        let ui = NullUi;
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path().join("registries"));
        cache.create_packages_cache_dir(tmp.path(), &ui).unwrap();
        let readme = tmp.path().join(PROJECT_PACKAGES_PATH).join("README.md");
        assert!(readme.is_file());

        // A second call is a no-op.
        cache.create_packages_cache_dir(tmp.path(), &ui).unwrap();
    }

    #[test]
    fn test_install_path_override() {
        let tmp = tempfile::tempdir().unwrap();
        let override_path = tmp.path().join("elsewhere");
        let cache =
            Cache::new(tmp.path().join("registries")).with_pkg_install_path(override_path.clone());
        assert_eq!(cache.pkg_install_path(tmp.path()), override_path);
        assert!(cache
            .preferred_pkg_path(tmp.path(), "github.com/foo/bar", "1.0.0")
            .starts_with(&override_path));
    }
}
