//! Project package management
//!
//! The manager composes registries, the package cache, the resolver, and
//! the git transport into the user-visible operations: install,
//! uninstall, update, clean, and downloading the packages of a lock file.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::fetch::{download_package, DownloadOptions};
use crate::git::{Cancellation, GitTransport};
use crate::lockfile::LockFile;
use crate::registry::Registries;
use crate::semver::{sdk_constraint_to_min_sdk, Version};
use crate::solver::{Solution, Solver, SolverDep};
use crate::spec::{is_valid_name, Spec};
use crate::ui::Ui;
use crate::{DEFAULT_LOCK_FILE_NAME, DEFAULT_SPEC_NAME};

/// The files that define a project.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    /// Project root.
    pub project_root: PathBuf,

    /// The lock file of the project.
    pub lock_file: PathBuf,

    /// The spec file of the project.
    pub spec_file: PathBuf,
}

impl ProjectPaths {
    /// Builds project paths for an explicit project root, or discovers
    /// the root starting from the current working directory.
    ///
    /// Explicit `lock_path`/`spec_path` values win over the derived ones.
    pub fn new(
        project_root: Option<&Path>,
        lock_path: Option<PathBuf>,
        spec_path: Option<PathBuf>,
    ) -> Result<ProjectPaths> {
        match project_root {
            Some(root) => Ok(ProjectPaths {
                project_root: root.to_path_buf(),
                lock_file: lock_path.unwrap_or_else(|| root.join(DEFAULT_LOCK_FILE_NAME)),
                spec_file: spec_path.unwrap_or_else(|| root.join(DEFAULT_SPEC_NAME)),
            }),
            None => {
                let cwd = env::current_dir()?;
                Ok(Self::discover(&cwd, lock_path, spec_path))
            }
        }
    }

    /// Ascends from `start_dir` until a directory containing a lock or
    /// spec file is found. Without a hit the start directory is used.
    pub fn discover(
        start_dir: &Path,
        lock_path: Option<PathBuf>,
        spec_path: Option<PathBuf>,
    ) -> ProjectPaths {
        let mut dir = start_dir.to_path_buf();
        loop {
            if dir.join(DEFAULT_LOCK_FILE_NAME).is_file() || dir.join(DEFAULT_SPEC_NAME).is_file()
            {
                break;
            }
            match dir.parent() {
                Some(parent) if !parent.as_os_str().is_empty() && parent != dir => {
                    dir = parent.to_path_buf();
                }
                _ => {
                    dir = start_dir.to_path_buf();
                    break;
                }
            }
        }
        ProjectPaths {
            lock_file: lock_path.unwrap_or_else(|| dir.join(DEFAULT_LOCK_FILE_NAME)),
            spec_file: spec_path.unwrap_or_else(|| dir.join(DEFAULT_SPEC_NAME)),
            project_root: dir,
        }
    }
}

/// Entry point for all package-management operations that don't need a
/// project.
pub struct Manager {
    /// The loaded registries.
    registries: Registries,

    /// The package cache.
    cache: Cache,

    /// The version of the current SDK, used to filter acceptable
    /// packages. When absent all packages are acceptable.
    sdk_version: Option<Version>,

    /// The source-control transport.
    transport: Box<dyn GitTransport>,

    /// Cancellation signal for long operations.
    cancellation: Cancellation,

    /// Where user-facing messages go.
    ui: Arc<dyn Ui>,
}

impl Manager {
    pub fn new(
        registries: Registries,
        cache: Cache,
        sdk_version: Option<Version>,
        transport: Box<dyn GitTransport>,
        cancellation: Cancellation,
        ui: Arc<dyn Ui>,
    ) -> Manager {
        Manager {
            registries,
            cache,
            sdk_version,
            transport,
            cancellation,
            ui,
        }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }
}

/// A package that should be installed, as identified from a user-supplied
/// name or URL.
#[derive(Debug, Clone)]
struct PkgInstallRequest {
    name: String,
    url: String,
    major: u64,
    constraint: String,
}

/// A package manager bound to a specific project.
pub struct ProjectPkgManager {
    manager: Manager,

    /// The project-relevant paths.
    pub paths: ProjectPaths,
}

impl ProjectPkgManager {
    pub fn new(manager: Manager, paths: ProjectPaths) -> ProjectPkgManager {
        ProjectPkgManager { manager, paths }
    }

    fn ui(&self) -> &dyn Ui {
        self.manager.ui.as_ref()
    }

    /// Fetches `url`/`version` unless it is already in the cache.
    fn download_pkg(&self, url: &str, version: &str, hash: &str) -> Result<()> {
        let manager = &self.manager;
        let project_root = &self.paths.project_root;
        if manager
            .cache
            .find_pkg(project_root, url, version, self.ui())?
            .is_some()
        {
            return Ok(());
        }
        manager
            .cache
            .create_packages_cache_dir(project_root, self.ui())?;
        let directory = manager.cache.preferred_pkg_path(project_root, url, version);
        download_package(
            manager.transport.as_ref(),
            &manager.cancellation,
            self.ui(),
            DownloadOptions {
                directory: &directory,
                url,
                version,
                hash: if hash.is_empty() { None } else { Some(hash) },
                no_read_only: false,
            },
        )?;
        Ok(())
    }

    /// Fetches every remote package of the lock file and checks that
    /// every local entry points at a directory.
    fn download_lock_file_packages(&self, lock: &LockFile) -> Result<()> {
        let mut encountered_error = false;
        for (pkg_id, entry) in &lock.packages {
            if !entry.is_local() {
                self.download_pkg(&entry.url.to_url(), &entry.version, &entry.hash)?;
                continue;
            }
            let local = entry.path.to_file_path();
            if !local.is_dir() {
                self.ui().error(&format!(
                    "Target of '{}' not a directory: '{}'",
                    pkg_id,
                    local.display()
                ));
                encountered_error = true;
            }
        }
        if encountered_error {
            return Err(Error::AlreadyReported);
        }
        Ok(())
    }

    /// Finds the package to install for a user-supplied identifier.
    ///
    /// The identifier is a (suffix of a) package URL or a package name,
    /// optionally followed by `@` and a version.
    fn identify_install_url(&self, pkg_name: &str) -> Result<PkgInstallRequest> {
        if pkg_name.is_empty() {
            return Err(self.ui().report_error("Missing package name"));
        }

        let (pkg_name, version_str) = match pkg_name.rfind('@') {
            Some(position) if position > 0 => {
                (&pkg_name[..position], Some(&pkg_name[position + 1..]))
            }
            _ => (pkg_name, None),
        };

        let constraint = match version_str {
            Some("") => {
                return Err(self
                    .ui()
                    .report_error(&format!("Missing version after '@' in '{pkg_name}@'")));
            }
            Some(version) => Some(crate::semver::Constraint::parse(version).map_err(|_| {
                self.ui().report_error(&format!("Invalid version: '{version}'"))
            })?),
            None => None,
        };

        let registries = &self.manager.registries;
        // Always search for shortened URLs; plain names additionally
        // match package names.
        let mut found = registries.search_short_url(pkg_name);
        if !pkg_name.contains('/') {
            found.extend(registries.match_name(pkg_name));
        }
        if found.is_empty() {
            return Err(self
                .ui()
                .report_error(&format!("Package '{pkg_name}' not found")));
        }

        let url_candidates: HashSet<&str> = found.iter().map(|desc| desc.url.as_str()).collect();
        let mut url = found[0].url.clone();
        if url_candidates.len() > 1 {
            // If one candidate matches the identifier as a full URL it
            // wins; a URL could end with another package's full URL, for
            // example attack.com/github.com/real_package.
            match found.iter().find(|desc| desc.url == pkg_name) {
                Some(full_match) => url = full_match.url.clone(),
                None => {
                    return Err(self.ui().report(Error::Ambiguous(pkg_name.to_string())));
                }
            }
        }

        let mut max_version: Option<Version> = None;
        let mut name = String::new();
        for desc in registries.search_url(&url) {
            let version = Version::parse(&desc.version)?;
            if let Some(constraint) = &constraint {
                if !constraint.matches(&version) {
                    continue;
                }
            }
            if max_version.as_ref().map_or(true, |max| version > *max) {
                name = desc.name.clone();
                max_version = Some(version);
            }
        }

        let Some(max_version) = max_version else {
            return Err(self.ui().report_error(&format!(
                "No package '{pkg_name}' with version {} found",
                version_str.unwrap_or_default()
            )));
        };

        Ok(PkgInstallRequest {
            url,
            major: max_version.major(),
            name,
            constraint: constraint.map(|c| c.to_string()).unwrap_or_default(),
        })
    }

    /// Reads spec and lock file, whichever exist.
    ///
    /// When both exist, lock prefixes that are absent from the spec are
    /// an error; the user must reconcile first so an outdated spec
    /// doesn't silently discard the lock file. Without a spec file one is
    /// derived from the lock file.
    fn read_spec_and_lock(&self) -> Result<(Spec, Option<LockFile>)> {
        let lock_exists = self.paths.lock_file.is_file();
        let spec_exists = self.paths.spec_file.is_file();

        let spec = if spec_exists {
            Some(Spec::read_file(&self.paths.spec_file, self.ui())?)
        } else {
            None
        };
        let lock = if lock_exists {
            Some(LockFile::read_file(&self.paths.lock_file, self.ui())?)
        } else {
            None
        };

        if let (Some(spec), Some(lock)) = (&spec, &lock) {
            let missing: Vec<&str> = lock
                .prefixes
                .keys()
                .filter(|prefix| !spec.deps.contains_key(*prefix))
                .map(String::as_str)
                .collect();
            if missing.len() == 1 {
                return Err(self.ui().report_error(&format!(
                    "Lock file has prefix that isn't in {}: '{}'",
                    DEFAULT_SPEC_NAME, missing[0]
                )));
            } else if missing.len() > 1 {
                return Err(self.ui().report_error(&format!(
                    "Lock file has prefixes that aren't in {}: {}",
                    DEFAULT_SPEC_NAME,
                    missing.join(", ")
                )));
            }
        }

        let spec = match spec {
            Some(spec) => spec,
            None => match &lock {
                Some(lock) => Spec::from_lock_file(lock)?,
                None => Spec::new(&self.paths.spec_file),
            },
        };
        Ok((spec, lock))
    }

    fn write_spec_and_lock(&self, spec: &Spec, lock: &LockFile) -> Result<()> {
        spec.write_to_file()?;
        lock.write_to_file()
    }

    fn find_solution(
        &self,
        min_sdk_constraint: &str,
        solver_deps: Vec<SolverDep>,
        old_lock: Option<&LockFile>,
        unpreferred: Option<&(String, String)>,
    ) -> Result<Option<Solution>> {
        let manager = &self.manager;
        let mut solver = Solver::new(
            &manager.registries,
            manager.sdk_version.clone(),
            manager.ui.as_ref(),
        )?;
        if let Some(lock) = old_lock {
            let mut preferred = Vec::new();
            for entry in lock.packages.values() {
                if entry.url.is_empty() {
                    continue;
                }
                let url = entry.url.to_url();
                if let Some((unpreferred_url, unpreferred_version)) = unpreferred {
                    if *unpreferred_url == url && *unpreferred_version == entry.version {
                        continue;
                    }
                }
                preferred.push((url, entry.version.clone()));
            }
            solver.set_preferred(&preferred);
        }
        let min_sdk = sdk_constraint_to_min_sdk(min_sdk_constraint)?;
        Ok(solver.solve(min_sdk, solver_deps))
    }

    /// Downloads all packages of the given solution.
    fn download_solution(&self, solution: &Solution) -> Result<()> {
        for (url, version) in solution.packages() {
            let version = version.to_string();
            // Without a hash in the registries we just use "".
            let hash = self
                .manager
                .registries
                .hash_for(url, &version)
                .unwrap_or_default();
            self.download_pkg(url, &version, &hash)?;
        }
        Ok(())
    }

    /// Resolves the spec (preferring versions of the old lock file),
    /// downloads the solution, and builds the updated lock file.
    ///
    /// The downloaded packages are needed: their spec files provide the
    /// prefixes of the lock-file entries.
    fn solve_and_download(&self, spec: &Spec, old_lock: Option<&LockFile>) -> Result<LockFile> {
        let solver_deps = spec.build_solver_deps(self.ui())?;
        let solution = self
            .find_solution(&spec.environment.sdk, solver_deps, old_lock, None)?
            .ok_or_else(|| self.ui().report(Error::Unsolvable))?;
        self.download_solution(&solution)?;
        spec.build_lock_file(&solution, &self.manager.cache, &self.manager.registries, self.ui())
    }

    /// Downloads all dependencies.
    ///
    /// When the lock file is current (same SDK, no local dependencies)
    /// and `force_recompute` is unset, the packages are fetched straight
    /// from the lock file. Otherwise the dependencies are re-resolved,
    /// preferring the locked versions, and only the lock file is
    /// rewritten; the spec is untouched, which also avoids read/write
    /// contention on specs reached through local paths.
    pub fn install(&self, force_recompute: bool) -> Result<()> {
        let (spec, lock) = self.read_spec_and_lock()?;

        let needs_to_solve = force_recompute
            || match &lock {
                None => true,
                Some(lock) => {
                    spec.environment.sdk != lock.sdk
                        || lock.packages.values().any(|entry| entry.is_local())
                }
            };

        if !needs_to_solve {
            return self.download_lock_file_packages(lock.as_ref().unwrap());
        }

        let updated_lock = self.solve_and_download(&spec, lock.as_ref())?;
        updated_lock.write_to_file()
    }

    /// Fetches every remote package of the current lock file and checks
    /// local entries.
    pub fn download(&self) -> Result<()> {
        let (_spec, lock) = self.read_spec_and_lock()?;
        match lock {
            Some(lock) => self.download_lock_file_packages(&lock),
            None => Ok(()),
        }
    }

    /// Installs the package identified by `id` (a URL, URL suffix, or
    /// package name, optionally `@version`).
    ///
    /// The prefix defaults to the package's registry name. Returns the
    /// used prefix and the `url@version` string of the installed package.
    pub fn install_url_pkg(&self, name: Option<&str>, id: &str) -> Result<(String, String)> {
        let name_is_inferred = name.is_none();
        let install_pkg = self.identify_install_url(id)?;
        let mut name = name.unwrap_or(&install_pkg.name).to_string();
        if !is_valid_name(&name) {
            return Err(self.ui().report_error(&format!("Invalid name: '{name}'")));
        }

        let (mut spec, lock) = self.read_spec_and_lock()?;
        if spec.deps.contains_key(&name) {
            return Err(self.ui().report(Error::DuplicatePrefix(name)));
        }

        // Build the solver deps first and append the new dependency; its
        // exact version and name aren't known yet.
        let mut solver_deps = spec.build_solver_deps(self.ui())?;
        solver_deps.push(SolverDep::new(
            install_pkg.url.clone(),
            &install_pkg.constraint,
        )?);

        // If the lock file already contains an entry of this url-major,
        // unprefer it so the solver can pick the latest one.
        let mut unpreferred = None;
        if let Some(lock) = &lock {
            for entry in lock.packages.values() {
                if entry.url.to_url() == install_pkg.url {
                    let version = Version::parse(&entry.version)?;
                    if version.major() == install_pkg.major {
                        unpreferred = Some((install_pkg.url.clone(), entry.version.clone()));
                        break;
                    }
                }
            }
        }

        let solution = self
            .find_solution(
                &spec.environment.sdk,
                solver_deps,
                lock.as_ref(),
                unpreferred.as_ref(),
            )?
            .ok_or_else(|| self.ui().report(Error::Unsolvable))?;

        let solved_version = solution
            .version_for(&install_pkg.url, &install_pkg.constraint)?
            .clone();

        if name_is_inferred {
            // Packages might change their name between versions; the
            // description of the solved version wins.
            let descs = self
                .manager
                .registries
                .search_url_version(&install_pkg.url, &solved_version.to_string());
            let desc = descs.first().ok_or_else(|| {
                Error::NotFound(format!(
                    "couldn't find package '{}-{}' in registries",
                    install_pkg.url, solved_version
                ))
            })?;
            if desc.name != name {
                self.ui().info(&format!(
                    "Package '{}' has different names with different versions ('{}', '{}')",
                    install_pkg.url, name, desc.name
                ));
                name = desc.name.clone();
            }
        }

        // The recorded constraint accepts semver-compatible upgrades of
        // the installed version.
        let version_constraint = format!("^{solved_version}");
        spec.add_dep(&name, &install_pkg.url, &version_constraint, None, self.ui())?;

        self.download_solution(&solution)?;
        let updated_lock = spec.build_lock_file(
            &solution,
            &self.manager.cache,
            &self.manager.registries,
            self.ui(),
        )?;
        self.write_spec_and_lock(&spec, &updated_lock)?;

        let installed = format!("{}@{}", install_pkg.url, solved_version);
        Ok((name, installed))
    }

    /// Installs the local package at `path`. Without an explicit prefix
    /// the name from the target's spec file is used. Returns the used
    /// prefix.
    pub fn install_local_pkg(&self, name: Option<&str>, path: &Path) -> Result<String> {
        let abs = std::path::absolute(path)?;
        if !abs.is_dir() {
            if !abs.exists() {
                return Err(self
                    .ui()
                    .report_error(&format!("Target '{}' does not exist", path.display())));
            }
            return Err(self
                .ui()
                .report_error(&format!("Target '{}' is not a directory", path.display())));
        }

        let name = match name {
            Some(name) => {
                if !is_valid_name(name) {
                    return Err(self.ui().report_error(&format!("Invalid name: '{name}'")));
                }
                name.to_string()
            }
            None => {
                let target_spec = abs.join(DEFAULT_SPEC_NAME);
                if !target_spec.is_file() {
                    return Err(self.ui().report_error(&format!(
                        "Missing '{}' in '{}'",
                        DEFAULT_SPEC_NAME,
                        path.display()
                    )));
                }
                let spec = Spec::read_file(&target_spec, self.ui()).map_err(|err| {
                    if err.is_already_reported() {
                        err
                    } else {
                        self.ui().report_error(&format!(
                            "Cannot read '{}' at '{}': {}",
                            DEFAULT_SPEC_NAME,
                            path.display(),
                            err
                        ))
                    }
                })?;
                if spec.name.is_empty() {
                    return Err(self.ui().report_error(&format!(
                        "Missing name in '{}' of package at '{}'",
                        DEFAULT_SPEC_NAME,
                        path.display()
                    )));
                }
                if !is_valid_name(&spec.name) {
                    return Err(self.ui().report_error(&format!(
                        "Invalid name '{}' in '{}' file at '{}'",
                        spec.name,
                        DEFAULT_SPEC_NAME,
                        path.display()
                    )));
                }
                spec.name
            }
        };

        let (mut spec, lock) = self.read_spec_and_lock()?;
        if spec.deps.contains_key(&name) {
            return Err(self.ui().report(Error::DuplicatePrefix(name)));
        }

        // Add the local dependency before building the solver deps so its
        // own remote dependencies participate in the resolution.
        spec.add_dep(&name, "", "", Some(path), self.ui())?;

        let solver_deps = spec.build_solver_deps(self.ui())?;
        let solution = self
            .find_solution(&spec.environment.sdk, solver_deps, lock.as_ref(), None)?
            .ok_or_else(|| self.ui().report(Error::Unsolvable))?;
        self.download_solution(&solution)?;
        let updated_lock = spec.build_lock_file(
            &solution,
            &self.manager.cache,
            &self.manager.registries,
            self.ui(),
        )?;
        self.write_spec_and_lock(&spec, &updated_lock)?;
        Ok(name)
    }

    /// Removes the dependency under `prefix` and re-resolves.
    pub fn uninstall(&self, prefix: &str) -> Result<()> {
        let (mut spec, lock) = self.read_spec_and_lock()?;
        if spec.deps.remove(prefix).is_none() {
            self.ui()
                .info(&format!("Package '{prefix}' does not exist"));
            return Ok(());
        }
        let updated_lock = self.solve_and_download(&spec, lock.as_ref())?;
        self.write_spec_and_lock(&spec, &updated_lock)
    }

    /// Re-resolves without preferences and adopts the result as both lock
    /// and spec dependencies.
    pub fn update(&self) -> Result<()> {
        let (mut spec, _lock) = self.read_spec_and_lock()?;
        let updated_lock = self.solve_and_download(&spec, None)?;
        let new_spec = Spec::from_lock_file(&updated_lock)?;
        spec.deps = new_spec.deps;
        self.write_spec_and_lock(&spec, &updated_lock)
    }

    /// Removes every directory inside the project's install dir that the
    /// current lock file doesn't reference.
    pub fn clean_packages(&self) -> Result<()> {
        let (_spec, lock) = self.read_spec_and_lock()?;
        let lock = lock.unwrap_or_default();

        let root = &self.paths.project_root;
        let full_pkgs_path = std::path::absolute(self.manager.cache.pkg_install_path(root))?;
        match fs::metadata(&full_pkgs_path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(metadata) if !metadata.is_dir() => {
                return Err(self.ui().report_error(&format!(
                    "Packages cache path not a directory: '{}'",
                    full_pkgs_path.display()
                )));
            }
            Ok(_) => {}
        }

        // Keep-tree of path segments: `true` marks a complete package
        // path whose contents must stay; `false` marks a directory to
        // recurse into.
        let mut to_keep: std::collections::HashMap<PathBuf, bool> =
            std::collections::HashMap::new();
        for entry in lock.packages.values() {
            if entry.url.is_empty() {
                continue;
            }
            let url = entry.url.to_url();
            let Some(pkg_path) =
                self.manager
                    .cache
                    .find_pkg(root, &url, &entry.version, self.ui())?
            else {
                continue;
            };
            let full_pkg_path = std::path::absolute(&pkg_path)?;
            let Ok(rel) = full_pkg_path.strip_prefix(&full_pkgs_path) else {
                continue;
            };
            let mut accumulated = PathBuf::new();
            for component in rel.components() {
                accumulated.push(component);
                to_keep.insert(accumulated.clone(), false);
            }
            to_keep.insert(rel.to_path_buf(), true);
        }
        // The README deposited by the package manager stays as well.
        to_keep.insert(PathBuf::from("README.md"), false);

        let mut walker = WalkDir::new(&full_pkgs_path).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.path() == full_pkgs_path {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&full_pkgs_path)
                .expect("walked path below root")
                .to_path_buf();
            match to_keep.get(&rel) {
                None => {
                    debug!(path = %entry.path().display(), "removing unreferenced cache entry");
                    if entry.file_type().is_dir() {
                        fs::remove_dir_all(entry.path())?;
                        walker.skip_current_dir();
                    } else {
                        fs::remove_file(entry.path())?;
                    }
                }
                Some(true) => walker.skip_current_dir(),
                Some(false) => {}
            }
        }
        Ok(())
    }

    /// Re-serializes the current spec file to the info sink.
    pub fn print_spec_file(&self) -> Result<()> {
        let spec = Spec::read_file(&self.paths.spec_file, self.ui())?;
        self.ui().info(&spec.to_yaml()?);
        Ok(())
    }

    /// Re-serializes the current lock file to the info sink.
    pub fn print_lock_file(&self) -> Result<()> {
        let lock = LockFile::read_file(&self.paths.lock_file, self.ui())?;
        self.ui().info(&lock.to_yaml()?);
        Ok(())
    }
}

/// Initializes `project_root` as the root of a package or application,
/// creating a fresh spec and lock file unless either already exists.
pub fn init_directory(
    project_root: &Path,
    name: &str,
    description: &str,
    ui: &dyn Ui,
) -> Result<()> {
    if name.is_empty() {
        return Err(ui.report_error("Name must be provided"));
    }
    let spec_path = project_root.join(DEFAULT_SPEC_NAME);
    let lock_path = project_root.join(DEFAULT_LOCK_FILE_NAME);

    if spec_path.is_file() || lock_path.is_file() {
        ui.info(&format!(
            "Directory '{}' already initialized",
            project_root.display()
        ));
        return Ok(());
    }

    let mut spec = Spec::new(&spec_path);
    spec.name = name.to_string();
    spec.description = description.to_string();
    spec.write_to_file()?;

    let lock = LockFile::new(&lock_path);
    lock.write_to_file()
}
