//! Project specs
//!
//! The spec (`package.yaml`) declares a project's direct dependencies: a
//! mapping from import prefix to either a remote package (URL plus
//! version constraint) or a local path. The spec is the input of
//! resolution; the lock file is its output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::lockfile::{LockFile, PackageEntry, PrefixMap};
use crate::path::{clean_path, lexical_relative, CompilerPath, UriPath};
use crate::registry::Registries;
use crate::semver::{sdk_constraint_to_min_sdk, Constraint};
use crate::solver::{Solution, SolverDep};
use crate::ui::Ui;
use crate::{DEFAULT_LOCK_FILE_NAME, DEFAULT_SPEC_NAME};

/// Mapping from import prefix to declared package.
pub type DependencyMap = BTreeMap<String, SpecPackage>;

/// One declared dependency.
///
/// A valid instance has at least `url` or `path` set. When `path` is set
/// it overrides the other fields, which makes it possible to temporarily
/// switch to a local checkout during development.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecPackage {
    /// Clone URL of the package; identifies it (in all versions) in the
    /// registry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Version constraint. Missing means any version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Location of a local package, absolute or relative to the spec.
    #[serde(default, skip_serializing_if = "CompilerPath::is_empty")]
    pub path: CompilerPath,
}

impl SpecPackage {
    pub fn is_local(&self) -> bool {
        !self.path.is_empty()
    }

    fn validate(&self, prefix: &str, ui: &dyn Ui) -> Result<()> {
        if self.url.is_empty() && self.path.is_empty() {
            return Err(ui.report_error(&format!(
                "Package entry for prefix '{prefix}' is missing 'url' or 'path'"
            )));
        }
        if self.url.is_empty() && !self.version.is_empty() {
            ui.warning(&format!(
                "Package entry for prefix '{prefix}' has version constraint but no URL"
            ));
        }
        if !self.version.is_empty() && Constraint::parse(&self.version).is_err() {
            return Err(ui.report_error(&format!(
                "Package entry for prefix '{prefix}' has invalid version constraint: '{}'",
                self.version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecEnvironment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdk: String,
}

impl SpecEnvironment {
    pub fn is_empty(&self) -> bool {
        self.sdk.is_empty()
    }
}

/// A project spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(skip)]
    path: PathBuf,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    #[serde(default, skip_serializing_if = "SpecEnvironment::is_empty")]
    pub environment: SpecEnvironment,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", rename = "dependencies")]
    pub deps: DependencyMap,
}

/// Whether a string is a valid name or prefix: a letter or `_` first,
/// then alphanumerics, `_`, and single dashes.
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return false;
    }
    let mut previous_dash = false;
    for &b in rest {
        if b == b'-' {
            if previous_dash {
                return false;
            }
            previous_dash = true;
        } else if b.is_ascii_alphanumeric() || b == b'_' {
            previous_dash = false;
        } else {
            return false;
        }
    }
    !previous_dash
}

impl Spec {
    pub fn new(path: impl Into<PathBuf>) -> Spec {
        Spec {
            path: path.into(),
            ..Spec::default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses a spec from YAML text and validates it.
    pub fn parse_str(text: &str, ui: &dyn Ui) -> Result<Spec> {
        let spec: Spec = serde_yaml::from_str(text).map_err(|err| {
            ui.report_error(&format!("Failed to parse app specification: {err}"))
        })?;
        spec.validate(ui)?;
        Ok(spec)
    }

    /// Reads and parses the spec file at `path`.
    pub fn read_file(path: impl Into<PathBuf>, ui: &dyn Ui) -> Result<Spec> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        let mut spec = Self::parse_str(&text, ui)?;
        spec.path = path;
        Ok(spec)
    }

    pub fn validate(&self, ui: &dyn Ui) -> Result<()> {
        if !self.name.is_empty() && !is_valid_name(&self.name) {
            return Err(ui.report_error(&format!("Invalid name: '{}'", self.name)));
        }
        for (prefix, dep) in &self.deps {
            if !is_valid_name(prefix) {
                return Err(ui.report_error(&format!("Invalid prefix: '{prefix}'")));
            }
            dep.validate(prefix, ui)?;
        }
        if !self.environment.sdk.is_empty()
            && sdk_constraint_to_min_sdk(&self.environment.sdk).is_err()
        {
            return Err(ui.report_error(&format!(
                "SDK constraint must be of form '^version': '{}'",
                self.environment.sdk
            )));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write_to_file(&self) -> Result<()> {
        fs::write(&self.path, self.to_yaml()?)?;
        Ok(())
    }

    /// Adds a dependency under `prefix`. Exactly one of `url` and
    /// `local_path` should be given.
    pub fn add_dep(
        &mut self,
        prefix: &str,
        url: &str,
        version: &str,
        local_path: Option<&Path>,
        ui: &dyn Ui,
    ) -> Result<()> {
        if !is_valid_name(prefix) {
            return Err(ui.report_error(&format!("Invalid prefix: '{prefix}'")));
        }
        if self.deps.contains_key(prefix) {
            return Err(ui.report(Error::DuplicatePrefix(prefix.to_string())));
        }
        self.deps.insert(
            prefix.to_string(),
            SpecPackage {
                url: url.to_string(),
                version: version.to_string(),
                path: local_path.map(CompilerPath::from_file_path).unwrap_or_default(),
            },
        );
        Ok(())
    }

    /// Reconstructs spec dependencies from a lock file. Remote entries
    /// carry a `^version` constraint.
    pub fn from_lock_file(lock: &LockFile) -> Result<Spec> {
        let spec_path = lock
            .path()
            .parent()
            .unwrap_or(Path::new("."))
            .join(DEFAULT_SPEC_NAME);
        let mut spec = Spec::new(spec_path);
        for (prefix, pkg_id) in &lock.prefixes {
            let entry = lock.packages.get(pkg_id).ok_or_else(|| {
                Error::NotFound(format!("missing package '{pkg_id}' in lock file"))
            })?;
            spec.deps.insert(prefix.clone(), entry.to_spec_package());
        }
        Ok(spec)
    }

    /// Visits this spec and every local dependency transitively reachable
    /// from it, each exactly once.
    ///
    /// The callback receives the package path as declared (relative to
    /// this spec, or absolute; `None` for the entry spec itself), the
    /// canonical absolute directory, and the package's spec when it has
    /// one. Local packages reachable through different declared paths are
    /// visited once, keyed by the canonical directory, so local cycles
    /// terminate.
    pub fn visit_local_deps<F>(&self, ui: &dyn Ui, mut cb: F) -> Result<()>
    where
        F: FnMut(Option<&Path>, &Path, Option<&Spec>) -> Result<()>,
    {
        let entry_dir = clean_path(self.path.parent().unwrap_or(Path::new(".")));
        let mut visited: HashSet<PathBuf> = HashSet::new();
        cb(None, &entry_dir, Some(self))?;
        visited.insert(entry_dir.clone());
        self.visit_inner(self, &entry_dir, &mut visited, ui, &mut cb)
    }

    fn visit_inner<F>(
        &self,
        entry: &Spec,
        entry_dir: &Path,
        visited: &mut HashSet<PathBuf>,
        ui: &dyn Ui,
        cb: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Option<&Path>, &Path, Option<&Spec>) -> Result<()>,
    {
        let is_entry = std::ptr::eq(self, entry);
        for dep in self.deps.values() {
            if !dep.is_local() {
                continue;
            }

            // Keep declared paths relative to the entry spec (or
            // absolute); nested relative paths accumulate through their
            // declaring spec's location.
            let mut pkg_path = dep.path.to_file_path();
            if !pkg_path.is_absolute() && !is_entry {
                pkg_path = self
                    .path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(pkg_path);
            }
            let mut pkg_path = clean_path(&pkg_path);
            if pkg_path.starts_with("..") {
                // A path that dots out of the entry directory and back in
                // can be simplified, e.g. '../foo/bar' inside 'foo' is
                // just 'bar'.
                let entry_parent = entry.path.parent().unwrap_or(Path::new("."));
                let target = clean_path(&entry_parent.join(&pkg_path));
                if let Some(rel) = lexical_relative(entry_parent, &target) {
                    pkg_path = rel;
                }
            }

            let full_path = if pkg_path.is_absolute() {
                pkg_path.clone()
            } else {
                clean_path(&entry_dir.join(&pkg_path))
            };
            if !visited.insert(full_path.clone()) {
                continue;
            }

            let spec_path = full_path.join(DEFAULT_SPEC_NAME);
            if spec_path.is_file() {
                let mut dep_spec = Spec::read_file(&spec_path, ui)?;
                cb(Some(&pkg_path), &full_path, Some(&dep_spec))?;
                dep_spec.path = pkg_path.join(DEFAULT_SPEC_NAME);
                dep_spec.visit_inner(entry, entry_dir, visited, ui, cb)?;
            } else {
                // Local packages are allowed not to have a spec file.
                cb(Some(&pkg_path), &full_path, None)?;
            }
        }
        Ok(())
    }

    /// Collects the solver inputs: every remote dependency of this spec
    /// and of every transitively reachable local package.
    pub fn build_solver_deps(&self, ui: &dyn Ui) -> Result<Vec<SolverDep>> {
        let mut result = Vec::new();
        self.visit_local_deps(ui, |_pkg_path, _full_path, dep_spec| {
            let Some(spec) = dep_spec else {
                return Ok(());
            };
            for dep in spec.deps.values() {
                if dep.is_local() {
                    continue;
                }
                result.push(SolverDep::new(dep.url.clone(), &dep.version)?);
            }
            Ok(())
        })?;
        Ok(result)
    }

    /// Generates a lock file from the given solution. Assumes that all
    /// packages in the solution are used and downloaded.
    pub fn build_lock_file(
        &self,
        solution: &Solution,
        cache: &Cache,
        registries: &Registries,
        ui: &dyn Ui,
    ) -> Result<LockFile> {
        let project_dir = self.path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let mut result = LockFile::new(project_dir.join(DEFAULT_LOCK_FILE_NAME));
        result.sdk = solution
            .min_sdk()
            .map(|min| format!("^{min}"))
            .unwrap_or_default();

        // Working id per (url, version), in deterministic enumeration
        // order. The id optimizer replaces them at the end.
        let mut pkg_ids: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut id_counter = 0usize;
        for (url, version) in solution.packages() {
            pkg_ids
                .entry(url.to_string())
                .or_default()
                .insert(version.to_string(), format!("pkg{id_counter}"));
            id_counter += 1;
        }

        // Remote dependencies only; local ones are mapped separately.
        let build_prefixes = |spec: &Spec| -> Result<PrefixMap> {
            let mut prefixes = PrefixMap::new();
            for (prefix, spec_pkg) in &spec.deps {
                if spec_pkg.is_local() {
                    continue;
                }
                let version = solution.version_for(&spec_pkg.url, &spec_pkg.version)?;
                prefixes.insert(
                    prefix.clone(),
                    pkg_ids[&spec_pkg.url][&version.to_string()].clone(),
                );
            }
            Ok(prefixes)
        };

        let mut entry_prefixes = build_prefixes(self)?;

        for (url, versions) in &pkg_ids {
            for (version, pkg_id) in versions {
                let spec_path = cache
                    .spec_path_for(&project_dir, url, version, ui)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("package '{url}@{version}' not found in cache"))
                    })?;
                let dep_spec = Spec::read_file(&spec_path, ui)?;
                let mut name = dep_spec.name.clone();
                if name.is_empty() {
                    // The spec file doesn't carry the name yet; fall back
                    // to the registry's.
                    name = registries.name_for(url, version).unwrap_or_default();
                }
                let prefixes = build_prefixes(&dep_spec)?;
                // Without a hash in the registries we just use "".
                let hash = registries.hash_for(url, version).unwrap_or_default();
                result.packages.insert(
                    pkg_id.clone(),
                    PackageEntry {
                        url: UriPath::from_url(url),
                        name,
                        version: version.clone(),
                        hash,
                        prefixes,
                        ..PackageEntry::default()
                    },
                );
            }
        }

        // Local packages are only reachable from the entry spec or from
        // other local packages, so a local-deps walk captures all of
        // them. Ids are keyed by canonical absolute directory.
        let mut local_pkg_ids: HashMap<PathBuf, String> = HashMap::new();

        add_local_dependencies(self, &mut entry_prefixes, &mut local_pkg_ids, &mut id_counter);
        result.prefixes = entry_prefixes;

        let mut local_entries: Vec<(String, PackageEntry)> = Vec::new();
        self.visit_local_deps(ui, |pkg_path, full_path, dep_spec| {
            let Some(pkg_path) = pkg_path else {
                // Entry spec is already done.
                return Ok(());
            };
            let pkg_id = match local_pkg_ids.get(full_path) {
                Some(id) => id.clone(),
                None => {
                    let id = format!("localPkg{id_counter}");
                    id_counter += 1;
                    local_pkg_ids.insert(full_path.to_path_buf(), id.clone());
                    id
                }
            };
            let mut prefixes = match dep_spec {
                Some(spec) => build_prefixes(spec)?,
                None => PrefixMap::new(),
            };
            if let Some(spec) = dep_spec {
                add_local_dependencies(spec, &mut prefixes, &mut local_pkg_ids, &mut id_counter);
            }
            local_entries.push((
                pkg_id,
                PackageEntry {
                    path: CompilerPath::from_file_path(pkg_path),
                    prefixes,
                    ..PackageEntry::default()
                },
            ));
            Ok(())
        })?;
        result.packages.extend(local_entries);

        result.optimize_pkg_ids();
        Ok(result)
    }
}

impl PackageEntry {
    /// Converts a lock entry back into a spec dependency. The recorded
    /// constraint accepts semver-compatible upgrades of the locked
    /// version.
    pub fn to_spec_package(&self) -> SpecPackage {
        let version = if self.version.is_empty() {
            String::new()
        } else {
            format!("^{}", self.version)
        };
        SpecPackage {
            url: self.url.to_url(),
            version,
            path: self.path.clone(),
        }
    }
}

/// Assigns local package ids (by canonical directory) for the local
/// dependencies of `spec` and maps their prefixes.
fn add_local_dependencies(
    spec: &Spec,
    prefixes: &mut PrefixMap,
    local_pkg_ids: &mut HashMap<PathBuf, String>,
    id_counter: &mut usize,
) {
    let dir = spec.path.parent().unwrap_or(Path::new("."));
    for (prefix, spec_pkg) in &spec.deps {
        if !spec_pkg.is_local() {
            continue;
        }
        let p = spec_pkg.path.to_file_path();
        let full_path = if p.is_absolute() {
            clean_path(&p)
        } else {
            clean_path(&dir.join(p))
        };
        let target_id = match local_pkg_ids.get(&full_path) {
            Some(id) => id.clone(),
            None => {
                let id = format!("localPkg{id_counter}");
                *id_counter += 1;
                local_pkg_ids.insert(full_path, id.clone());
                id
            }
        };
        prefixes.insert(prefix.clone(), target_id);
    }
}
