//! Dependency resolution
//!
//! A backtracking constraint solver over the package descriptions of the
//! loaded registries. Given a root set of dependencies it selects a
//! concrete version per `(url, major)` pair such that every transitively
//! reachable constraint is satisfied, preferring the highest compatible
//! version unless steered by a preference list.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::registry::Registries;
use crate::semver::{Constraint, Version};
use crate::ui::Ui;

/// A dependency handed to the solver: target URL plus the version
/// constraint on it.
#[derive(Debug, Clone)]
pub struct SolverDep {
    url: String,
    constraint: Constraint,
}

impl SolverDep {
    /// Creates a solver dependency. An empty constraint string accepts any
    /// version.
    pub fn new(url: impl Into<String>, constraint: &str) -> Result<SolverDep> {
        let constraint = if constraint.is_empty() {
            Constraint::any()
        } else {
            Constraint::parse(constraint)?
        };
        Ok(SolverDep {
            url: url.into(),
            constraint,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// One candidate package in the solver database. The URL is the key of the
/// map containing it.
#[derive(Debug, Clone)]
struct SolverPkg {
    version: Version,
    deps: Vec<SolverDep>,
    min_sdk: Option<Version>,
}

/// The resolver's output: selected versions per URL, plus the effective
/// minimum SDK implied by the selection.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Selected versions per URL, newest first. Multiple entries mean
    /// coexisting majors.
    pkgs: BTreeMap<String, Vec<Version>>,
    min_sdk: Option<Version>,
}

impl Solution {
    /// The effective minimum SDK of the selection, if any constraint
    /// applies.
    pub fn min_sdk(&self) -> Option<&Version> {
        self.min_sdk.as_ref()
    }

    /// All selected `(url, version)` pairs, in deterministic order.
    pub fn packages(&self) -> impl Iterator<Item = (&str, &Version)> {
        self.pkgs
            .iter()
            .flat_map(|(url, versions)| versions.iter().map(move |v| (url.as_str(), v)))
    }

    /// Whether the given concrete version was selected.
    pub fn contains(&self, url: &str, version: &Version) -> bool {
        self.pkgs
            .get(url)
            .map(|versions| versions.contains(version))
            .unwrap_or(false)
    }

    /// Resolves a dependency on `url` with the given constraint to the
    /// concrete selected version.
    pub fn version_for(&self, url: &str, constraint_str: &str) -> Result<&Version> {
        let versions = self.pkgs.get(url).ok_or_else(|| {
            Error::NotFound(format!("package solution missing package '{url}'"))
        })?;
        let constraint = if constraint_str.is_empty() {
            Constraint::any()
        } else {
            Constraint::parse(constraint_str)?
        };
        versions
            .iter()
            .find(|version| constraint.matches(version))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "package solution missing target for '{url}' with constraint '{constraint_str}'"
                ))
            })
    }
}

/// Reverts the side effects of the most recent commit.
#[derive(Debug)]
struct UndoInfo {
    /// Length of the working queue before the commit; everything appended
    /// since is trimmed.
    working_queue_len: usize,
    /// The `url-major` key to forget, when the commit introduced one.
    url_version: Option<String>,
    /// The effective minimum SDK before the commit.
    min_sdk: Option<Version>,
}

#[derive(Debug, Default)]
struct SolverState {
    /// The committed partial solution: `url-major` to concrete version.
    pkgs: HashMap<String, Version>,

    /// Running maximum of the committed SDK minima.
    min_sdk: Option<Version>,

    /// Dependencies still to be satisfied. Dependencies on the same
    /// package may appear multiple times; later entries take the earlier
    /// selection into account.
    working_queue: Vec<SolverDep>,

    /// Per committed choice: the next candidate index to try on
    /// backtracking.
    continuations: Vec<usize>,

    /// Per committed choice: how to revert it.
    undos: Vec<UndoInfo>,
}

/// The constraint solver.
pub struct Solver<'a> {
    /// Candidates per URL, newest first. Preferred versions are rotated to
    /// the front.
    db: HashMap<String, Vec<SolverPkg>>,
    ui: &'a dyn Ui,
    /// Warnings already emitted during this solve. Backtracking revisits
    /// the same dead ends; each message is surfaced once.
    printed_warnings: HashSet<String>,
    /// The ambient SDK version. All selected packages must accept it.
    sdk_version: Option<Version>,
    state: SolverState,
}

impl<'a> Solver<'a> {
    /// Builds the solver database from all loaded registry entries.
    pub fn new(
        registries: &Registries,
        sdk_version: Option<Version>,
        ui: &'a dyn Ui,
    ) -> Result<Solver<'a>> {
        let mut db: HashMap<String, Vec<SolverPkg>> = HashMap::new();
        for desc in registries.entries() {
            let version = Version::parse(&desc.version)
                .map_err(|_| Error::MalformedVersion(desc.version.clone()))?;
            let mut deps = Vec::new();
            for dep in &desc.deps {
                deps.push(SolverDep::new(dep.url.clone(), &dep.version)?);
            }
            let min_sdk = desc.min_sdk()?;
            db.entry(desc.url.clone()).or_default().push(SolverPkg {
                version,
                deps,
                min_sdk,
            });
        }
        for pkgs in db.values_mut() {
            pkgs.sort_by(|a, b| b.version.cmp(&a.version));
        }
        Ok(Solver {
            db,
            ui,
            printed_warnings: HashSet::new(),
            sdk_version,
            state: SolverState::default(),
        })
    }

    /// Marks `(url, version)` pairs as preferred.
    ///
    /// Applied in reverse order so that the first listed preference ends
    /// up at position 0 of its candidate list. Unknown URLs and versions
    /// are ignored.
    pub fn set_preferred(&mut self, preferred: &[(String, String)]) {
        for (url, version_str) in preferred.iter().rev() {
            let Ok(version) = Version::parse(version_str) else {
                continue;
            };
            let Some(pkgs) = self.db.get_mut(url) else {
                continue;
            };
            if let Some(position) = pkgs.iter().position(|pkg| pkg.version == version) {
                pkgs[..=position].rotate_right(1);
            }
        }
    }

    fn warn_once(&mut self, message: String) {
        if self.printed_warnings.insert(message.clone()) {
            self.ui.warning(&message);
        }
    }

    /// Tries to satisfy `dep` starting at candidate index `cont_index`.
    /// On success returns the next continuation index and the undo record
    /// for the commit.
    fn solve_dep(&mut self, dep: &SolverDep, cont_index: usize) -> Option<(usize, UndoInfo)> {
        let url = &dep.url;
        let Some(available_len) = self.db.get(url).map(Vec::len) else {
            self.warn_once(format!("Package '{url}' not found"));
            return None;
        };

        let mut index = cont_index;
        // On re-entry after backtracking a satisfying candidate was
        // already seen; don't warn again.
        let mut found_satisfying = index != 0;
        let mut sdk_mismatch = false;
        while index < available_len {
            let candidate = &self.db[url][index];
            let candidate_version = candidate.version.clone();
            let candidate_min_sdk = candidate.min_sdk.clone();
            index += 1;
            if !dep.constraint.matches(&candidate_version) {
                continue;
            }
            if let (Some(sdk), Some(min)) = (&self.sdk_version, &candidate_min_sdk) {
                if sdk < min {
                    sdk_mismatch = true;
                    continue;
                }
            }
            found_satisfying = true;
            // A dependency may span multiple majors; an earlier selection
            // only binds candidates of the same major.
            let url_version = format!("{url}-{}", candidate_version.major());
            let existing_matches = self
                .state
                .pkgs
                .get(&url_version)
                .map(|existing| *existing == candidate_version);
            if existing_matches == Some(false) {
                continue;
            }

            let mut undo = UndoInfo {
                working_queue_len: self.state.working_queue.len(),
                url_version: None,
                min_sdk: self.state.min_sdk.clone(),
            };
            if existing_matches.is_none() {
                // First concrete version for this url-major.
                let raises_min = match (&self.state.min_sdk, &candidate_min_sdk) {
                    (None, _) => true,
                    (Some(current), Some(candidate_min)) => candidate_min > current,
                    (Some(_), None) => false,
                };
                if raises_min {
                    self.state.min_sdk = candidate_min_sdk;
                }
                self.state.pkgs.insert(url_version.clone(), candidate_version);
                let deps = self.db[url][index - 1].deps.clone();
                self.state.working_queue.extend(deps);
                undo.url_version = Some(url_version);
            }
            return Some((index, undo));
        }

        if !found_satisfying {
            let message = if !dep.constraint.is_any() {
                let mut message =
                    format!("No version of '{url}' satisfies constraint '{}'", dep.constraint);
                if sdk_mismatch {
                    if let Some(sdk) = &self.sdk_version {
                        message.push_str(&format!(" with SDK version {sdk}"));
                    }
                }
                message
            } else {
                let sdk = self
                    .sdk_version
                    .as_ref()
                    .map(Version::to_string)
                    .unwrap_or_default();
                format!("No version of '{url}' exists for SDK version '{sdk}'")
            };
            self.warn_once(message);
        }
        None
    }

    fn apply_undo(&mut self, undo: UndoInfo) {
        self.state.working_queue.truncate(undo.working_queue_len);
        if let Some(url_version) = undo.url_version {
            self.state.pkgs.remove(&url_version);
        }
        self.state.min_sdk = undo.min_sdk;
    }

    /// Computes a solution for the given root dependencies, or `None` when
    /// the search space is exhausted.
    ///
    /// `min_sdk` is the project's own minimum SDK requirement; it seeds
    /// the effective minimum of the solution.
    pub fn solve(&mut self, min_sdk: Option<Version>, deps: Vec<SolverDep>) -> Option<Solution> {
        if let (Some(sdk), Some(min)) = (&self.sdk_version, &min_sdk) {
            if sdk < min {
                self.ui.warning(&format!(
                    "SDK version '{sdk}' does not satisfy the minimal SDK requirement '^{min}'"
                ));
                return None;
            }
        }
        self.state = SolverState {
            pkgs: HashMap::new(),
            min_sdk,
            working_queue: deps,
            continuations: Vec::new(),
            undos: Vec::new(),
        };

        // Each queue entry is tried against all candidates, resuming from
        // its continuation index after backtracking. A successful commit
        // pushes a continuation and an undo record; a failure pops them
        // and retries the previous entry with its next candidate.
        let mut working_index: usize = 0;
        loop {
            if working_index >= self.state.working_queue.len() {
                return Some(self.build_solution());
            }
            let dep = self.state.working_queue[working_index].clone();
            let cont_index = if self.state.continuations.len() == working_index + 1 {
                self.state.continuations.pop().unwrap()
            } else {
                0
            };
            match self.solve_dep(&dep, cont_index) {
                Some((next_index, undo)) => {
                    working_index += 1;
                    self.state.continuations.push(next_index);
                    self.state.undos.push(undo);
                }
                None => {
                    if working_index == 0 {
                        return None;
                    }
                    working_index -= 1;
                    if let Some(undo) = self.state.undos.pop() {
                        self.apply_undo(undo);
                    }
                }
            }
        }
    }

    fn build_solution(&self) -> Solution {
        let mut pkgs: BTreeMap<String, Vec<Version>> = BTreeMap::new();
        for (url_major, version) in &self.state.pkgs {
            let split = url_major.rfind('-').expect("url-major key");
            pkgs.entry(url_major[..split].to_string())
                .or_default()
                .push(version.clone());
        }
        for versions in pkgs.values_mut() {
            versions.sort_by(|a, b| b.cmp(a));
        }
        Solution {
            pkgs,
            min_sdk: self.state.min_sdk.clone(),
        }
    }
}
