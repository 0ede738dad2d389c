//! Lock files
//!
//! A lock file is the result of a package resolution: it maps import
//! prefixes to package ids and package ids to concrete package versions,
//! so the compiler can find the sources of every dependency. Lock files
//! are commonly checked in and shared, so they must not contain absolute
//! paths, and writing one leaves the file untouched when nothing changed.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::path::{CompilerPath, UriPath};
use crate::ui::Ui;

/// Mapping from import prefix to package id.
pub type PrefixMap = BTreeMap<String, String>;

/// A resolved package in the lock file.
///
/// When `path` is set the package lives at that location (absolute or
/// relative to the lock file). Otherwise `url` and `version` identify a
/// package in the package cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    #[serde(default, skip_serializing_if = "UriPath::is_empty")]
    pub url: UriPath,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "CompilerPath::is_empty")]
    pub path: CompilerPath,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,

    #[serde(default, skip_serializing_if = "PrefixMap::is_empty")]
    pub prefixes: PrefixMap,
}

impl PackageEntry {
    /// Whether this entry refers to a local path.
    pub fn is_local(&self) -> bool {
        !self.path.is_empty()
    }

    /// Ensures the entry is structurally valid.
    pub fn validate(&self, ui: &dyn Ui) -> Result<()> {
        if !self.url.is_empty() && self.version.is_empty() {
            return Err(ui.report_error("Invalid lock file: url without version"));
        }
        if self.url.is_empty() && self.path.is_empty() {
            return Err(ui.report_error("Invalid lock file: missing 'url' and 'path'"));
        }
        Ok(())
    }

    /// Computes the id segments this entry's final id is built from.
    ///
    /// Ids appear in error messages, so they should be representative of
    /// the package. Shorter ids are preferred, starting from the last URL
    /// (or path) segment; the caller adds version suffixes when two
    /// entries only differ in version.
    fn build_id_segments(&self) -> Vec<String> {
        let sanitized = if self.is_local() {
            to_valid_pkg_id(self.path.as_str())
        } else {
            to_valid_pkg_id(&self.url.to_url())
        };
        sanitized.split('/').map(str::to_string).collect()
    }
}

/// Replaces disallowed characters so the result is a valid package id:
/// the first character must be a letter or `_`; later characters may be
/// alphanumeric or one of `_-./`.
fn to_valid_pkg_id(s: &str) -> String {
    s.chars()
        .enumerate()
        .map(|(i, c)| {
            let ok = if i == 0 {
                c.is_ascii_alphabetic() || c == '_'
            } else {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
            };
            if ok {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A lock file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    #[serde(skip)]
    path: PathBuf,

    /// SDK constraint, if any. Must be of the form `^version`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdk: String,

    /// Prefixes of the entry package.
    #[serde(default, skip_serializing_if = "PrefixMap::is_empty")]
    pub prefixes: PrefixMap,

    /// All dependent packages, by package id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PackageEntry>,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> LockFile {
        LockFile {
            path: path.into(),
            ..LockFile::default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and validates the lock file at `path`.
    pub fn read_file(path: impl Into<PathBuf>, ui: &dyn Ui) -> Result<LockFile> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        let mut lock: LockFile = serde_yaml::from_str(&text).map_err(|err| {
            ui.report_error(&format!(
                "Failed to parse lock file '{}': {}",
                path.display(),
                err
            ))
        })?;
        for entry in lock.packages.values() {
            entry.validate(ui)?;
        }
        lock.path = path;
        Ok(lock)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Serializes the lock file and writes it to its path, leaving the
    /// file untouched if the content is unchanged.
    pub fn write_to_file(&self) -> Result<()> {
        let yaml = self.to_yaml()?;
        write_file_if_changed(&self.path, yaml.as_bytes())
    }

    /// Replaces the working package ids with the shortest human-readable
    /// ids that are unique within the lock file.
    ///
    /// Entries sharing a URL are disambiguated from other packages first
    /// and then suffixed with their version. If, after renaming, any
    /// referenced id would be unmapped, the optimization is abandoned and
    /// the working ids are kept.
    pub(crate) fn optimize_pkg_ids(&mut self) {
        // Ids of entries that share a URL with an earlier entry; they get
        // the representative's id plus a version suffix.
        let mut different_version_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut pkg_urls: HashMap<String, String> = HashMap::new();
        // Segment lists of the ids that still need a new id; one
        // representative per URL.
        let mut all_segments: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (old_id, entry) in &self.packages {
            if entry.is_local() {
                all_segments.insert(old_id.clone(), entry.build_id_segments());
                continue;
            }
            let url = entry.url.to_url();
            match pkg_urls.get(&url) {
                Some(representative) => {
                    different_version_of
                        .entry(representative.clone())
                        .or_default()
                        .push(old_id.clone());
                }
                None => {
                    all_segments.insert(old_id.clone(), entry.build_id_segments());
                    pkg_urls.insert(url, old_id.clone());
                }
            }
        }

        let mut new_ids: BTreeMap<String, Vec<String>> = BTreeMap::new();

        // Use more and more segments until every id is unique or has run
        // out of segments.
        let mut width = 1;
        while !all_segments.is_empty() {
            let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (old_id, segments) in &all_segments {
                let len = segments.len();
                let candidate = if width <= len {
                    segments[len - width..].join("/")
                } else {
                    segments.join("/")
                };
                candidates.entry(candidate).or_default().push(old_id.clone());
            }
            for (candidate, old_ids) in candidates {
                let is_single = old_ids.len() == 1;
                for old_id in old_ids {
                    let segment_count = all_segments.get(&old_id).map(Vec::len).unwrap_or(0);
                    if !is_single && width < segment_count {
                        continue;
                    }
                    match different_version_of.get(&old_id) {
                        Some(different_versions) => {
                            let mut all_ids = different_versions.clone();
                            all_ids.push(old_id.clone());
                            for id in all_ids {
                                let version = &self.packages[&id].version;
                                new_ids
                                    .entry(format!("{candidate}-{version}"))
                                    .or_default()
                                    .push(id);
                            }
                        }
                        None => {
                            new_ids
                                .entry(candidate.clone())
                                .or_default()
                                .push(old_id.clone());
                        }
                    }
                    all_segments.remove(&old_id);
                }
            }
            width += 1;
        }

        // Final uniqueness pass. Unique ids have priority; the rest get a
        // deterministic counter suffix.
        let mut final_ids: BTreeMap<String, String> = BTreeMap::new();
        let mut old_to_new: HashMap<String, String> = HashMap::new();
        for (new_id, old_ids) in &new_ids {
            if let [old_id] = old_ids.as_slice() {
                final_ids.insert(new_id.clone(), old_id.clone());
                old_to_new.insert(old_id.clone(), new_id.clone());
            }
        }
        for (new_id, old_ids) in &new_ids {
            if old_ids.len() == 1 {
                continue;
            }
            let mut counter = 0;
            for old_id in old_ids {
                loop {
                    let candidate = format!("{new_id}--{counter}");
                    counter += 1;
                    if !final_ids.contains_key(&candidate) {
                        final_ids.insert(candidate.clone(), old_id.clone());
                        old_to_new.insert(old_id.clone(), candidate);
                        break;
                    }
                }
            }
        }

        // If some referenced id has no mapping, a prefix points at a
        // package that isn't present; keep the working ids.
        let referenced = self
            .prefixes
            .values()
            .chain(self.packages.values().flat_map(|e| e.prefixes.values()));
        for old_id in referenced {
            if !old_to_new.contains_key(old_id) {
                return;
            }
        }

        let map_prefixes = |prefixes: &PrefixMap| -> PrefixMap {
            prefixes
                .iter()
                .map(|(prefix, old_id)| (prefix.clone(), old_to_new[old_id].clone()))
                .collect()
        };

        let mut new_packages = BTreeMap::new();
        for (old_id, entry) in &self.packages {
            let mut entry = entry.clone();
            entry.prefixes = map_prefixes(&entry.prefixes);
            new_packages.insert(old_to_new[old_id].clone(), entry);
        }
        self.packages = new_packages;
        self.prefixes = map_prefixes(&self.prefixes);
    }
}

fn write_file_if_changed(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Ok(existing) = fs::read(path) {
        if existing == bytes {
            return Ok(());
        }
    }
    fs::write(path, bytes)?;
    Ok(())
}
