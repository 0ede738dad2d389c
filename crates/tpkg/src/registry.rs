//! Registries
//!
//! A registry is a searchable catalog of package descriptions: either a
//! plain directory of description files, or a git repository that is
//! cloned and kept in sync below the registry cache. Registry sync is
//! coordinated across processes with an advisory file lock next to the
//! checkout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::Cache;
use crate::desc::Desc;
use crate::error::{Error, Result};
use crate::git::{Cancellation, CloneOptions, GitTransport, PullOptions, TransportError};
use crate::ui::Ui;

/// Name of the inter-process sync lock file, placed in the parent
/// directory of a registry checkout.
pub const SYNC_LOCK_FILE_NAME: &str = ".tpgk_sync.lock";

/// How long to wait for the sync lock before giving up.
const SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default branches tried when cloning a registry, in order.
const DEFAULT_BRANCHES: &[&str] = &["main", "master", "trunk"];

/// A source of package descriptions.
pub trait Registry {
    /// Name of the registry.
    fn name(&self) -> &str;

    /// Loads the registry into memory, synchronizing it first when `sync`
    /// is set. Synchronization installs the registry if necessary and
    /// then fetches the latest descriptions.
    fn load(
        &mut self,
        sync: bool,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<()>;

    /// Clears the on-disk cache of the registry, if there is any.
    fn clear_cache(&mut self, cache: &Cache, ui: &dyn Ui) -> Result<()>;

    /// Describes this registry, for showing where a description comes
    /// from.
    fn describe(&self) -> String;

    /// All loaded entries. Empty if the registry hasn't been loaded.
    fn entries(&self) -> &[Desc];

    /// All packages whose name contains `name` (case-insensitive).
    fn search_name(&self, name: &str) -> Vec<&Desc> {
        let needle = name.to_lowercase();
        self.entries()
            .iter()
            .filter(|desc| desc.name.to_lowercase().contains(&needle))
            .collect()
    }

    /// All packages whose name equals `name` (case-insensitive).
    fn match_name(&self, name: &str) -> Vec<&Desc> {
        let needle = name.to_lowercase();
        self.entries()
            .iter()
            .filter(|desc| desc.name.to_lowercase() == needle)
            .collect()
    }

    /// All packages whose name, description, or URL contains `needle`.
    fn search_all(&self, needle: &str) -> Vec<&Desc> {
        let lowered = needle.to_lowercase();
        self.entries()
            .iter()
            .filter(|desc| {
                desc.name.to_lowercase().contains(&lowered)
                    || desc.description.to_lowercase().contains(&lowered)
                    || desc.url.contains(needle)
            })
            .collect()
    }

    /// All packages with the given URL.
    fn search_url(&self, url: &str) -> Vec<&Desc> {
        self.entries().iter().filter(|desc| desc.url == url).collect()
    }

    /// The package with the given URL and version, if present.
    fn search_url_version(&self, url: &str, version: &str) -> Vec<&Desc> {
        self.entries()
            .iter()
            .filter(|desc| desc.url == url && desc.version == version)
            .collect()
    }

    /// All packages matching a shortened URL: `shortened` must equal the
    /// URL or be a `/`-delimited suffix of it. `foo/bar` matches
    /// `github.com/foo/bar` but not `github.com/XXfoo/bar`.
    fn search_short_url(&self, shortened: &str) -> Vec<&Desc> {
        let with_slash = format!("/{shortened}");
        self.entries()
            .iter()
            .filter(|desc| desc.url == shortened || desc.url.ends_with(&with_slash))
            .collect()
    }
}

/// A registry backed by a plain directory of description files.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    name: String,
    path: PathBuf,
    entries: Vec<Desc>,
}

impl LocalRegistry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> LocalRegistry {
        LocalRegistry {
            name: name.into(),
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// A pre-loaded registry; used by embedders and tests that already
    /// hold descriptions in memory.
    pub fn with_entries(name: impl Into<String>, entries: Vec<Desc>) -> LocalRegistry {
        LocalRegistry {
            name: name.into(),
            path: PathBuf::new(),
            entries,
        }
    }

    /// Walks the registry directory, parsing every `*.yaml`/`*.yml` file
    /// as a description. Hidden files and directories are skipped.
    fn load_dir(&mut self, ui: &dyn Ui) -> Result<()> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.path).into_iter().filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.path().extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => {}
                _ => continue,
            }
            entries.push(Desc::parse_file(entry.path(), ui)?);
        }
        debug!(registry = %self.name, count = entries.len(), "loaded registry entries");
        self.entries = entries;
        Ok(())
    }
}

impl Registry for LocalRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(
        &mut self,
        _sync: bool,
        _cache: &Cache,
        _transport: &dyn GitTransport,
        _cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<()> {
        self.load_dir(ui)
    }

    fn clear_cache(&mut self, _cache: &Cache, _ui: &dyn Ui) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        if self.name.is_empty() {
            return self.path.display().to_string();
        }
        format!("{}: {}", self.name, self.path.display())
    }

    fn entries(&self) -> &[Desc] {
        &self.entries
    }
}

/// Runs `f` while holding the inter-process sync lock for the checkout at
/// `checkout_path`.
///
/// The lock file lives in the parent directory, so it doesn't interfere
/// with cloning or removing the checkout itself while still letting
/// independent registries sync in parallel. The lock is released on every
/// exit path; acquisition gives up with [`Error::LockTimeout`] after
/// three minutes.
fn with_sync_lock<T>(checkout_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let parent = checkout_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let lock_path = parent.join(SYNC_LOCK_FILE_NAME);
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;

    let deadline = Instant::now() + SYNC_LOCK_TIMEOUT;
    while lock_file.try_lock_exclusive().is_err() {
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout(lock_path));
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let result = f();
    if let Err(err) = lock_file.unlock() {
        warn!(lock = %lock_path.display(), error = %err, "failed to release sync lock");
    }
    result
}

/// Clones `url` into `dir`, trying the default branches in order. Keeps
/// the error of the last attempt that didn't fail with a missing ref.
fn clone_default_branch(
    transport: &dyn GitTransport,
    dir: &Path,
    url: &str,
    ssh_key_path: Option<&Path>,
) -> Result<()> {
    let mut last_error: Option<TransportError> = None;
    for branch in DEFAULT_BRANCHES {
        let options = CloneOptions {
            url: url.to_string(),
            branch: Some(branch.to_string()),
            single_branch: true,
            ssh_key_path: ssh_key_path.map(Path::to_path_buf),
            ..CloneOptions::default()
        };
        match transport.clone_repo(dir, &options) {
            Ok(_) => return Ok(()),
            Err(branch_error) => {
                if last_error.is_none() || !branch_error.is_missing_ref() {
                    last_error = Some(branch_error);
                }
            }
        }
    }
    Err(last_error.expect("clone attempted at least once").into())
}

/// A registry backed by a git repository, checked out below the registry
/// cache.
#[derive(Debug, Default)]
pub struct GitRegistry {
    local: LocalRegistry,
    url: String,
}

impl GitRegistry {
    /// Creates a git registry, locating an existing checkout in the
    /// cache.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        cache: &Cache,
        ui: &dyn Ui,
    ) -> Result<GitRegistry> {
        let url = url.into();
        let path = cache.find_registry(&url, ui)?.unwrap_or_default();
        Ok(GitRegistry {
            local: LocalRegistry::new(name, path),
            url,
        })
    }

    fn checkout_path(&self, cache: &Cache) -> PathBuf {
        if self.local.path.as_os_str().is_empty() {
            cache.preferred_registry_path(&self.url)
        } else {
            self.local.path.clone()
        }
    }

    fn sync(
        &mut self,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<()> {
        cancellation.check()?;
        let checkout = self.checkout_path(cache);
        let url = self.url.clone();
        let local_path = &mut self.local.path;
        with_sync_lock(&checkout, || {
            let exists = match fs::metadata(&checkout) {
                Ok(metadata) if metadata.is_dir() => true,
                Ok(_) => {
                    return Err(ui.report_error(&format!(
                        "Path {} exists but is not a directory",
                        checkout.display()
                    )));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                Err(err) => return Err(err.into()),
            };
            if exists {
                debug!(registry = %url, "pulling registry");
                transport.pull(&checkout, &PullOptions::default())?;
            } else {
                debug!(registry = %url, "cloning registry");
                clone_default_branch(transport, &checkout, &url, None)?;
                *local_path = checkout.clone();
            }
            Ok(())
        })
    }
}

impl Registry for GitRegistry {
    fn name(&self) -> &str {
        self.local.name()
    }

    fn load(
        &mut self,
        sync: bool,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<()> {
        if sync {
            self.sync(cache, transport, cancellation, ui)?;
        }
        if self.local.path.as_os_str().is_empty() {
            // The repository was never cloned; nothing to load. If
            // another process cloned it in the meantime we don't see it
            // here.
            return Ok(());
        }
        self.local.load_dir(ui)
    }

    fn clear_cache(&mut self, _cache: &Cache, _ui: &dyn Ui) -> Result<()> {
        if self.local.path.as_os_str().is_empty() {
            return Ok(());
        }
        let path = self.local.path.clone();
        with_sync_lock(&path, || {
            fs::remove_dir_all(&path)?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("{}: {}", self.local.name(), self.url)
    }

    fn entries(&self) -> &[Desc] {
        self.local.entries()
    }
}

/// A git registry reached over SSH, with an explicit branch.
pub struct SshGitRegistry {
    git: GitRegistry,
    ssh_key_path: PathBuf,
    branch: String,
}

impl SshGitRegistry {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        cache: &Cache,
        ssh_key_path: impl Into<PathBuf>,
        branch: impl Into<String>,
        ui: &dyn Ui,
    ) -> Result<SshGitRegistry> {
        Ok(SshGitRegistry {
            git: GitRegistry::new(name, url, cache, ui)?,
            ssh_key_path: ssh_key_path.into(),
            branch: branch.into(),
        })
    }
}

impl Registry for SshGitRegistry {
    fn name(&self) -> &str {
        self.git.name()
    }

    fn load(
        &mut self,
        sync: bool,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<()> {
        if !sync {
            if self.git.local.path.as_os_str().is_empty() {
                return Err(ui.report_error(&format!("Registry '{}' not synced", self.name())));
            }
        } else {
            cancellation.check()?;
            let checkout = self.git.checkout_path(cache);
            let url = self.git.url.clone();
            let ssh_key_path = self.ssh_key_path.clone();
            let branch = self.branch.clone();
            let never_cloned = self.git.local.path.as_os_str().is_empty();
            let local_path = &mut self.git.local.path;
            with_sync_lock(&checkout, || {
                if never_cloned {
                    let options = CloneOptions {
                        url,
                        branch: Some(branch),
                        single_branch: true,
                        ssh_key_path: Some(ssh_key_path),
                        ..CloneOptions::default()
                    };
                    transport.clone_repo(&checkout, &options)?;
                    *local_path = checkout.clone();
                } else {
                    transport.pull(
                        &checkout,
                        &PullOptions {
                            ssh_key_path: Some(ssh_key_path),
                        },
                    )?;
                }
                Ok(())
            })?;
        }
        self.git.local.load_dir(ui)
    }

    fn clear_cache(&mut self, cache: &Cache, ui: &dyn Ui) -> Result<()> {
        self.git.clear_cache(cache, ui)
    }

    fn describe(&self) -> String {
        self.git.describe()
    }

    fn entries(&self) -> &[Desc] {
        self.git.entries()
    }
}

/// How a configured registry should be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// A plain directory of descriptions.
    Local,
    /// A registry backed by a git repository.
    Git,
}

/// Configuration for one registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    pub kind: RegistryKind,
    /// Directory for local registries, clone URL for git registries.
    pub path: String,
}

impl RegistryConfig {
    /// Constructs and loads the registry described by this configuration.
    pub fn load(
        &self,
        sync: bool,
        clear_cache: bool,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<Box<dyn Registry>> {
        let mut registry: Box<dyn Registry> = match self.kind {
            RegistryKind::Local => Box::new(LocalRegistry::new(&self.name, &self.path)),
            RegistryKind::Git => Box::new(GitRegistry::new(&self.name, &self.path, cache, ui)?),
        };
        if clear_cache {
            registry.clear_cache(cache, ui)?;
        }
        registry.load(sync, cache, transport, cancellation, ui)?;
        Ok(registry)
    }
}

/// The configured registries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryConfigs(pub Vec<RegistryConfig>);

impl RegistryConfigs {
    /// Loads all configured registries.
    pub fn load(
        &self,
        sync: bool,
        cache: &Cache,
        transport: &dyn GitTransport,
        cancellation: &Cancellation,
        ui: &dyn Ui,
    ) -> Result<Registries> {
        let mut result = Vec::new();
        for config in &self.0 {
            result.push(config.load(sync, false, cache, transport, cancellation, ui)?);
        }
        Ok(Registries::new(result))
    }
}

/// The loaded registries, searched as one.
#[derive(Default)]
pub struct Registries {
    registries: Vec<Box<dyn Registry>>,
}

impl Registries {
    pub fn new(registries: Vec<Box<dyn Registry>>) -> Registries {
        Registries { registries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Registry> {
        self.registries.iter().map(Box::as_ref)
    }

    /// All loaded descriptions across all registries.
    pub fn entries(&self) -> impl Iterator<Item = &Desc> {
        self.registries.iter().flat_map(|r| r.entries().iter())
    }

    fn search_in_registries<'a>(
        &'a self,
        search: impl Fn(&'a dyn Registry) -> Vec<&'a Desc>,
    ) -> Vec<&'a Desc> {
        self.registries
            .iter()
            .flat_map(|registry| search(registry.as_ref()))
            .collect()
    }

    pub fn search_name(&self, name: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.search_name(name))
    }

    pub fn match_name(&self, name: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.match_name(name))
    }

    pub fn search_all(&self, needle: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.search_all(needle))
    }

    pub fn search_url(&self, url: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.search_url(url))
    }

    pub fn search_url_version(&self, url: &str, version: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.search_url_version(url, version))
    }

    pub fn search_short_url(&self, shortened: &str) -> Vec<&Desc> {
        self.search_in_registries(|registry| registry.search_short_url(shortened))
    }

    /// The registry name of the package with the given URL and version.
    pub fn name_for(&self, url: &str, version: &str) -> Option<String> {
        self.entries()
            .find(|desc| desc.url == url && desc.version == version)
            .map(|desc| desc.name.clone())
    }

    /// The hash of the package with the given URL and version.
    pub fn hash_for(&self, url: &str, version: &str) -> Option<String> {
        self.entries()
            .find(|desc| desc.url == url && desc.version == version && !desc.hash.is_empty())
            .map(|desc| desc.hash.clone())
    }
}

/// Discards descriptions of packages for which a higher version exists in
/// the given list.
pub fn without_lower_versions<'a>(mut descs: Vec<&'a Desc>) -> Vec<&'a Desc> {
    if descs.is_empty() {
        return descs;
    }
    descs.sort_by(|a, b| a.id_cmp(b));
    let mut result: Vec<&Desc> = Vec::with_capacity(descs.len());
    for desc in descs {
        match result.last() {
            Some(previous) if previous.url == desc.url => {
                *result.last_mut().unwrap() = desc;
            }
            _ => result.push(desc),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NullUi;

    fn desc(name: &str, url: &str, version: &str) -> Desc {
        Desc::new(name, "", url, version, "", "MIT", "", Vec::new())
    }

    fn test_registries() -> Registries {
        Registries::new(vec![Box::new(LocalRegistry::with_entries(
            "test",
            vec![
                desc("morse", "github.com/toitware/toit-morse", "1.0.0"),
                desc("morse", "github.com/toitware/toit-morse", "1.0.2"),
                desc("fonts", "github.com/toitware/toit-fonts", "2.1.0"),
                desc("morse", "attacker.com/github.com/toitware/toit-morse", "9.9.9"),
            ],
        ))])
    }

    #[test]
    fn test_search_name_is_case_insensitive() {
        let registries = test_registries();
        assert_eq!(registries.search_name("MORSE").len(), 3);
        assert_eq!(registries.match_name("Fonts").len(), 1);
        assert_eq!(registries.match_name("fon").len(), 0);
    }

    #[test]
    fn test_search_short_url() {
        let registries = test_registries();
        assert_eq!(registries.search_short_url("toitware/toit-morse").len(), 3);
        assert_eq!(
            registries
                .search_short_url("github.com/toitware/toit-morse")
                .len(),
            3
        );
        // Not a '/'-delimited suffix.
        assert_eq!(registries.search_short_url("oit-morse").len(), 0);
    }

    #[test]
    fn test_search_url_version() {
        let registries = test_registries();
        assert_eq!(
            registries
                .search_url_version("github.com/toitware/toit-morse", "1.0.2")
                .len(),
            1
        );
        assert_eq!(
            registries
                .search_url_version("github.com/toitware/toit-morse", "3.0.0")
                .len(),
            0
        );
    }

    #[test]
    fn test_without_lower_versions() {
        let registries = test_registries();
        let all = registries.search_name("morse");
        let highest = without_lower_versions(all);
        assert_eq!(highest.len(), 2);
        assert!(highest
            .iter()
            .any(|d| d.url == "github.com/toitware/toit-morse" && d.version == "1.0.2"));
    }

    #[test]
    fn test_local_registry_load_skips_hidden() {
        let ui = NullUi;
        let tmp = tempfile::tempdir().unwrap();
        let desc_yaml = "\
name: morse
description: Morse code
url: github.com/toitware/toit-morse
version: 1.0.0
";
        fs::create_dir_all(tmp.path().join("packages")).unwrap();
        fs::write(tmp.path().join("packages/morse.yaml"), desc_yaml).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join(".git/hidden.yaml"), desc_yaml).unwrap();
        fs::write(tmp.path().join("notes.txt"), "not a description").unwrap();

        let mut registry = LocalRegistry::new("test", tmp.path());
        registry.load_dir(&ui).unwrap();
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.entries()[0].name, "morse");
    }

    #[test]
    fn test_sync_lock_is_released() {
        let tmp = tempfile::tempdir().unwrap();
        let checkout = tmp.path().join("registry");

        let result = with_sync_lock(&checkout, || Ok(42));
        assert_eq!(result.unwrap(), 42);
        // Reacquiring immediately succeeds, so the lock was released.
        let result = with_sync_lock(&checkout, || Ok(43));
        assert_eq!(result.unwrap(), 43);

        // The lock is released on the error path as well.
        let result: Result<()> = with_sync_lock(&checkout, || Err(Error::Unsolvable));
        assert!(result.is_err());
        let result = with_sync_lock(&checkout, || Ok(44));
        assert_eq!(result.unwrap(), 44);
    }
}
