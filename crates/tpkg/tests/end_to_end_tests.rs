//! End-to-end project-manager tests.
//!
//! The git transport is replaced by a filesystem fake: a "remote" tree
//! keeps one directory per `<url>/<ref>`, and cloning copies it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tpkg::cache::Cache;
use tpkg::desc::{Desc, DescPackage};
use tpkg::error::Error;
use tpkg::git::{Cancellation, CloneOptions, GitTransport, PullOptions, TransportError};
use tpkg::lockfile::LockFile;
use tpkg::manager::{Manager, ProjectPaths, ProjectPkgManager};
use tpkg::registry::{LocalRegistry, Registries};
use tpkg::spec::Spec;
use tpkg::ui::CaptureUi;
use tpkg::{DEFAULT_LOCK_FILE_NAME, DEFAULT_SPEC_NAME, PROJECT_PACKAGES_PATH};

const MORSE_URL: &str = "github.com/toitware/toit-morse";
const FONTS_URL: &str = "github.com/toitware/toit-fonts";

struct FsTransport {
    root: PathBuf,
}

impl GitTransport for FsTransport {
    fn clone_repo(
        &self,
        dir: &Path,
        options: &CloneOptions,
    ) -> Result<String, TransportError> {
        let reference = options
            .tag
            .clone()
            .or_else(|| options.branch.clone())
            .unwrap_or_else(|| "main".to_string());
        let source = self.root.join(&options.url).join(&reference);
        if !source.is_dir() {
            return Err(TransportError::MissingRef(reference));
        }
        fs::create_dir_all(dir).map_err(|err| TransportError::Failed(err.to_string()))?;
        copy_dir(&source, dir).map_err(|err| TransportError::Failed(err.to_string()))?;
        Ok(format!("{}@{}", options.url, reference))
    }

    fn pull(&self, _dir: &Path, _options: &PullOptions) -> Result<(), TransportError> {
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn desc(name: &str, url: &str, version: &str, deps: &[(&str, &str)]) -> Desc {
    let deps = deps
        .iter()
        .map(|(url, constraint)| DescPackage {
            url: url.to_string(),
            version: constraint.to_string(),
        })
        .collect();
    Desc::new(name, format!("The {name} package"), url, version, "", "MIT", "", deps)
}

/// Deposits a package tree under `<remote>/<url>/v<version>/`.
fn publish(remote: &Path, url: &str, version: &str, spec_yaml: &str) {
    let dir = remote.join(url).join(format!("v{version}"));
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(dir.join(DEFAULT_SPEC_NAME), spec_yaml).unwrap();
    fs::write(dir.join("src").join("lib.toit"), "main: null\n").unwrap();
}

fn standard_remote(remote: &Path) -> Vec<Desc> {
    publish(
        remote,
        MORSE_URL,
        "1.0.0",
        "name: morse\ndescription: Morse code\n",
    );
    publish(
        remote,
        MORSE_URL,
        "1.0.2",
        &format!(
            "name: morse\ndescription: Morse code\ndependencies:\n  fonts:\n    url: {FONTS_URL}\n    version: ^2.0.0\n"
        ),
    );
    publish(
        remote,
        FONTS_URL,
        "2.1.0",
        "name: fonts\ndescription: Fonts\n",
    );
    vec![
        desc("morse", MORSE_URL, "1.0.0", &[]),
        desc("morse", MORSE_URL, "1.0.2", &[(FONTS_URL, "^2.0.0")]),
        desc("fonts", FONTS_URL, "2.1.0", &[]),
    ]
}

fn new_project(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join(DEFAULT_SPEC_NAME),
        "name: app\ndescription: Test app\n",
    )
    .unwrap();
}

fn project_manager(
    project: &Path,
    remote: &Path,
    descs: Vec<Desc>,
    ui: Arc<CaptureUi>,
    cancellation: Cancellation,
) -> ProjectPkgManager {
    let registries = Registries::new(vec![Box::new(LocalRegistry::with_entries("test", descs))]);
    let cache = Cache::new(project.join("registry-cache"));
    let manager = Manager::new(
        registries,
        cache,
        None,
        Box::new(FsTransport {
            root: remote.to_path_buf(),
        }),
        cancellation,
        ui,
    );
    let paths = ProjectPaths::new(Some(project), None, None).unwrap();
    ProjectPkgManager::new(manager, paths)
}

fn read_lock(project: &Path) -> LockFile {
    LockFile::read_file(project.join(DEFAULT_LOCK_FILE_NAME), &tpkg::ui::NullUi).unwrap()
}

fn read_spec(project: &Path) -> Spec {
    Spec::read_file(project.join(DEFAULT_SPEC_NAME), &tpkg::ui::NullUi).unwrap()
}

#[test]
fn test_install_by_name() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui.clone(), Cancellation::new());

    let (prefix, installed) = pm.install_url_pkg(None, "morse").unwrap();
    assert_eq!(prefix, "morse");
    assert_eq!(installed, format!("{MORSE_URL}@1.0.2"));

    // The spec records a caret constraint on the selected version.
    let spec = read_spec(&project);
    assert_eq!(spec.deps["morse"].url, MORSE_URL);
    assert_eq!(spec.deps["morse"].version, "^1.0.2");

    // The lock maps the prefix and contains the transitive dependency.
    let lock = read_lock(&project);
    let morse_id = &lock.prefixes["morse"];
    assert_eq!(morse_id, "toit-morse");
    let morse = &lock.packages[morse_id];
    assert_eq!(morse.version, "1.0.2");
    let fonts_id = &morse.prefixes["fonts"];
    assert_eq!(lock.packages[fonts_id].version, "2.1.0");

    // Sources are materialized in the project package directory.
    let pkg_dir = project
        .join(PROJECT_PACKAGES_PATH)
        .join(MORSE_URL)
        .join("1.0.2");
    assert!(pkg_dir.join(DEFAULT_SPEC_NAME).is_file());
    assert!(pkg_dir.join("src/lib.toit").is_file());
    assert!(project
        .join(PROJECT_PACKAGES_PATH)
        .join("README.md")
        .is_file());
}

#[test]
fn test_reinstall_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    let lock_path = project.join(DEFAULT_LOCK_FILE_NAME);
    let before = fs::read(&lock_path).unwrap();

    // A plain install with a current lock file downloads only.
    pm.install(false).unwrap();
    assert_eq!(fs::read(&lock_path).unwrap(), before);

    // A forced re-resolution prefers the locked versions and reproduces
    // the same bytes.
    pm.install(true).unwrap();
    assert_eq!(fs::read(&lock_path).unwrap(), before);
}

#[test]
fn test_install_at_version() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());

    let (_, installed) = pm.install_url_pkg(None, "morse@1.0.0").unwrap();
    assert_eq!(installed, format!("{MORSE_URL}@1.0.0"));
    let spec = read_spec(&project);
    assert_eq!(spec.deps["morse"].version, "^1.0.0");
    let lock = read_lock(&project);
    assert_eq!(lock.packages[&lock.prefixes["morse"]].version, "1.0.0");
}

#[test]
fn test_install_duplicate_prefix_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    let result = pm.install_url_pkg(None, "morse");
    assert!(matches!(result, Err(Error::DuplicatePrefix(_))));
}

#[test]
fn test_install_unknown_package() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui.clone(), Cancellation::new());

    let result = pm.install_url_pkg(None, "nonexistent");
    assert!(matches!(result, Err(Error::AlreadyReported)));
    assert_eq!(
        ui.messages(),
        vec!["Error: Package 'nonexistent' not found"]
    );
}

#[test]
fn test_uninstall() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    pm.uninstall("morse").unwrap();
    let spec = read_spec(&project);
    assert!(spec.deps.is_empty());
    let lock = read_lock(&project);
    assert!(lock.packages.is_empty());
    assert!(lock.prefixes.is_empty());

    // Uninstalling an unknown prefix is a no-op with a message.
    pm.uninstall("morse").unwrap();
}

#[test]
fn test_update_adopts_newest_versions() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    // Author spec and lock pinning morse 1.0.0 by hand.
    fs::write(
        project.join(DEFAULT_SPEC_NAME),
        format!(
            "name: app\ndescription: Test app\ndependencies:\n  morse:\n    url: {MORSE_URL}\n    version: ^1.0.0\n"
        ),
    )
    .unwrap();
    fs::write(
        project.join(DEFAULT_LOCK_FILE_NAME),
        format!(
            "prefixes:\n  morse: toit-morse\npackages:\n  toit-morse:\n    url: {MORSE_URL}\n    name: morse\n    version: 1.0.0\n"
        ),
    )
    .unwrap();

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());

    // A plain install respects the locked version.
    pm.install(false).unwrap();
    assert_eq!(read_lock(&project).packages["toit-morse"].version, "1.0.0");

    // A forced re-resolution still prefers the locked version.
    pm.install(true).unwrap();
    assert_eq!(read_lock(&project).packages["toit-morse"].version, "1.0.0");

    // Update resolves without preferences and rewrites both files.
    pm.update().unwrap();
    let lock = read_lock(&project);
    let morse_id = &lock.prefixes["morse"];
    assert_eq!(lock.packages[morse_id].version, "1.0.2");
    let spec = read_spec(&project);
    assert_eq!(spec.deps["morse"].version, "^1.0.2");
}

#[test]
fn test_install_local_package() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let shared = tmp.path().join("shared");
    fs::create_dir_all(shared.join("src")).unwrap();
    fs::write(
        shared.join(DEFAULT_SPEC_NAME),
        format!(
            "name: shared\ndescription: Shared code\ndependencies:\n  fonts:\n    url: {FONTS_URL}\n    version: ^2.0.0\n"
        ),
    )
    .unwrap();

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());

    let prefix = pm.install_local_pkg(None, &shared).unwrap();
    assert_eq!(prefix, "shared");

    let lock = read_lock(&project);
    let shared_id = &lock.prefixes["shared"];
    let shared_entry = &lock.packages[shared_id];
    assert!(shared_entry.is_local());
    let fonts_id = &shared_entry.prefixes["fonts"];
    assert_eq!(lock.packages[fonts_id].version, "2.1.0");

    // Downloading from the lock verifies the local directory.
    pm.download().unwrap();
}

#[test]
fn test_clean_removes_unreferenced_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    let packages_dir = project.join(PROJECT_PACKAGES_PATH);
    fs::create_dir_all(packages_dir.join("junk/nested")).unwrap();
    fs::write(packages_dir.join("junk/nested/file.txt"), "junk").unwrap();
    fs::write(packages_dir.join("github.com/stray.txt"), "stray").unwrap();

    pm.clean_packages().unwrap();

    assert!(!packages_dir.join("junk").exists());
    assert!(!packages_dir.join("github.com/stray.txt").exists());
    assert!(packages_dir.join("README.md").is_file());
    assert!(packages_dir
        .join(MORSE_URL)
        .join("1.0.2")
        .join(DEFAULT_SPEC_NAME)
        .is_file());
}

#[test]
fn test_download_restores_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    fs::remove_dir_all(project.join(PROJECT_PACKAGES_PATH)).unwrap();
    pm.download().unwrap();
    assert!(project
        .join(PROJECT_PACKAGES_PATH)
        .join(MORSE_URL)
        .join("1.0.2")
        .join(DEFAULT_SPEC_NAME)
        .is_file());
}

#[cfg(unix)]
#[test]
fn test_downloaded_files_are_read_only() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());
    pm.install_url_pkg(None, "morse").unwrap();

    let spec_file = project
        .join(PROJECT_PACKAGES_PATH)
        .join(MORSE_URL)
        .join("1.0.2")
        .join(DEFAULT_SPEC_NAME);
    let mode = fs::metadata(&spec_file).unwrap().permissions().mode();
    assert_eq!(mode & 0o222, 0, "write bits still set: {mode:o}");
}

#[test]
fn test_cancellation_aborts_download() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    let cancellation = Cancellation::new();
    cancellation.cancel();
    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, cancellation);

    let result = pm.install_url_pkg(None, "morse");
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn test_missing_tag_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let mut descs = standard_remote(&remote);
    // A description whose tag does not exist in the remote.
    descs.push(desc("ghost", "github.com/toitware/ghost", "9.9.9", &[]));
    new_project(&project);

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui.clone(), Cancellation::new());

    let result = pm.install_url_pkg(None, "ghost");
    assert!(matches!(result, Err(Error::AlreadyReported)));
    assert!(ui
        .messages()
        .iter()
        .any(|message| message.contains("Error while cloning")));
}

#[test]
fn test_lock_prefix_missing_from_spec_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let descs = standard_remote(&remote);
    new_project(&project);

    fs::write(
        project.join(DEFAULT_LOCK_FILE_NAME),
        format!(
            "prefixes:\n  morse: toit-morse\npackages:\n  toit-morse:\n    url: {MORSE_URL}\n    version: 1.0.2\n"
        ),
    )
    .unwrap();

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui.clone(), Cancellation::new());

    let result = pm.install(false);
    assert!(matches!(result, Err(Error::AlreadyReported)));
    assert!(ui.messages()[0].contains("Lock file has prefix that isn't in package.yaml: 'morse'"));
}

#[test]
fn test_nested_package_download() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote");
    let project = tmp.path().join("project");
    let mut descs = standard_remote(&remote);
    new_project(&project);

    // A nested package lives below `<repo>.git/<subpath>` and is tagged
    // `<last-segment>-v<version>`.
    let nested_url = "github.com/toitware/test-pkg.git/bar/gee";
    let repo_dir = remote
        .join("github.com/toitware/test-pkg")
        .join("gee-v0.3.0");
    fs::create_dir_all(repo_dir.join("bar/gee/src")).unwrap();
    fs::write(
        repo_dir.join("bar/gee").join(DEFAULT_SPEC_NAME),
        "name: gee\ndescription: Nested package\n",
    )
    .unwrap();
    fs::write(repo_dir.join("bar/gee/src/lib.toit"), "main: null\n").unwrap();
    descs.push(desc("gee", nested_url, "0.3.0", &[]));

    let ui = Arc::new(CaptureUi::new());
    let pm = project_manager(&project, &remote, descs, ui, Cancellation::new());

    let (prefix, _) = pm.install_url_pkg(None, "gee").unwrap();
    assert_eq!(prefix, "gee");

    // Only the nested sub-tree is materialized.
    let pkg_dir = project
        .join(PROJECT_PACKAGES_PATH)
        .join("github.com/toitware/test-pkg.git/bar/gee")
        .join("0.3.0");
    assert!(pkg_dir.join(DEFAULT_SPEC_NAME).is_file());
    assert!(!pkg_dir.join("bar").exists());
}
