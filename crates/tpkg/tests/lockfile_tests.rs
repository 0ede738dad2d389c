//! Lock-file serialization tests.

use std::fs;

use tpkg::lockfile::{LockFile, PackageEntry};
use tpkg::path::UriPath;
use tpkg::ui::{CaptureUi, NullUi};

fn sample_lock(path: &std::path::Path) -> LockFile {
    let mut lock = LockFile::new(path);
    lock.sdk = "^1.5.0".to_string();
    lock.packages.insert(
        "toit-morse".to_string(),
        PackageEntry {
            url: UriPath::from_url("github.com/toitware/toit-morse"),
            name: "morse".to_string(),
            version: "1.0.2".to_string(),
            hash: "8e5e9d37e70cbc6f3b16d7ec5d1b88df".to_string(),
            ..PackageEntry::default()
        },
    );
    lock.prefixes
        .insert("morse".to_string(), "toit-morse".to_string());
    lock
}

#[test]
fn test_read_write_is_bit_exact() {
    let ui = NullUi;
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("package.lock");

    let lock = sample_lock(&path);
    lock.write_to_file().unwrap();
    let written = fs::read(&path).unwrap();

    let reread = LockFile::read_file(&path, &ui).unwrap();
    reread.write_to_file().unwrap();
    assert_eq!(fs::read(&path).unwrap(), written);
}

#[cfg(unix)]
#[test]
fn test_unchanged_write_does_not_touch_file() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("package.lock");
    let lock = sample_lock(&path);
    lock.write_to_file().unwrap();

    // With the file read-only, a rewrite would fail; an unchanged write
    // must not open the file for writing at all.
    fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();
    lock.write_to_file().unwrap();

    // A changed write does fail on the read-only file, which proves the
    // previous call skipped the write.
    let mut changed = lock.clone();
    changed.sdk = "^2.0.0".to_string();
    assert!(changed.write_to_file().is_err());

    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
}

#[test]
fn test_read_rejects_url_without_version() {
    let ui = CaptureUi::new();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("package.lock");
    fs::write(
        &path,
        "prefixes:\n  morse: toit-morse\npackages:\n  toit-morse:\n    url: github.com/toitware/toit-morse\n",
    )
    .unwrap();

    assert!(LockFile::read_file(&path, &ui).is_err());
    assert_eq!(
        ui.messages(),
        vec!["Error: Invalid lock file: url without version"]
    );
}

#[test]
fn test_read_rejects_garbage() {
    let ui = CaptureUi::new();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("package.lock");
    fs::write(&path, "prefixes: [not, a, map]\n").unwrap();

    assert!(LockFile::read_file(&path, &ui).is_err());
    assert!(ui.messages()[0].contains("Failed to parse lock file"));
}

#[test]
fn test_empty_lock_round_trips() {
    let ui = NullUi;
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("package.lock");
    let lock = LockFile::new(&path);
    lock.write_to_file().unwrap();

    let reread = LockFile::read_file(&path, &ui).unwrap();
    assert!(reread.prefixes.is_empty());
    assert!(reread.packages.is_empty());
    assert!(reread.sdk.is_empty());
}
