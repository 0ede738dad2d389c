//! Package download
//!
//! Fetches a package, identified by URL and version, into the package
//! cache via the git transport. Nested packages (URLs of the form
//! `<repo>.git/<subpath>`) are checked out into a sibling temporary
//! directory on the same volume and the sub-tree is renamed into place, so
//! a partial tree is never visible under its canonical name.

use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::git::{Cancellation, CloneOptions, GitTransport};
use crate::ui::Ui;

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadOptions<'a> {
    /// Final location of the package sources.
    pub directory: &'a Path,
    pub url: &'a str,
    pub version: &'a str,
    /// Expected commit hash, if known.
    pub hash: Option<&'a str>,
    /// Leave the downloaded files writable.
    pub no_read_only: bool,
}

/// Splits a package URL into repository URL and nested path.
///
/// `github.com/toitware/test-pkg.git/bar/gee` decomposes into
/// `github.com/toitware/test-pkg` and `bar/gee`.
fn decompose_pkg_url(url: &str) -> (&str, Option<&str>) {
    match url.rfind(".git/") {
        Some(index) => (&url[..index], Some(&url[index + ".git/".len()..])),
        None => (url, None),
    }
}

/// Clears the write bits of every file (not directory) under `dir`.
fn make_contained_read_only(dir: &Path, ui: &dyn Ui) {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if entry.path() == dir || entry.file_type().is_dir() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(permissions.mode() & !0o222);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(true);
        if let Err(err) = fs::set_permissions(entry.path(), permissions) {
            ui.warning(&format!(
                "Error while setting '{}' to read-only: {}",
                entry.path().display(),
                err
            ));
        }
    }
}

/// Downloads the package given by `options.url`/`options.version` into
/// `options.directory`, removing any old data there first.
///
/// Returns the checked-out commit hash. On failure (including
/// cancellation) no partial tree is left behind.
pub fn download_package(
    transport: &dyn GitTransport,
    cancellation: &Cancellation,
    ui: &dyn Ui,
    options: DownloadOptions<'_>,
) -> Result<String> {
    cancellation.check()?;

    if options.directory.exists() {
        fs::remove_dir_all(options.directory).map_err(|err| {
            ui.report_error(&format!(
                "Failed to remove old package directory '{}': {}",
                options.directory.display(),
                err
            ))
        })?;
    }

    let (clone_url, nested_path) = decompose_pkg_url(options.url);
    let mut tag = options.version.to_string();
    if !tag.starts_with('v') {
        tag = format!("v{tag}");
    }

    // Nested packages check out into an adjacent temporary directory. It
    // must be on the same volume as the final target because the sub-tree
    // is renamed into position.
    let mut checkout_guard = None;
    let checkout_dir = match nested_path {
        Some(path) => {
            let last_segment = path.rsplit('/').next().unwrap_or(path);
            tag = format!("{}-v{}", last_segment, options.version);
            let base_dir = options.directory.parent().unwrap_or(Path::new("."));
            fs::create_dir_all(base_dir)?;
            let tmp = tempfile::Builder::new()
                .prefix("partial-tpkg-checkout")
                .tempdir_in(base_dir)
                .map_err(|err| {
                    ui.report_error(&format!(
                        "Failed to create temporary directory to download '{} - {}': {}",
                        options.url, options.version, err
                    ))
                })?;
            let dir = tmp.path().to_path_buf();
            checkout_guard = Some(tmp);
            dir
        }
        None => {
            fs::create_dir_all(options.directory).map_err(|err| {
                ui.report_error(&format!(
                    "Failed to create download directory '{}': {}",
                    options.directory.display(),
                    err
                ))
            })?;
            options.directory.to_path_buf()
        }
    };

    let remove_partial = || {
        let _ = fs::remove_dir_all(&checkout_dir);
        if checkout_dir != options.directory {
            let _ = fs::remove_dir_all(options.directory);
        }
    };

    debug!(url = options.url, version = options.version, tag = %tag, "downloading package");
    let clone_options = CloneOptions {
        url: clone_url.to_string(),
        hash: options.hash.map(str::to_string),
        tag: Some(tag.clone()),
        single_branch: true,
        depth: Some(1),
        ..CloneOptions::default()
    };
    let downloaded_hash = match transport.clone_repo(&checkout_dir, &clone_options) {
        Ok(hash) => hash,
        Err(err) => {
            remove_partial();
            return Err(ui.report_error(&format!(
                "Error while cloning '{}' with tag '{}': {}",
                options.url, tag, err
            )));
        }
    };

    if cancellation.is_cancelled() {
        remove_partial();
        return Err(Error::Cancelled);
    }

    if let Some(path) = nested_path {
        // Move the nested package into its final location.
        let nested = checkout_dir.join(path);
        if !nested.is_dir() {
            return Err(ui.report_error(&format!(
                "Repository '{}' does not have path '{}'",
                clone_url, path
            )));
        }
        fs::rename(&nested, options.directory).map_err(|_| {
            ui.report_error(&format!(
                "Failed to move nested package '{}' to its location '{}'",
                nested.display(),
                options.directory.display()
            ))
        })?;
    }
    drop(checkout_guard);

    if !options.no_read_only {
        make_contained_read_only(options.directory, ui);
    }
    Ok(downloaded_hash)
}
