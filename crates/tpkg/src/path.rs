//! Compiler paths and URI paths
//!
//! A compiler path is a path the compiler recognizes: absolute paths start
//! with `/` and the segment separator is `/`, independent of the OS.
//!
//! A URI path is a URL encoded so that it can be used as a `/`-separated
//! filesystem path on every supported platform. It never contains `:` or a
//! Windows-reserved device name unescaped, and it can always be converted
//! back to the original URL. Lock files store URI paths so the compiler can
//! locate dependent packages.

use std::fmt;
use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// Characters escaped inside a URL segment: everything except unreserved
/// characters. Notably includes `:`, which is illegal in Windows paths.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// File names that Windows reserves for devices, in upper case.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// An OS-independent, `/`-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilerPath(String);

impl CompilerPath {
    /// Converts a file path into a compiler path.
    pub fn from_file_path(path: impl AsRef<Path>) -> Self {
        let s = path.as_ref().to_string_lossy().into_owned();
        CompilerPath(to_compiler_path(&s, cfg!(windows)))
    }

    /// Converts the compiler path back into a platform file path.
    pub fn to_file_path(&self) -> PathBuf {
        from_compiler_path(&self.0, cfg!(windows))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CompilerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_compiler_path(path: &str, windows: bool) -> String {
    if !windows {
        return path.to_string();
    }
    let slashed = path.replace('\\', "/");
    // Windows absolute paths (drive letter or UNC) gain a leading '/'.
    let is_abs = slashed.starts_with("//")
        || (slashed.len() >= 2 && slashed.as_bytes()[1] == b':');
    if is_abs && !slashed.starts_with('/') {
        format!("/{slashed}")
    } else {
        slashed
    }
}

fn from_compiler_path(path: &str, windows: bool) -> PathBuf {
    if !windows {
        return PathBuf::from(path);
    }
    let stripped = path.strip_prefix('/').unwrap_or(path);
    PathBuf::from(stripped.replace('/', "\\"))
}

/// A URL escaped for use as a `/`-separated filesystem path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UriPath(String);

impl UriPath {
    /// Escapes a URL into a URI path.
    ///
    /// Each `/`-segment is percent-escaped. Segments that are empty, match
    /// a reserved Windows device name, or end in `.` get a literal `%`
    /// appended, which makes them valid file names without clashing with
    /// any other escaped segment.
    pub fn from_url(url: &str) -> Self {
        let segments: Vec<String> = url
            .split('/')
            .map(|segment| {
                let mut escaped = utf8_percent_encode(segment, SEGMENT).to_string();
                let needs_marker = escaped.is_empty()
                    || RESERVED_NAMES.contains(&escaped.to_uppercase().as_str())
                    || escaped.ends_with('.');
                if needs_marker {
                    escaped.push('%');
                }
                escaped
            })
            .collect();
        UriPath(segments.join("/"))
    }

    /// Escapes a file path into a URI path.
    pub fn from_file_path(path: impl AsRef<Path>) -> Self {
        let s = path.as_ref().to_string_lossy().into_owned();
        let slashed = if cfg!(windows) {
            s.replace('\\', "/")
        } else {
            s
        };
        Self::from_url(&slashed)
    }

    /// Undoes the escaping of [`UriPath::from_url`].
    ///
    /// A trailing `%` marker is stripped before decoding; malformed escape
    /// sequences are left as literal text.
    pub fn to_url(&self) -> String {
        let segments: Vec<String> = self
            .0
            .split('/')
            .map(|segment| {
                let segment = segment.strip_suffix('%').unwrap_or(segment);
                percent_decode_str(segment).decode_utf8_lossy().into_owned()
            })
            .collect();
        segments.join("/")
    }

    /// The URI path as a platform file path.
    pub fn to_file_path(&self) -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(self.0.replace('/', "\\"))
        } else {
            PathBuf::from(&self.0)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UriPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lexically normalizes a path: removes `.` components and resolves `..`
/// against preceding normal components. Leading `..` components are kept.
/// The empty path normalizes to `.`.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Lexically computes `target` relative to `base`. Both paths must be
/// either absolute or relative. Returns `None` when no lexical answer
/// exists.
pub(crate) fn lexical_relative(base: &Path, target: &Path) -> Option<PathBuf> {
    use std::path::Component;
    let base = clean_path(base);
    let target = clean_path(target);
    if base.is_absolute() != target.is_absolute() {
        return None;
    }
    if base == Path::new(".") {
        return Some(target);
    }
    let base_components: Vec<Component> = base.components().collect();
    let target_components: Vec<Component> = target.components().collect();
    let mut common = 0;
    while common < base_components.len()
        && common < target_components.len()
        && base_components[common] == target_components[common]
    {
        common += 1;
    }
    // A remaining `..` in the base leaves the answer unknowable.
    if base_components[common..]
        .iter()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    let mut result = PathBuf::new();
    for _ in common..base_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component);
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    Some(result)
}
