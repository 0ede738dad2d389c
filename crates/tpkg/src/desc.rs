//! Package descriptions
//!
//! A description is a registry record for one version of a package. It
//! contains everything needed to download and install the package as well
//! as its dependency information; package resolution only ever needs
//! descriptions, never sources.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::semver::{sdk_constraint_to_min_sdk, Constraint, Version};
use crate::spec::{DependencyMap, Spec};
use crate::ui::Ui;
use crate::{DEFAULT_SPEC_NAME, DESCRIPTION_FILE_NAME, PACKAGE_DESCRIPTION_DIR};

/// A registry record describing one version of a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Desc {
    /// The path of the description file, if any.
    #[serde(skip)]
    path: Option<PathBuf>,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,

    /// The clone URL of the package. Uniquely identifies the package (all
    /// its versions) in the registry.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "DescEnvironment::is_empty")]
    pub environment: DescEnvironment,

    /// The git hash of the package.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "dependencies")]
    pub deps: Vec<DescPackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescEnvironment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdk: String,
}

impl DescEnvironment {
    pub fn is_empty(&self) -> bool {
        self.sdk.is_empty()
    }
}

/// One dependency of a described package. The version field is a
/// constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescPackage {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// How to treat local path dependencies when scraping a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowLocalDeps {
    Allow,
    Report,
    Disallow,
}

impl Desc {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
        sdk: impl Into<String>,
        license: impl Into<String>,
        hash: impl Into<String>,
        deps: Vec<DescPackage>,
    ) -> Desc {
        Desc {
            path: None,
            name: name.into(),
            description: description.into(),
            license: license.into(),
            url: url.into(),
            version: version.into(),
            environment: DescEnvironment { sdk: sdk.into() },
            hash: hash.into(),
            deps,
        }
    }

    /// Parses a description from YAML text and validates it.
    pub fn parse_str(text: &str, ui: &dyn Ui) -> Result<Desc> {
        Self::parse_impl(text, None, ui)
    }

    /// Reads and parses the description file at `path`.
    pub fn parse_file(path: impl Into<PathBuf>, ui: &dyn Ui) -> Result<Desc> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        Self::parse_impl(&text, Some(path), ui)
    }

    fn parse_impl(text: &str, path: Option<PathBuf>, ui: &dyn Ui) -> Result<Desc> {
        let fail = |message: &str| -> Error {
            match &path {
                Some(path) => ui.report_error(&format!(
                    "Failed to parse package description '{}': {}",
                    path.display(),
                    message
                )),
                None => {
                    ui.report_error(&format!("Failed to parse package description: {message}"))
                }
            }
        };

        let mut desc: Desc = match serde_yaml::from_str(text) {
            Ok(desc) => desc,
            Err(err) => return Err(fail(&err.to_string())),
        };
        desc.path = path;
        desc.validate(ui)?;

        let version = Version::parse(&desc.version).map_err(|_| match &desc.path {
            Some(path) => ui.report_error(&format!(
                "Invalid version in '{}': {}",
                path.display(),
                desc.version
            )),
            None => ui.report_error(&format!("Invalid version: {}", desc.version)),
        })?;
        // Canonicalize the version.
        desc.version = version.to_string();

        for dep in &desc.deps {
            if !dep.version.is_empty() && Constraint::parse(&dep.version).is_err() {
                return Err(match &desc.path {
                    Some(path) => ui.report_error(&format!(
                        "Invalid constraint in '{}': {}",
                        path.display(),
                        dep.version
                    )),
                    None => {
                        ui.report_error(&format!("Invalid constraint: {}", dep.version))
                    }
                });
            }
        }

        Ok(desc)
    }

    pub fn validate(&self, ui: &dyn Ui) -> Result<()> {
        if self.name.is_empty() {
            return Err(match &self.path {
                Some(path) => ui.report_error(&format!(
                    "Description at '{}' is missing a name",
                    path.display()
                )),
                None => ui.report_error("Description is missing a name"),
            });
        }
        if self.version.is_empty() {
            return Err(ui.report_error(&format!("Description '{}' is missing a version", self.name)));
        }
        if self.url.is_empty() {
            return Err(ui.report_error(&format!("Description '{}' has an empty URL", self.name)));
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

    /// The minimal SDK version this package requires, if any.
    pub fn min_sdk(&self) -> Result<Option<Version>> {
        sdk_constraint_to_min_sdk(&self.environment.sdk)
    }

    /// Directory, inside a registry, where this description belongs.
    pub fn package_dir(&self) -> PathBuf {
        Path::new(PACKAGE_DESCRIPTION_DIR)
            .join(crate::cache::url_version_to_rel_path(&self.url, &self.version))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the description below `out_dir`, creating the registry
    /// layout. Returns the written path.
    pub fn write_in_dir(&mut self, out_dir: &Path) -> Result<PathBuf> {
        let dir = out_dir.join(self.package_dir());
        fs::create_dir_all(&dir)?;
        let desc_path = dir.join(DESCRIPTION_FILE_NAME);
        fs::write(&desc_path, self.to_yaml()?)?;
        self.path = Some(desc_path.clone());
        Ok(desc_path)
    }

    /// Compares descriptions by identity: URL first, then version.
    /// Invalid versions are equal to themselves and less than valid ones.
    pub fn id_cmp(&self, other: &Desc) -> Ordering {
        if self.url == other.url {
            return match (Version::parse(&self.version), Version::parse(&other.version)) {
                (Err(_), Err(_)) => Ordering::Equal,
                (Err(_), Ok(_)) => Ordering::Less,
                (Ok(_), Err(_)) => Ordering::Greater,
                (Ok(a), Ok(b)) => a.cmp(&b),
            };
        }
        self.url.cmp(&other.url)
    }

    /// Builds a description from the package sources at `path`.
    ///
    /// The URL, version, and hash are not known from sources alone and are
    /// left for the caller to fill in.
    pub fn scrape_from_dir(
        path: &Path,
        allow_local_deps: AllowLocalDeps,
        ui: &dyn Ui,
    ) -> Result<Desc> {
        if !path.is_dir() {
            return Err(ui.report_error(&format!("Path '{}' is not a directory", path.display())));
        }
        let spec_path = path.join(DEFAULT_SPEC_NAME);
        if !spec_path.is_file() {
            return Err(ui.report_error(&format!(
                "Missing '{}' file in '{}'",
                DEFAULT_SPEC_NAME,
                path.display()
            )));
        }
        let spec = Spec::read_file(&spec_path, ui)?;

        if allow_local_deps != AllowLocalDeps::Allow {
            for dep in spec.deps.values() {
                if !dep.path.is_empty() {
                    if allow_local_deps == AllowLocalDeps::Report {
                        ui.warning(&format!("Dependency to local path: '{}'", dep.path));
                    } else {
                        return Err(ui.report_error(&format!(
                            "Dependency to local path: '{}'",
                            dep.path
                        )));
                    }
                }
            }
        }

        // Packages must have a 'src' directory.
        if !path.join("src").is_dir() {
            return Err(ui.report_error(&format!(
                "Missing 'src' directory in '{}'",
                path.display()
            )));
        }

        if spec.name.is_empty() && spec.description.is_empty() {
            return Err(ui.report_error("Missing name and description"));
        } else if spec.name.is_empty() {
            return Err(ui.report_error("Missing name"));
        } else if spec.description.is_empty() {
            return Err(ui.report_error("Missing description"));
        }
        if spec.license.is_empty() {
            ui.warning("Missing license");
        }

        Ok(Desc::new(
            spec.name.clone(),
            spec.description.clone(),
            "",
            "",
            spec.environment.sdk.clone(),
            spec.license.clone(),
            "",
            map_spec_deps_to_desc_deps(&spec.deps),
        ))
    }
}

/// Converts spec dependencies into description dependencies, sorted for
/// stable output. Local-path dependencies show up with a placeholder URL.
pub fn map_spec_deps_to_desc_deps(spec_deps: &DependencyMap) -> Vec<DescPackage> {
    let mut result: Vec<DescPackage> = spec_deps
        .values()
        .map(|pkg| DescPackage {
            url: if pkg.url.is_empty() && !pkg.path.is_empty() {
                "<local path>".to_string()
            } else {
                pkg.url.clone()
            },
            version: pkg.version.clone(),
        })
        .collect();
    result.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.version.cmp(&b.version)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::{CaptureUi, NullUi};

    const MORSE_DESC: &str = "\
name: morse
description: Morse code library
license: MIT
url: github.com/toitware/toit-morse
version: 1.0.2
dependencies:
  - url: github.com/toitware/toit-fonts
    version: ^1.0.0
";

    #[test]
    fn test_parse() {
        let ui = NullUi;
        let desc = Desc::parse_str(MORSE_DESC, &ui).unwrap();
        assert_eq!(desc.name, "morse");
        assert_eq!(desc.url, "github.com/toitware/toit-morse");
        assert_eq!(desc.version, "1.0.2");
        assert_eq!(desc.deps.len(), 1);
        assert_eq!(desc.deps[0].url, "github.com/toitware/toit-fonts");
    }

    #[test]
    fn test_parse_canonicalizes_version() {
        let ui = NullUi;
        let text = MORSE_DESC.replace("version: 1.0.2", "version: v1.0.2");
        let desc = Desc::parse_str(&text, &ui).unwrap();
        assert_eq!(desc.version, "1.0.2");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let ui = CaptureUi::new();
        let result = Desc::parse_str("description: no name\nurl: u\nversion: 1.0.0\n", &ui);
        assert!(result.is_err());
        assert!(ui.messages()[0].contains("missing a name"));

        let ui = CaptureUi::new();
        let result = Desc::parse_str("name: x\nurl: u\nversion: bogus\n", &ui);
        assert!(result.is_err());
        assert!(ui.messages().last().unwrap().contains("Invalid version"));
    }

    #[test]
    fn test_parse_rejects_bad_sdk() {
        let ui = CaptureUi::new();
        let text = format!("{MORSE_DESC}environment:\n  sdk: 1.0.0\n");
        let result = Desc::parse_str(&text, &ui);
        assert!(result.is_err());
        assert!(ui.messages().last().unwrap().contains("'^version'"));
    }

    #[test]
    fn test_round_trip() {
        let ui = NullUi;
        let desc = Desc::parse_str(MORSE_DESC, &ui).unwrap();
        let yaml = desc.to_yaml().unwrap();
        let reparsed = Desc::parse_str(&yaml, &ui).unwrap();
        assert_eq!(desc, reparsed);
    }

    #[test]
    fn test_id_cmp() {
        let ui = NullUi;
        let a = Desc::parse_str(MORSE_DESC, &ui).unwrap();
        let mut b = a.clone();
        b.version = "1.1.0".to_string();
        assert_eq!(a.id_cmp(&b), Ordering::Less);
        let mut c = a.clone();
        c.url = "github.com/toitware/zz".to_string();
        assert_eq!(a.id_cmp(&c), Ordering::Less);
    }

    #[test]
    fn test_package_dir() {
        let ui = NullUi;
        let desc = Desc::parse_str(MORSE_DESC, &ui).unwrap();
        assert_eq!(
            desc.package_dir(),
            PathBuf::from("packages/github.com/toitware/toit-morse/1.0.2")
        );
    }
}
