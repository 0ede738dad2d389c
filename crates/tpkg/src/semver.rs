//! Semantic versioning parser and constraint matching
//!
//! Versions are dotted numeric tuples of arbitrary length with optional
//! pre-release and build metadata. Constraints are conjunctions of
//! comparator ranges; the caret form `^v` and bare partial versions expand
//! into ranges during parsing, so every parsed constraint is a plain
//! conjunction.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Semantic version with an arbitrary number of numeric segments.
///
/// Two versions whose segments differ only in trailing zeros compare equal
/// (`1.2` == `1.2.0`), but each keeps its own textual form.
#[derive(Debug, Clone)]
pub struct Version {
    segments: Vec<u64>,
    prerelease: Option<String>,
    build: Option<String>,
}

impl Version {
    /// Create a three-segment version without pre-release or build metadata.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            segments: vec![major, minor, patch],
            prerelease: None,
            build: None,
        }
    }

    /// Parse a version string.
    ///
    /// Accepts an optional leading `v`, then dotted numeric segments,
    /// then optional `-prerelease` and `+build` parts.
    pub fn parse(s: &str) -> Result<Self> {
        let original = s;
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);

        let (s, build) = match s.split_once('+') {
            Some((rest, build)) if !build.is_empty() => (rest, Some(build.to_string())),
            Some(_) => return Err(Error::MalformedVersion(original.to_string())),
            None => (s, None),
        };

        let (s, prerelease) = match s.split_once('-') {
            Some((rest, pre)) if !pre.is_empty() => (rest, Some(pre.to_string())),
            Some(_) => return Err(Error::MalformedVersion(original.to_string())),
            None => (s, None),
        };

        if s.is_empty() {
            return Err(Error::MalformedVersion(original.to_string()));
        }

        let mut segments = Vec::new();
        for part in s.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::MalformedVersion(original.to_string()));
            }
            let n = part
                .parse()
                .map_err(|_| Error::MalformedVersion(original.to_string()))?;
            segments.push(n);
        }

        Ok(Version {
            segments,
            prerelease,
            build,
        })
    }

    /// The numeric segments, as given.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// The first segment.
    pub fn major(&self) -> u64 {
        self.segments[0]
    }

    /// The pre-release part, if any.
    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    /// Whether this is a pre-release version.
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// The smallest version that is not semver-compatible with this one:
    /// the leftmost non-zero segment incremented, all following segments
    /// zeroed. Used as the exclusive upper bound of caret ranges.
    fn next_incompatible(&self) -> Version {
        let mut segments = self.segments.clone();
        let mut bumped = false;
        for segment in segments.iter_mut() {
            if bumped {
                *segment = 0;
            } else if *segment != 0 {
                *segment += 1;
                bumped = true;
            }
        }
        Version {
            segments,
            prerelease: None,
            build: None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Missing segments count as zero; build metadata is ignored.
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => compare_prerelease(a, b),
        }
    }
}

/// Pre-release ordering per semver: dot-separated identifiers compare
/// numerically when both are numeric, lexically otherwise, and numeric
/// identifiers sort below alphanumeric ones.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut a_parts = a.split('.');
    let mut b_parts = b.split('.');
    loop {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Comparison operator of a single range term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    fn check(self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
        }
    }
}

/// A single `op version` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    op: Op,
    version: Version,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A conjunction of range terms.
///
/// Parsed from `term ("," term)*` where a term is `^version`,
/// `op version`, or a bare version. A bare version with fewer than three
/// segments is an install-style range (`1` accepts `>=1, <2.0.0`; `0.5`
/// accepts `>=0.5, <0.6.0`); with three or more segments it is exact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Constraint {
    ranges: Vec<Range>,
}

impl Constraint {
    /// The empty constraint, satisfied by every version.
    pub fn any() -> Self {
        Constraint { ranges: Vec::new() }
    }

    /// Whether this constraint accepts every version.
    pub fn is_any(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Parse a constraint string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for term in s.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(Error::MalformedConstraint(s.to_string()));
            }
            parse_term(term, &mut ranges)
                .map_err(|_| Error::MalformedConstraint(s.to_string()))?;
        }
        Ok(Constraint { ranges })
    }

    /// Check whether a version satisfies every range of this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.ranges
            .iter()
            .all(|range| range.op.check(version.cmp(&range.version)))
    }
}

// The printed form is the canonical expansion and re-parses to the same
// constraint (e.g. "^1.0.0" prints as ">=1.0.0,<2.0.0").
impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for range in &self.ranges {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{range}")?;
            first = false;
        }
        Ok(())
    }
}

fn parse_term(term: &str, ranges: &mut Vec<Range>) -> Result<()> {
    if let Some(rest) = term.strip_prefix('^') {
        let version = Version::parse(rest.trim())?;
        let upper = version.next_incompatible();
        ranges.push(Range {
            op: Op::Ge,
            version,
        });
        ranges.push(Range {
            op: Op::Lt,
            version: upper,
        });
        return Ok(());
    }

    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        ("!=", Op::Ne),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = term.strip_prefix(prefix) {
            let version = Version::parse(rest.trim())?;
            ranges.push(Range { op, version });
            return Ok(());
        }
    }

    // Bare version: install-style range for partial versions, exact
    // otherwise. The dot count of the textual form decides, so that
    // "1.2.3" stays exact even though "1.2" is a range.
    let version = Version::parse(term)?;
    let dots = term.matches('.').count();
    let upper = match dots {
        0 => Some(Version::new(version.major() + 1, 0, 0)),
        1 => {
            let segments = version.segments();
            let minor = segments.get(1).copied().unwrap_or(0);
            Some(Version::new(segments[0], minor + 1, 0))
        }
        _ => None,
    };
    match upper {
        Some(upper) => {
            ranges.push(Range {
                op: Op::Ge,
                version,
            });
            ranges.push(Range {
                op: Op::Lt,
                version: upper,
            });
        }
        None => ranges.push(Range {
            op: Op::Eq,
            version,
        }),
    }
    Ok(())
}

/// Converts an SDK constraint of the form `^version` into the minimal SDK
/// version it requires. An empty constraint means no requirement.
pub fn sdk_constraint_to_min_sdk(sdk: &str) -> Result<Option<Version>> {
    if sdk.is_empty() {
        return Ok(None);
    }
    let rest = sdk
        .strip_prefix('^')
        .ok_or_else(|| Error::MalformedConstraint(sdk.to_string()))?;
    Ok(Some(Version::parse(rest)?))
}
