// Copyright 2025 Machina Contributors.

//! Semantic version triples for state machine definitions
//!
//! Every registered machine definition is keyed by a `(major, minor, patch)`
//! triple with optional pre-release and build metadata. Ordering follows
//! SemVer precedence; build metadata is carried but ignored for ordering.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::errors::MachinaError;

/// Version triple identifying one machine definition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Version {
    /// Major version; a bump signals a breaking change
    pub major: u32,
    /// Minor version; a bump signals additive change
    pub minor: u32,
    /// Patch version
    pub patch: u32,
    /// Pre-release identifiers (dot-separated, alphanumeric + hyphen)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<String>,
    /// Build metadata; ignored for ordering and equality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl Version {
    /// Create a new release version
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// Attach pre-release identifiers (e.g. `"alpha.1"`)
    pub fn with_pre_release(mut self, pre: impl Into<String>) -> Self {
        self.pre_release = Some(pre.into());
        self
    }

    /// Attach build metadata (e.g. `"sha.5114f85"`)
    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// Parse from a string such as `1.2.3`, `1.2.3-rc.1`, or `1.2.3-rc.1+sha`
    pub fn parse(s: &str) -> Result<Self, MachinaError> {
        let invalid = || MachinaError::InvalidOperation {
            reason: format!("invalid version: {s}"),
        };

        let (core, build) = match s.split_once('+') {
            Some((c, b)) if !b.is_empty() => (c, Some(b.to_string())),
            Some(_) => return Err(invalid()),
            None => (s, None),
        };
        let (nums, pre) = match core.split_once('-') {
            Some((n, p)) if !p.is_empty() => (n, Some(p.to_string())),
            Some(_) => return Err(invalid()),
            None => (core, None),
        };

        let parts: Vec<&str> = nums.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        if let Some(pre) = &pre {
            let ok = pre
                .split('.')
                .all(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
            if !ok {
                return Err(invalid());
            }
        }

        Ok(Self {
            major: parts[0].parse().map_err(|_| invalid())?,
            minor: parts[1].parse().map_err(|_| invalid())?,
            patch: parts[2].parse().map_err(|_| invalid())?,
            pre_release: pre,
            build,
        })
    }

    /// Compatibility predicate: same major, and this minor does not exceed
    /// the other's minor
    pub fn compatible_with(&self, other: &Version) -> bool {
        self.major == other.major && self.minor <= other.minor
    }

    /// Whether upgrading from `from` to this version crosses a major boundary
    pub fn is_breaking_change_from(&self, from: &Version) -> bool {
        self.major > from.major
    }

    /// Weighted numeric distance between two triples; used by the bounded
    /// greedy migration-path search to pick the closest next hop
    pub fn distance(&self, other: &Version) -> u64 {
        let d = |a: u32, b: u32| u64::from(a.abs_diff(b));
        d(self.major, other.major) * 10_000 + d(self.minor, other.minor) * 100 + d(self.patch, other.patch)
    }

    /// Whether this is a pre-release version
    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = MachinaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

// SemVer precedence. Build metadata never participates, so equality and
// hashing are defined over (major, minor, patch, pre_release) only.

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        self.pre_release.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before the corresponding release
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => compare_pre_release(a, b),
            })
    }
}

fn compare_pre_release(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            // Fewer identifiers sorts first when the shared prefix is equal
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    // Numeric identifiers sort before alphanumeric ones
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
