//! Numeric version parsing and comparison

use crate::error::{Result, UpdateError};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const MAX_COMPONENTS: usize = 4;

static VERSION_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// A version as a tuple of up to four numbers (major.minor.build.revision).
///
/// Missing trailing components compare as zero, so `1.2` and `1.2.0` are equal.
#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let fail = |reason: &str| UpdateError::VersionParse {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(fail("empty version string"));
        }

        let mut parts = Vec::new();
        for component in trimmed.split('.') {
            if component.is_empty() {
                return Err(fail("empty component"));
            }
            // u32::from_str accepts a leading '+', which is not a version digit
            if !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail(&format!("'{}' is not a non-negative integer", component)));
            }
            let value = component
                .parse::<u32>()
                .map_err(|_| fail(&format!("component '{}' is out of range", component)))?;
            parts.push(value);
        }

        if parts.len() > MAX_COMPONENTS {
            return Err(fail(&format!(
                "expected at most {} components, found {}",
                MAX_COMPONENTS,
                parts.len()
            )));
        }

        Ok(Self { parts })
    }

    pub fn compare(&self, other: &Version) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    #[cfg(test)]
    pub fn components(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
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
        self.compare(other)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&text)
    }
}

/// Find the first dotted version number in free text such as `--version` output.
pub fn extract_version(text: &str) -> Option<Version> {
    let re = VERSION_PATTERN
        .get_or_init(|| Regex::new(r"\d+(?:\.\d+){1,3}").ok())
        .as_ref()?;
    re.find_iter(text)
        .find_map(|m| Version::parse(m.as_str()).ok())
}
