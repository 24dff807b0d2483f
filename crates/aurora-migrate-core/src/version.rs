//! Four-component schema versions.
//!
//! A [`Version`] is `major.minor.revision.build`. Text may omit trailing
//! components (`"1.2"` is `1.2.0.0`), but at least two must be present.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a version string does not follow the
/// `a.b[.c[.d]]` numeric grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct VersionFormatError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

impl VersionFormatError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// An immutable `major.minor.revision.build` version.
///
/// Equality, ordering and hashing only look at the four numbers. The number
/// of components written in the source text is kept so `Display` gives the
/// text back unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Version {
    major: u32,
    minor: u32,
    revision: u32,
    build: u32,
    written: u8,
}

impl Version {
    /// Create a version from all four components.
    pub const fn new(major: u32, minor: u32, revision: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build,
            written: 4,
        }
    }

    /// Parse `a.b`, `a.b.c` or `a.b.c.d`.
    pub fn parse(input: &str) -> Result<Self, VersionFormatError> {
        if input.is_empty() {
            return Err(VersionFormatError::new(input, "empty string"));
        }

        let mut parts = [0u32; 4];
        let mut count = 0usize;
        for piece in input.split('.') {
            if count == 4 {
                return Err(VersionFormatError::new(input, "more than four components"));
            }
            if piece.is_empty() {
                return Err(VersionFormatError::new(input, "empty component"));
            }
            if !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionFormatError::new(input, "components must be decimal digits"));
            }
            parts[count] = piece
                .parse::<u32>()
                .map_err(|_| VersionFormatError::new(input, "component out of range"))?;
            count += 1;
        }

        if count < 2 {
            return Err(VersionFormatError::new(input, "at least major.minor is required"));
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            revision: parts[2],
            build: parts[3],
            written: count as u8,
        })
    }

    /// Major component.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor component.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Revision component.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Build component.
    pub fn build(&self) -> u32 {
        self.build
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.revision, self.build)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
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
        self.key().cmp(&other.key())
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl FromStr for Version {
    type Err = VersionFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if self.written >= 3 {
            write!(f, ".{}", self.revision)?;
        }
        if self.written >= 4 {
            write!(f, ".{}", self.build)?;
        }
        Ok(())
    }
}

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}
