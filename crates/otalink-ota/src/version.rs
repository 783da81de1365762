use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// A firmware version as produced by `git describe --tags --dirty`.
///
/// Accepts `1.2.3`, `v1.2.3`, `v1.2.3-dirty`, `v1.2.3-5-ga1b2c3d` and
/// `v1.2.3-5-ga1b2c3d-dirty`. Equality covers every field; use
/// [`FirmwareVersion::cmp_triple`] to order releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    /// Abbreviated commit hash from a git-describe suffix.
    pub git_hash: Option<String>,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid firmware version {0:?}")]
pub struct ParseVersionError(String);

impl FirmwareVersion {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            git_hash: None,
            dirty: false,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ParseVersionError> {
        let invalid = || ParseVersionError(input.to_owned());
        let s = input.trim();
        let s = s.strip_prefix('v').unwrap_or(s);

        let (s, dirty) = match s.strip_suffix("-dirty") {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        let mut parts = s.splitn(3, '-');
        let triple = parts.next().ok_or_else(invalid)?;
        let git_hash = match (parts.next(), parts.next()) {
            (None, None) => None,
            (Some(distance), Some(hash)) => {
                distance.parse::<u32>().map_err(|_| invalid())?;
                let hash = hash.strip_prefix('g').ok_or_else(invalid)?;
                if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid());
                }
                Some(hash.to_owned())
            }
            _ => return Err(invalid()),
        };

        let mut numbers = triple.split('.').map(|n| n.parse::<u8>());
        let (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) =
            (numbers.next(), numbers.next(), numbers.next(), numbers.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            major,
            minor,
            patch,
            git_hash,
            dirty,
        })
    }

    /// True when `other` is strictly newer than `self`.
    pub fn is_update_available(&self, other: &FirmwareVersion) -> bool {
        other.cmp_triple(self).is_gt()
    }

    /// Compare release numbers only, ignoring the git hash and dirty flag.
    pub fn cmp_triple(&self, other: &FirmwareVersion) -> Ordering {
        self.triple().cmp(&other.triple())
    }

    fn triple(&self) -> (u8, u8, u8) {
        (self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(hash) = &self.git_hash {
            write!(f, "-g{hash}")?;
        }
        if self.dirty {
            f.write_str("-dirty")?;
        }
        Ok(())
    }
}
