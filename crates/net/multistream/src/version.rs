//! Dotted protocol versions, ordered descending when several versions of
//! one protocol are on offer.

use std::cmp::Ordering;
use std::str::FromStr;

/// A `major.minor.patch` protocol version. Missing components parse as
/// zero; non-numeric components fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const ZERO: Self = Self {
        major: 0,
        minor: 0,
        patch: 0,
    };
}

impl FromStr for Version {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let mut next = || -> Result<u64, Self::Err> {
            parts.next().map_or(Ok(0), |p| p.parse())
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Split a protocol id of the form `/<name>/<version>` at its last
/// separator. The name itself may contain separators (`/ipfs/id/1.0.0`
/// splits into `ipfs/id` and `1.0.0`).
pub fn split_protocol_id(id: &str) -> Option<(&str, &str)> {
    let stripped = id.strip_prefix('/')?;
    let (name, version) = stripped.rsplit_once('/')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_order() {
        let a: Version = "6.7.0".parse().unwrap();
        let b: Version = "6.7.1".parse().unwrap();
        let c: Version = "10.0.0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!("1".parse::<Version>().unwrap(), Version { major: 1, minor: 0, patch: 0 });
        assert!("one.two".parse::<Version>().is_err());
    }

    #[test]
    fn split_ids() {
        assert_eq!(split_protocol_id("/mplex/6.7.0"), Some(("mplex", "6.7.0")));
        assert_eq!(split_protocol_id("/ipfs/id/1.0.0"), Some(("ipfs/id", "1.0.0")));
        assert_eq!(split_protocol_id("mplex"), None);
        assert_eq!(split_protocol_id("/mplex"), None);
    }
}
