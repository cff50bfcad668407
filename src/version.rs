//! bakery protocol versions

use std::fmt::Display;

/// Version of the bakery protocol spoken by a client or a third party.
///
/// Version 0 predates explicit versioning. Versions 1 and 2 changed the
/// macaroon and caveat id wire encodings; version 3 added multi-operation
/// macaroon ids. Versions are backwardly compatible, so a participant may
/// always speak a version lower than the one it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V0,
    V1,
    V2,
    V3,
}

/// the most recent version understood by this implementation
pub const LATEST_VERSION: Version = Version::V3;

impl Version {
    pub fn as_u32(self) -> u32 {
        match self {
            Version::V0 => 0,
            Version::V1 => 1,
            Version::V2 => 2,
            Version::V3 => 3,
        }
    }

    /// Converts a wire integer to a version, clamping values above the
    /// latest known version. Versions are backwardly compatible so
    /// treating an unknown future version as the latest one is safe.
    pub fn from_u32_clamped(v: u32) -> Version {
        match v {
            0 => Version::V0,
            1 => Version::V1,
            2 => Version::V2,
            _ => Version::V3,
        }
    }
}

impl Default for Version {
    /// Version 0: the protocol spoken before versioning existed.
    fn default() -> Self {
        Version::V0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

impl serde::Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u32::deserialize(deserializer)?;
        Ok(Version::from_u32_clamped(v))
    }
}
