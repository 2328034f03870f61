//! Typed install job identifier.
//!
//! Format: `inst_{ulid}`, e.g. `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`. The ULID keeps
//! IDs time-ordered so log lines for consecutive installs sort naturally.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::EventError;

/// Identifier of one bundle installation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstallId(Ulid);

impl InstallId {
    /// The prefix for install IDs.
    pub const PREFIX: &'static str = "inst";

    /// Creates a fresh install ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an install ID in `{prefix}_{ulid}` form.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        let Some((prefix, ulid_str)) = s.split_once('_') else {
            return Err(EventError::InvalidId(format!("missing separator in '{s}'")));
        };

        if prefix != Self::PREFIX {
            return Err(EventError::InvalidId(format!(
                "expected prefix '{}', got '{prefix}'",
                Self::PREFIX
            )));
        }

        ulid_str
            .parse::<Ulid>()
            .map(Self)
            .map_err(|e| EventError::InvalidId(e.to_string()))
    }

    /// Returns the timestamp portion of the ULID in milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for InstallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for InstallId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for InstallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
