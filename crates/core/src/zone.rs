//! Zone identity and static configuration (data model §3).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A zone number, 1..=8. Serializes as a bare decimal string so it can be
/// used as a JSON object key in the schedule document and the Active-Run
/// Snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(u8);

impl ZoneId {
    pub const MAX_ZONES: u8 = 8;

    pub fn new(n: u8) -> Self {
        ZoneId(n)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ZoneId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ZoneId(s.parse()?))
    }
}

impl Serialize for ZoneId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ZoneId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ZoneIdVisitor;

        impl<'de> Visitor<'de> for ZoneIdVisitor {
            type Value = ZoneId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a zone identifier (string or integer 1..=8)")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ZoneId, E> {
                v.parse::<u8>()
                    .map(ZoneId)
                    .map_err(|_| de::Error::custom(format!("invalid zone identifier '{v}'")))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ZoneId, E> {
                Ok(ZoneId(v as u8))
            }
        }

        deserializer.deserialize_any(ZoneIdVisitor)
    }
}

/// Electrical polarity of a zone's relay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Polarity {
    ActiveLow,
    ActiveHigh,
}

impl Polarity {
    /// Whether the physical output level must be electrically *low* to
    /// energise the zone.
    pub fn on_is_low(self) -> bool {
        matches!(self, Polarity::ActiveLow)
    }
}

/// Operating mode of a zone, independent of its schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneMode {
    Disabled,
    ManualScheduled,
    Smart,
}
