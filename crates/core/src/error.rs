//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns a [`CoreError`] variant
//! rather than a formatted string; callers in the collaborator layer can
//! match on the kind and decide policy (retry, surface to the operator,
//! fall back to the previous configuration) instead of parsing messages.

use crate::zone::ZoneId;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A schedule entry or hardware configuration fails the invariants of
    /// the data model. The caller should keep the previously loaded
    /// configuration in effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A time code could not be resolved to an instant.
    #[error("could not resolve time code '{code}' on {date}")]
    Resolution { code: String, date: String },

    /// Reading or writing the Active-Run Snapshot failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The hardware driver returned an error while mutating a zone.
    #[error("hardware error on zone {zone}: {source}")]
    Hardware {
        zone: ZoneId,
        #[source]
        source: anyhow::Error,
    },

    /// `start_manual` was called against a zone that already has an
    /// Active Run.
    #[error("zone {0} already has an active run")]
    Overlap(ZoneId),
}

impl CoreError {
    pub fn resolution(code: impl Into<String>, date: impl fmt::Display) -> Self {
        CoreError::Resolution {
            code: code.into(),
            date: date.to_string(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        CoreError::Persistence(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn hardware(zone: ZoneId, source: anyhow::Error) -> Self {
        CoreError::Hardware { zone, source }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_round_trips() {
        let e = CoreError::validation("duplicate output identifier");
        assert_eq!(e.to_string(), "validation failed: duplicate output identifier");
    }

    #[test]
    fn overlap_carries_zone_id() {
        let e = CoreError::Overlap(ZoneId::new(4));
        assert_eq!(e.to_string(), "zone 4 already has an active run");
    }

    #[test]
    fn resolution_carries_code_and_date() {
        let e = CoreError::resolution("SUNSET+x", "2026-07-28");
        assert_eq!(
            e.to_string(),
            "could not resolve time code 'SUNSET+x' on 2026-07-28"
        );
    }
}
