//! Active-Run Snapshot persistence (§4.E, §6): the on-disk serialisation of
//! the Active-Run Registry, rewritten synchronously on every mutation so a
//! crash or restart can recover in-flight runs.
//!
//! The write path mirrors the teacher's own `Db::backup` idiom (write to a
//! sibling `.tmp` file, then `rename` into place) so a reader never observes
//! a half-written document, applied here to a small JSON document instead
//! of a SQLite file.

use crate::registry::Origin;
use crate::zone::ZoneId;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One entry of the persisted snapshot (§6): `{end_time, type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRun {
    pub end_time: DateTime<FixedOffset>,
    #[serde(rename = "type")]
    pub origin: Origin,
}

pub type Snapshot = HashMap<ZoneId, PersistedRun>;

/// Load the snapshot at `path`. Missing files, truncated files, and any
/// other shape that doesn't parse are all treated as an empty snapshot
/// rather than an error (§7 Persistence: "reads on startup: treat as
/// empty snapshot").
pub fn load(path: &Path) -> Snapshot {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Snapshot::new(),
    };
    if contents.trim().is_empty() {
        return Snapshot::new();
    }
    serde_json::from_str(&contents).unwrap_or_default()
}

/// Write the snapshot to `path` via write-temp-then-rename so readers never
/// observe a partially written document. Errors are returned to the caller,
/// which per §7 logs and continues — in-memory state stays authoritative
/// for the life of the process even if this write fails.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_string_pretty(snapshot).context("serialise active-run snapshot")?;
    std::fs::write(&tmp_path, body)
        .with_context(|| format!("write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}
