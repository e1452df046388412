//! Active-Run Registry (component E, §4.E): the in-memory truth about which
//! zones are currently energised, when each ends, and whether the run is
//! manual or scheduled. Every mutation is persisted to the Active-Run
//! Snapshot so a restart can recover in-flight runs (§3, §6).
//!
//! Locking discipline follows §5: the registry lock (`inner`) is held only
//! to read or update the in-memory map. Hardware mutations and snapshot
//! writes happen with the lock released — see the per-operation comments
//! below for which order each one uses.

use crate::error::{CoreError, CoreResult};
use crate::hardware::HardwareDriver;
use crate::snapshot::{self, PersistedRun, Snapshot};
use crate::zone::ZoneId;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// How a run was brought up (§3 Active Run, §6 snapshot `type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Manual,
    Scheduled,
}

/// Why a run is being stopped. Only `ManualCancel` touches the Cancellation
/// Set (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Expired,
    ManualCancel,
    Emergency,
}

/// A currently-energised zone (§3 Active Run).
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub zone: ZoneId,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub origin: Origin,
}

impl ActiveRun {
    pub fn remaining(&self, now: DateTime<FixedOffset>) -> StdDuration {
        (self.end - now).to_std().unwrap_or(StdDuration::ZERO)
    }
}

/// Defensive-copy status record for one zone (§6 `get_zone_status`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub active: bool,
    pub origin: Option<Origin>,
    pub remaining_seconds: u64,
    pub end_time: Option<DateTime<FixedOffset>>,
}

impl ZoneStatus {
    fn inactive() -> Self {
        ZoneStatus {
            active: false,
            origin: None,
            remaining_seconds: 0,
            end_time: None,
        }
    }
}

struct Inner {
    runs: HashMap<ZoneId, ActiveRun>,
    cancelled: HashSet<ZoneId>,
}

/// The Active-Run Registry. Owns the process's only [`HardwareDriver`]
/// handle (normally a [`crate::pump::PumpCoupledDriver`]) so it remains the
/// single writer to the physical outputs (§5 Shared-resource policy) — an
/// explicitly constructed component rather than a process-global, per
/// SPEC_FULL.md §9's redesign of the source's module-level singletons.
pub struct Registry {
    inner: Mutex<Inner>,
    driver: Mutex<Box<dyn HardwareDriver>>,
    snapshot_path: PathBuf,
}

/// The gap `expire_due` leaves between consecutive stops so pump inspection
/// observes a stable state (§4.E).
const EXPIRE_SETTLE_GAP: StdDuration = StdDuration::from_millis(100);

impl Registry {
    pub fn new(driver: Box<dyn HardwareDriver>, snapshot_path: PathBuf) -> Self {
        Registry {
            inner: Mutex::new(Inner {
                runs: HashMap::new(),
                cancelled: HashSet::new(),
            }),
            driver: Mutex::new(driver),
            snapshot_path,
        }
    }

    async fn persist(&self) {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner
                .runs
                .iter()
                .map(|(zone, run)| {
                    (
                        *zone,
                        PersistedRun {
                            end_time: run.end,
                            origin: run.origin,
                        },
                    )
                })
                .collect::<Snapshot>()
        };
        if let Err(e) = snapshot::save(&self.snapshot_path, &snapshot) {
            warn!(error = %e, "failed to persist active-run snapshot; in-memory state remains authoritative");
        }
    }

    /// Start a run (manual or scheduled). Rejects with [`CoreError::Overlap`]
    /// if the zone already has an Active Run (§7 Overlap).
    ///
    /// Hardware is touched first, then the map is updated, then the
    /// snapshot is persisted — none of the three happen while `inner` is
    /// held (§4.E locking discipline).
    pub async fn start(
        &self,
        zone: ZoneId,
        start: DateTime<FixedOffset>,
        duration: StdDuration,
        origin: Origin,
    ) -> CoreResult<()> {
        {
            let inner = self.inner.lock().await;
            if inner.runs.contains_key(&zone) {
                return Err(CoreError::Overlap(zone));
            }
        }

        self.set_hardware_with_retry(zone, true).await?;

        let end = start
            + chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::zero());
        {
            let mut inner = self.inner.lock().await;
            inner.runs.insert(
                zone,
                ActiveRun {
                    zone,
                    start,
                    end,
                    origin,
                },
            );
        }
        info!(%zone, ?origin, %end, "zone started");
        self.persist().await;
        Ok(())
    }

    /// Stop a run if one exists; a no-op (not an error) if the zone is
    /// already inactive, matching §8's "cancelling an already-past run is a
    /// no-op" boundary behaviour.
    pub async fn stop(&self, zone: ZoneId, reason: StopReason) -> CoreResult<()> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.runs.remove(&zone)
        };

        let Some(run) = removed else {
            return Ok(());
        };

        if reason == StopReason::ManualCancel {
            let mut inner = self.inner.lock().await;
            inner.cancelled.insert(zone);
        }

        self.persist().await;

        if let Err(e) = self.set_hardware_with_retry(zone, false).await {
            // §7: a failed stop is critical and is retried every tick until
            // success — put the run back so the next `expire_due` sweep
            // (whose `end <= now` filter still matches) tries again.
            error!(%zone, error = %e, "failed to de-energise zone after stop; will be retried");
            let mut inner = self.inner.lock().await;
            inner.runs.entry(zone).or_insert(run);
            return Err(e);
        }
        info!(%zone, ?reason, "zone stopped");
        Ok(())
    }

    /// Stop every run whose `end <= now`, oldest-ending first, leaving a
    /// brief settle gap between consecutive stops (§4.E). Returns the zones
    /// that were expired this call, in the order they were stopped.
    pub async fn expire_due(&self, now: DateTime<FixedOffset>) -> Vec<ZoneId> {
        let mut due: Vec<(ZoneId, DateTime<FixedOffset>)> = {
            let inner = self.inner.lock().await;
            inner
                .runs
                .values()
                .filter(|r| r.end <= now)
                .map(|r| (r.zone, r.end))
                .collect()
        };
        due.sort_by_key(|(_, end)| *end);

        let mut stopped = Vec::with_capacity(due.len());
        for (i, (zone, _)) in due.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(EXPIRE_SETTLE_GAP).await;
            }
            if self.stop(zone, StopReason::Expired).await.is_ok() {
                stopped.push(zone);
            }
        }
        stopped
    }

    /// Stop every run immediately with reason `emergency`. Unlike `stop`,
    /// the snapshot is deliberately *not* rewritten — a restart within the
    /// original window must still restore these runs (§4.E, §5).
    pub async fn emergency_stop_all(&self) -> Vec<ZoneId> {
        let zones: Vec<ZoneId> = {
            let mut inner = self.inner.lock().await;
            let zones: Vec<ZoneId> = inner.runs.keys().copied().collect();
            inner.runs.clear();
            zones
        };
        for &zone in &zones {
            if let Err(e) = self.set_hardware_with_retry(zone, false).await {
                error!(%zone, error = %e, "emergency stop failed to de-energise zone");
            }
        }
        if !zones.is_empty() {
            warn!(zones = zones.len(), "emergency stop: all active zones de-energised (snapshot left untouched)");
        }
        zones
    }

    /// Persist the snapshot, then de-energise every output. The in-memory
    /// map and the just-written snapshot are left intact so a restart
    /// restores whatever was active (§4.E, §5).
    pub async fn orderly_shutdown(&self) {
        self.persist().await;
        let mut driver = self.driver.lock().await;
        if let Err(e) = driver.release_all() {
            error!(error = %e, "orderly shutdown: release_all failed");
        }
    }

    /// Restore a run recovered from the persisted snapshot at startup
    /// (§4.F Catch-up). Energises hardware and records the run without
    /// re-checking overlap — catch-up has already established the zone is
    /// not otherwise active.
    pub async fn restore(
        &self,
        zone: ZoneId,
        end: DateTime<FixedOffset>,
        origin: Origin,
        now: DateTime<FixedOffset>,
    ) -> CoreResult<()> {
        self.set_hardware_with_retry(zone, true).await?;
        {
            let mut inner = self.inner.lock().await;
            inner.runs.insert(
                zone,
                ActiveRun {
                    zone,
                    start: now,
                    end,
                    origin,
                },
            );
        }
        info!(%zone, ?origin, %end, "run restored from snapshot");
        self.persist().await;
        Ok(())
    }

    /// Load the persisted snapshot and restore every entry whose `end` is
    /// still in the future (§4.F Catch-up, step 1). Entries with
    /// `end <= now` are discarded, matching "restore in-flight runs, drop
    /// anything that already expired during the outage".
    pub async fn restore_from_snapshot(&self, now: DateTime<FixedOffset>) -> Vec<ZoneId> {
        let snapshot = snapshot::load(&self.snapshot_path);
        let mut restored = Vec::new();
        for (zone, persisted) in snapshot {
            if persisted.end_time > now {
                match self.restore(zone, persisted.end_time, persisted.origin, now).await {
                    Ok(()) => restored.push(zone),
                    Err(e) => error!(%zone, error = %e, "catch-up: failed to restore run from snapshot"),
                }
            }
        }
        restored
    }

    pub async fn is_active(&self, zone: ZoneId) -> bool {
        self.inner.lock().await.runs.contains_key(&zone)
    }

    pub async fn is_cancelled(&self, zone: ZoneId) -> bool {
        self.inner.lock().await.cancelled.contains(&zone)
    }

    /// Erase a zone's Cancellation Set entry once its scheduled window has
    /// passed (§3: "Entries are erased when the relevant scheduled window
    /// passes").
    pub async fn clear_cancellation(&self, zone: ZoneId) {
        self.inner.lock().await.cancelled.remove(&zone);
    }

    pub async fn query(&self, zone: ZoneId, now: DateTime<FixedOffset>) -> ZoneStatus {
        let inner = self.inner.lock().await;
        match inner.runs.get(&zone) {
            Some(run) => ZoneStatus {
                active: true,
                origin: Some(run.origin),
                remaining_seconds: run.remaining(now).as_secs(),
                end_time: Some(run.end),
            },
            None => ZoneStatus::inactive(),
        }
    }

    pub async fn query_all(&self, now: DateTime<FixedOffset>) -> HashMap<ZoneId, ZoneStatus> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .iter()
            .map(|(zone, run)| {
                (
                    *zone,
                    ZoneStatus {
                        active: true,
                        origin: Some(run.origin),
                        remaining_seconds: run.remaining(now).as_secs(),
                        end_time: Some(run.end),
                    },
                )
            })
            .collect()
    }

    pub async fn read_hardware(&self, zone: ZoneId) -> CoreResult<bool> {
        self.driver.lock().await.read(zone)
    }

    /// §7 Hardware: "an immediate retry is attempted once; on persistent
    /// failure [...]" — this helper implements that retry for every
    /// hardware-touching call site in the registry.
    async fn set_hardware_with_retry(&self, zone: ZoneId, on: bool) -> CoreResult<()> {
        let mut driver = self.driver.lock().await;
        match driver.set(zone, on) {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!(%zone, on, error = %first_err, "hardware set failed, retrying once");
                driver.set(zone, on).map_err(|e| {
                    error!(%zone, on, error = %e, "hardware set failed on retry");
                    e
                })
            }
        }
    }
}
