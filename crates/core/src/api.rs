//! Status surface (§6): the small set of operations a collaborator (CLI,
//! HTTP handler, MQTT bridge — whatever owns the outer surface) calls
//! against a running engine. This module owns none of that outer surface
//! itself; it only exposes the engine through plain async methods.

use crate::config::{load_schedule_document, load_garden_settings, GardenSettings, ScheduleDocument};
use crate::error::{CoreError, CoreResult};
use crate::registry::{Origin, Registry, StopReason, ZoneStatus};
use crate::zone::ZoneId;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tracing::info;

/// Engine handle exposed to collaborators. Wraps the [`Registry`] together
/// with the reloadable configuration documents the Run Loop also reads, so
/// a `reload_*` call here is visible to the run loop on its very next tick.
pub struct Engine {
    registry: Arc<Registry>,
    schedule: Arc<RwLock<ScheduleDocument>>,
    settings: Arc<RwLock<GardenSettings>>,
    schedule_path: String,
    settings_path: String,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        schedule: Arc<RwLock<ScheduleDocument>>,
        settings: Arc<RwLock<GardenSettings>>,
        schedule_path: impl Into<String>,
        settings_path: impl Into<String>,
    ) -> Self {
        Engine {
            registry,
            schedule,
            settings,
            schedule_path: schedule_path.into(),
            settings_path: settings_path.into(),
        }
    }

    async fn now(&self) -> DateTime<FixedOffset> {
        let settings = self.settings.read().await;
        Utc::now().with_timezone(&settings.tz()).fixed_offset()
    }

    /// `get_zone_status(zone_id)`.
    pub async fn get_zone_status(&self, zone: ZoneId) -> ZoneStatus {
        let now = self.now().await;
        self.registry.query(zone, now).await
    }

    /// `get_all_zone_status()`.
    pub async fn get_all_zone_status(&self) -> HashMap<ZoneId, ZoneStatus> {
        let now = self.now().await;
        self.registry.query_all(now).await
    }

    /// `start_manual(zone_id, duration_seconds)`. Rejected with
    /// [`CoreError::Overlap`] if the zone already has an Active Run (§7).
    pub async fn start_manual(&self, zone: ZoneId, duration_seconds: u64) -> CoreResult<()> {
        let now = self.now().await;
        self.registry
            .start(zone, now, StdDuration::from_secs(duration_seconds), Origin::Manual)
            .await
    }

    /// `stop_manual(zone_id)`. A no-op if the zone is already inactive
    /// (§8 boundary behaviour) and adds the zone to the Cancellation Set so
    /// the Run Loop does not immediately restart it within the same window.
    pub async fn stop_manual(&self, zone: ZoneId) -> CoreResult<()> {
        self.registry.stop(zone, StopReason::ManualCancel).await
    }

    /// `emergency_stop_all()`. De-energises every zone without rewriting
    /// the Active-Run Snapshot, so a subsequent restart within the original
    /// window still restores the interrupted runs (§4.E, §8 scenario 5).
    pub async fn emergency_stop_all(&self) -> CoreResult<()> {
        let zones = self.registry.emergency_stop_all().await;
        info!(zones = ?zones, "emergency stop: all zones de-energised");
        Ok(())
    }

    /// `reload_schedule()`. On validation failure, the previously loaded
    /// document stays in effect (§7 Validation policy).
    pub async fn reload_schedule(&self) -> CoreResult<()> {
        let loaded = load_schedule_document(&self.schedule_path)
            .map_err(|e| CoreError::validation(e.to_string()))?;
        *self.schedule.write().await = loaded;
        info!(path = %self.schedule_path, "schedule document reloaded");
        Ok(())
    }

    /// `reload_settings()`. On validation failure, the previously loaded
    /// settings stay in effect (§7 Validation policy).
    pub async fn reload_settings(&self) -> CoreResult<()> {
        let loaded = load_garden_settings(&self.settings_path)
            .map_err(|e| CoreError::validation(e.to_string()))?;
        *self.settings.write().await = loaded;
        info!(path = %self.settings_path, "garden settings reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedDriver;
    use crate::pump::PumpCoupledDriver;
    use crate::zone::Polarity;
    use std::collections::HashMap as StdHashMap;

    fn settings() -> GardenSettings {
        GardenSettings {
            gps_lat: 37.77,
            gps_lon: -122.42,
            timezone: "America/Los_Angeles".into(),
            timer_multiplier: 1.0,
        }
    }

    fn engine() -> Engine {
        let outputs = vec![
            (ZoneId::new(1), 17, Polarity::ActiveLow),
            (ZoneId::new(2), 27, Polarity::ActiveLow),
        ];
        let sim = SimulatedDriver::new(&outputs).unwrap();
        let coupled = PumpCoupledDriver::new(Box::new(sim), None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        std::mem::forget(dir);
        let registry = Arc::new(Registry::new(Box::new(coupled), path));
        Engine::new(
            registry,
            Arc::new(RwLock::new(ScheduleDocument { zones: StdHashMap::new() })),
            Arc::new(RwLock::new(settings())),
            "/nonexistent/schedule.toml",
            "/nonexistent/settings.toml",
        )
    }

    #[tokio::test]
    async fn start_manual_then_status_reports_active() {
        let e = engine();
        e.start_manual(ZoneId::new(1), 120).await.unwrap();
        let status = e.get_zone_status(ZoneId::new(1)).await;
        assert!(status.active);
        assert_eq!(status.origin, Some(Origin::Manual));
    }

    #[tokio::test]
    async fn starting_an_already_active_zone_is_an_overlap_error() {
        let e = engine();
        e.start_manual(ZoneId::new(1), 120).await.unwrap();
        let err = e.start_manual(ZoneId::new(1), 60).await.unwrap_err();
        assert!(matches!(err, CoreError::Overlap(_)));
    }

    #[tokio::test]
    async fn stop_manual_on_inactive_zone_is_a_no_op() {
        let e = engine();
        e.stop_manual(ZoneId::new(1)).await.unwrap();
    }

    #[tokio::test]
    async fn emergency_stop_all_clears_active_status() {
        let e = engine();
        e.start_manual(ZoneId::new(1), 120).await.unwrap();
        e.start_manual(ZoneId::new(2), 120).await.unwrap();
        e.emergency_stop_all().await.unwrap();
        let all = e.get_all_zone_status().await;
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn reload_schedule_from_missing_path_surfaces_validation_error() {
        let e = engine();
        let err = e.reload_schedule().await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
