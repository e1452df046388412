//! Run Loop (component F, §4.F): the dedicated ~1 Hz worker that expires
//! finished runs, starts zones whose schedule fires, and — once at
//! start-up — restores persisted runs and catches up on events missed
//! during downtime.

use crate::config::{GardenSettings, ScheduleDocument, ZoneSchedule};
use crate::recurrence;
use crate::registry::{Origin, Registry};
use crate::time_resolver::TimeResolver;
use crate::zone::{ZoneId, ZoneMode};
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Tick cadence (§4.F: "one dedicated thread at ~1 Hz").
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Brief settle delay after a tick expires at least one run, before schedule
/// evaluation runs (§4.F step 1).
const POST_EXPIRE_SETTLE: StdDuration = StdDuration::from_millis(150);

/// Schedule evaluation runs at ~0.5 Hz — every 2nd tick.
const EVALUATE_EVERY_N_TICKS: u64 = 2;

/// Daily housekeeping is checked once per minute (§4.F step 4, matching
/// `original_source/core/scheduler.py`'s `loop_count % 60 == 0` cadence).
const HOUSEKEEPING_CHECK_EVERY_N_TICKS: u64 = 60;

/// Local hour at/after which daily housekeeping may run.
const HOUSEKEEPING_HOUR: u32 = 6;

/// The half-open schedule-evaluation window (§4.F, §9): an event fires if
/// `now` falls in `[start, start + WINDOW)`.
const EVALUATION_WINDOW: chrono::Duration = chrono::Duration::seconds(60);

/// Upper bound on catch-up wall-clock time (§4.F).
const CATCHUP_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Per-zone cap on catch-up entries considered (§4.F).
const CATCHUP_MAX_ENTRIES_PER_ZONE: usize = 5;

/// A catch-up restart shorter than this is not worth starting (§4.F: "at
/// least a few seconds remain").
const CATCHUP_FLOOR: chrono::Duration = chrono::Duration::seconds(3);

/// Invoked once per non-disabled `smart`-mode zone during daily housekeeping
/// (§4.F step 4). The refresh logic itself — deriving a duration from plant
/// data — is out of scope; the core only invokes the hook.
pub type SmartRefreshHook = Arc<dyn Fn(ZoneId) + Send + Sync>;

/// Scales a schedule entry's configured duration by the garden's
/// `timer_multiplier` (§3, §8 invariant 3).
fn scale_duration(duration: StdDuration, multiplier: f64) -> StdDuration {
    StdDuration::from_secs_f64((duration.as_secs_f64() * multiplier).max(0.0))
}

/// The Run Loop (component F). Consults the Recurrence Evaluator and Time
/// Resolver to decide transitions and drives them through the Active-Run
/// Registry; owns no hardware handle directly (§5: the registry is the
/// hardware's sole caller).
pub struct RunLoop {
    registry: Arc<Registry>,
    resolver: Mutex<TimeResolver>,
    schedule: Arc<RwLock<ScheduleDocument>>,
    settings: Arc<RwLock<GardenSettings>>,
    smart_refresh: Option<SmartRefreshHook>,
    tick_count: Mutex<u64>,
    last_housekeeping: Mutex<Option<NaiveDate>>,
}

impl RunLoop {
    pub fn new(
        registry: Arc<Registry>,
        schedule: Arc<RwLock<ScheduleDocument>>,
        settings: Arc<RwLock<GardenSettings>>,
        smart_refresh: Option<SmartRefreshHook>,
    ) -> Self {
        RunLoop {
            registry,
            resolver: Mutex::new(TimeResolver::new()),
            schedule,
            settings,
            smart_refresh,
            tick_count: Mutex::new(0),
            last_housekeeping: Mutex::new(None),
        }
    }

    async fn now(&self) -> DateTime<FixedOffset> {
        let settings = self.settings.read().await;
        Utc::now().with_timezone(&settings.tz()).fixed_offset()
    }

    /// Run the tick loop forever. Each tick's errors are caught and logged
    /// rather than propagated (§7 Propagation policy) — `tick` itself never
    /// returns an `Err`, but any `CoreError` encountered along the way is
    /// logged at the point of occurrence and the tick continues.
    pub async fn run(&self) {
        self.catch_up().await;

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One iteration of the cadence described in §4.F. Public so tests (and
    /// an embedding collaborator that wants manual cadence control) can
    /// drive it directly instead of waiting on real wall-clock ticks.
    pub async fn tick(&self) {
        let now = self.now().await;
        let count = {
            let mut c = self.tick_count.lock().await;
            *c += 1;
            *c
        };

        let expired = self.registry.expire_due(now).await;
        if !expired.is_empty() {
            tokio::time::sleep(POST_EXPIRE_SETTLE).await;
        }

        if count % EVALUATE_EVERY_N_TICKS == 0 {
            self.evaluate_schedule(now).await;
        }

        // Step 3, "refresh countdowns": purely derived from the registry's
        // own clock-consistent `query_all`, so there is nothing to persist
        // or recompute here beyond what status queries already do on
        // demand (§4.F).

        if count % HOUSEKEEPING_CHECK_EVERY_N_TICKS == 0 {
            self.daily_housekeeping(now).await;
        }
    }

    async fn evaluate_schedule(&self, now: DateTime<FixedOffset>) {
        let schedule = self.schedule.read().await;
        let settings = self.settings.read().await;
        let today = now.date_naive();

        for (&zone, zsched) in schedule.zones.iter() {
            let ZoneSchedule::Active(entry) = zsched else {
                continue;
            };

            if !recurrence::fires_today(entry.period, entry.anchor_date, today) {
                continue;
            }

            if self.registry.is_active(zone).await {
                continue;
            }

            if self.registry.is_cancelled(zone).await {
                if self.window_has_passed(entry, now, today, &settings).await {
                    self.registry.clear_cancellation(zone).await;
                }
                continue;
            }

            let mut resolver = self.resolver.lock().await;
            for time in &entry.times {
                let Some(start) = resolver.resolve(&time.start, today, settings.gps_lat, settings.gps_lon, settings.tz())
                else {
                    warn!(%zone, "schedule evaluation: could not resolve time code, skipping entry");
                    continue;
                };
                let start = start.fixed_offset();
                let elapsed = now - start;
                if elapsed >= chrono::Duration::zero() && elapsed < EVALUATION_WINDOW {
                    let duration = scale_duration(time.duration, settings.timer_multiplier);
                    match self.registry.start(zone, start, duration, Origin::Scheduled).await {
                        Ok(()) => info!(%zone, "scheduled run started"),
                        Err(e) => warn!(%zone, error = %e, "scheduled start failed, will retry next matching day"),
                    }
                    break; // at most one new start per zone per tick
                }
            }
        }
    }

    /// True once `now` has moved past every time-code window of `entry` for
    /// `today`, i.e. the cancelled scheduled run for today is fully over.
    async fn window_has_passed(
        &self,
        entry: &crate::config::ScheduleEntry,
        now: DateTime<FixedOffset>,
        today: NaiveDate,
        settings: &GardenSettings,
    ) -> bool {
        let mut resolver = self.resolver.lock().await;
        for time in &entry.times {
            if let Some(start) = resolver.resolve(&time.start, today, settings.gps_lat, settings.gps_lon, settings.tz()) {
                let start = start.fixed_offset();
                let scaled = scale_duration(time.duration, settings.timer_multiplier);
                let end = start + chrono::Duration::from_std(scaled).unwrap_or_else(|_| chrono::Duration::zero());
                if now < end {
                    return false;
                }
            }
        }
        true
    }

    async fn daily_housekeeping(&self, now: DateTime<FixedOffset>) {
        let today = now.date_naive();
        if now.time().hour() < HOUSEKEEPING_HOUR {
            return;
        }
        {
            let mut last = self.last_housekeeping.lock().await;
            if *last == Some(today) {
                return;
            }
            *last = Some(today);
        }

        let Some(hook) = &self.smart_refresh else {
            return;
        };
        let schedule = self.schedule.read().await;
        for (&zone, zsched) in schedule.zones.iter() {
            if let ZoneSchedule::Active(entry) = zsched {
                if entry.mode == ZoneMode::Smart {
                    hook(zone);
                }
            }
        }
        info!(date = %today, "daily housekeeping: smart refresh invoked");
    }

    /// Startup catch-up (§4.F): restore persisted runs, then start any
    /// zone whose scheduled window is still open despite the event having
    /// already begun (or even ended partway) during downtime. Bounded to
    /// [`CATCHUP_TIMEOUT`] wall-clock time; on timeout the core logs and
    /// proceeds into the normal tick cadence regardless.
    pub async fn catch_up(&self) {
        let now = self.now().await;
        let outcome = tokio::time::timeout(CATCHUP_TIMEOUT, self.catch_up_at(now)).await;
        if outcome.is_err() {
            warn!(timeout_secs = CATCHUP_TIMEOUT.as_secs(), "catch-up timed out, proceeding to normal operation");
        }
    }

    async fn catch_up_at(&self, now: DateTime<FixedOffset>) {
        let restored = self.registry.restore_from_snapshot(now).await;
        if !restored.is_empty() {
            info!(zones = ?restored, "catch-up: restored runs from snapshot");
        }

        let schedule = self.schedule.read().await;
        let settings = self.settings.read().await;
        let today = now.date_naive();

        let mut resolver = self.resolver.lock().await;
        for (&zone, zsched) in schedule.zones.iter() {
            let ZoneSchedule::Active(entry) = zsched else {
                continue;
            };
            if !recurrence::fires_today(entry.period, entry.anchor_date, today) {
                continue;
            }

            for time in entry.times.iter().take(CATCHUP_MAX_ENTRIES_PER_ZONE) {
                if self.registry.is_active(zone).await {
                    break;
                }
                let Some(start) = resolver.resolve(&time.start, today, settings.gps_lat, settings.gps_lon, settings.tz())
                else {
                    continue;
                };
                let start = start.fixed_offset();
                let scaled = scale_duration(time.duration, settings.timer_multiplier);
                let end = start + chrono::Duration::from_std(scaled).unwrap_or_else(|_| chrono::Duration::zero());

                if now < start || now >= end {
                    continue; // not yet due, or missed entirely — no shortened make-up
                }

                let remaining = end - now;
                if remaining < CATCHUP_FLOOR {
                    continue;
                }
                let remaining_std = remaining.to_std().unwrap_or(StdDuration::ZERO);
                match self.registry.start(zone, now, remaining_std, Origin::Scheduled).await {
                    Ok(()) => info!(%zone, remaining_secs = remaining.num_seconds(), "Catch-up: Started missed event from outage"),
                    Err(e) => warn!(%zone, error = %e, "catch-up: failed to start missed event"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleEntry, ScheduleTime};
    use crate::hardware::SimulatedDriver;
    use crate::pump::PumpCoupledDriver;
    use crate::recurrence::Period;
    use crate::registry::StopReason;
    use crate::time_resolver::TimeCode;
    use crate::zone::Polarity;
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn settings() -> GardenSettings {
        GardenSettings {
            gps_lat: 37.77,
            gps_lon: -122.42,
            timezone: "America/Los_Angeles".into(),
            timer_multiplier: 1.0,
        }
    }

    fn registry() -> Arc<Registry> {
        let outputs = vec![
            (ZoneId::new(1), 17, Polarity::ActiveLow),
            (ZoneId::new(2), 27, Polarity::ActiveLow),
            (ZoneId::new(3), 22, Polarity::ActiveLow),
            (ZoneId::new(8), 26, Polarity::ActiveLow),
        ];
        let sim = SimulatedDriver::new(&outputs).unwrap();
        let coupled = PumpCoupledDriver::new(Box::new(sim), Some(ZoneId::new(8)));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        Arc::new(Registry::new(Box::new(coupled), path))
    }

    fn daily_entry(start_time: &str, duration_secs: u64) -> ScheduleDocument {
        let mut zones = StdHashMap::new();
        zones.insert(
            ZoneId::new(1),
            ZoneSchedule::Active(ScheduleEntry {
                mode: ZoneMode::ManualScheduled,
                period: Period::Daily,
                cycles: 1,
                anchor_date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                times: vec![ScheduleTime {
                    start: TimeCode::parse(start_time).unwrap(),
                    duration: StdDuration::from_secs(duration_secs),
                }],
            }),
        );
        ScheduleDocument { zones }
    }

    fn run_loop_with(schedule: ScheduleDocument, settings: GardenSettings) -> (Arc<Registry>, RunLoop) {
        let reg = registry();
        let rl = RunLoop::new(
            Arc::clone(&reg),
            Arc::new(RwLock::new(schedule)),
            Arc::new(RwLock::new(settings)),
            None,
        );
        (reg, rl)
    }

    #[tokio::test]
    async fn scheduled_entry_starts_within_evaluation_window() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = tz.from_local_datetime(&today.and_hms_opt(7, 0, 0).unwrap()).single().unwrap();
        let now = (start + chrono::Duration::seconds(10)).fixed_offset();

        let (reg, rl) = run_loop_with(daily_entry("07:00", 60), settings());
        rl.evaluate_schedule(now).await;

        assert!(reg.is_active(ZoneId::new(1)).await);
        let status = reg.query(ZoneId::new(1), now).await;
        assert!(status.remaining_seconds >= 48 && status.remaining_seconds <= 50);
    }

    #[tokio::test]
    async fn scheduled_entry_does_not_start_before_its_window() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = tz.from_local_datetime(&today.and_hms_opt(7, 0, 0).unwrap()).single().unwrap();
        let now = (start - chrono::Duration::seconds(30)).fixed_offset();

        let (reg, rl) = run_loop_with(daily_entry("07:00", 60), settings());
        rl.evaluate_schedule(now).await;

        assert!(!reg.is_active(ZoneId::new(1)).await);
    }

    #[tokio::test]
    async fn scheduled_entry_does_not_restart_after_its_window_closes() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = tz.from_local_datetime(&today.and_hms_opt(7, 0, 0).unwrap()).single().unwrap();
        let now = (start + chrono::Duration::seconds(90)).fixed_offset(); // past the 60s window

        let (reg, rl) = run_loop_with(daily_entry("07:00", 60), settings());
        rl.evaluate_schedule(now).await;

        assert!(!reg.is_active(ZoneId::new(1)).await);
    }

    #[tokio::test]
    async fn cancelled_zone_is_not_restarted_within_the_cancelled_window() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = tz.from_local_datetime(&today.and_hms_opt(9, 0, 0).unwrap()).single().unwrap();
        let (reg, rl) = run_loop_with(daily_entry("09:00", 20 * 60), settings());

        reg.clear_cancellation(ZoneId::new(1)).await; // sanity: starts clear
        // Simulate the operator cancelling shortly after start.
        reg.start(ZoneId::new(1), start.fixed_offset(), StdDuration::from_secs(20 * 60), Origin::Scheduled)
            .await
            .unwrap();
        reg.stop(ZoneId::new(1), StopReason::ManualCancel).await.unwrap();
        assert!(reg.is_cancelled(ZoneId::new(1)).await);

        // Still within the 09:00-09:20 window: must not restart.
        let mid_window = (start + chrono::Duration::minutes(5)).fixed_offset();
        rl.evaluate_schedule(mid_window).await;
        assert!(!reg.is_active(ZoneId::new(1)).await);
        assert!(reg.is_cancelled(ZoneId::new(1)).await);

        // After the window closes, the cancellation entry is cleared.
        let after_window = (start + chrono::Duration::minutes(25)).fixed_offset();
        rl.evaluate_schedule(after_window).await;
        assert!(!reg.is_cancelled(ZoneId::new(1)).await);
    }

    #[tokio::test]
    async fn catch_up_starts_ongoing_solar_event_for_remaining_portion() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();

        let mut zones = StdHashMap::new();
        zones.insert(
            ZoneId::new(2),
            ZoneSchedule::Active(ScheduleEntry {
                mode: ZoneMode::ManualScheduled,
                period: Period::Daily,
                cycles: 1,
                anchor_date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                times: vec![ScheduleTime {
                    start: TimeCode::parse("SUNSET-30").unwrap(),
                    duration: StdDuration::from_secs(10 * 60),
                }],
            }),
        );
        let schedule = ScheduleDocument { zones };
        let (reg, rl) = run_loop_with(schedule, settings());

        // Force "now" to sit inside the window by using the actual resolved
        // SUNSET for today and placing `now` 26 minutes after the window's
        // start (matches the scenario in §8: 26 minutes elapsed into a
        // 10-minute window → ~8m34s remaining).
        let mut resolver = TimeResolver::new();
        let s = settings();
        let sunset = resolver
            .resolve(&TimeCode::parse("SUNSET").unwrap(), today, s.gps_lat, s.gps_lon, s.tz())
            .unwrap();
        let window_start = sunset.fixed_offset() - chrono::Duration::minutes(30);
        let now = window_start + chrono::Duration::seconds(26 * 60);

        rl.catch_up_at(now).await;

        assert!(reg.is_active(ZoneId::new(2)).await);
        let status = reg.query(ZoneId::new(2), now).await;
        assert!(
            status.remaining_seconds >= 500 && status.remaining_seconds <= 520,
            "expected ~8m34s remaining, got {}s",
            status.remaining_seconds
        );
    }

    #[tokio::test]
    async fn catch_up_skips_an_event_whose_window_fully_elapsed() {
        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = tz.from_local_datetime(&today.and_hms_opt(7, 0, 0).unwrap()).single().unwrap();
        let (reg, rl) = run_loop_with(daily_entry("07:00", 60), settings());

        let now = (start + chrono::Duration::minutes(5)).fixed_offset(); // long past 60s duration
        rl.catch_up_at(now).await;

        assert!(!reg.is_active(ZoneId::new(1)).await);
    }

    #[tokio::test]
    async fn catch_up_restores_snapshot_before_evaluating_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        let outputs = vec![
            (ZoneId::new(1), 17, Polarity::ActiveLow),
            (ZoneId::new(5), 21, Polarity::ActiveLow),
        ];
        let sim = SimulatedDriver::new(&outputs).unwrap();
        let coupled = PumpCoupledDriver::new(Box::new(sim), None);
        let reg = Arc::new(Registry::new(Box::new(coupled), path.clone()));

        let t0 = Utc::now().fixed_offset();
        let mut snap = crate::snapshot::Snapshot::new();
        snap.insert(
            ZoneId::new(5),
            crate::snapshot::PersistedRun {
                end_time: t0 + chrono::Duration::minutes(2),
                origin: Origin::Manual,
            },
        );
        crate::snapshot::save(&path, &snap).unwrap();

        let rl = RunLoop::new(
            Arc::clone(&reg),
            Arc::new(RwLock::new(ScheduleDocument::default())),
            Arc::new(RwLock::new(settings())),
            None,
        );
        rl.catch_up_at(t0).await;

        assert!(reg.is_active(ZoneId::new(5)).await);
        assert!(reg.read_hardware(ZoneId::new(5)).await.unwrap());
    }

    #[tokio::test]
    async fn smart_mode_zones_are_invoked_during_housekeeping() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mut zones = StdHashMap::new();
        zones.insert(
            ZoneId::new(1),
            ZoneSchedule::Active(ScheduleEntry {
                mode: ZoneMode::Smart,
                period: Period::Daily,
                cycles: 1,
                anchor_date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                times: vec![ScheduleTime {
                    start: TimeCode::parse("07:00").unwrap(),
                    duration: StdDuration::from_secs(60),
                }],
            }),
        );
        let schedule = ScheduleDocument { zones };

        let reg = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let hook: SmartRefreshHook = Arc::new(move |_zone| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let rl = RunLoop::new(
            reg,
            Arc::new(RwLock::new(schedule)),
            Arc::new(RwLock::new(settings())),
            Some(hook),
        );

        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let after_six = tz.from_local_datetime(&today.and_hms_opt(6, 30, 0).unwrap()).single().unwrap().fixed_offset();

        rl.daily_housekeeping(after_six).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second call on the same date must not invoke the hook again.
        rl.daily_housekeeping(after_six).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn daily_housekeeping_skips_before_configured_hour() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let schedule = daily_entry("07:00", 60);
        let reg = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let hook: SmartRefreshHook = Arc::new(move |_zone| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let rl = RunLoop::new(
            reg,
            Arc::new(RwLock::new(schedule)),
            Arc::new(RwLock::new(settings())),
            Some(hook),
        );

        let tz: chrono_tz::Tz = "America/Los_Angeles".parse().unwrap();
        let today = Utc::now().with_timezone(&tz).date_naive();
        let before_six = tz.from_local_datetime(&today.and_hms_opt(5, 0, 0).unwrap()).single().unwrap().fixed_offset();

        rl.daily_housekeeping(before_six).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
