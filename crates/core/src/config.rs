//! External interface document types (§6): the Schedule document, Garden
//! settings, and Hardware configuration. Loading and validating these is
//! in scope for the core even though *owning* the files (watching them,
//! exposing them over HTTP) is a collaborator concern — see SPEC_FULL.md
//! §1/§10.

use crate::error::{CoreError, CoreResult};
use crate::recurrence::Period;
use crate::time_resolver::TimeCode;
use crate::zone::{Polarity, ZoneId, ZoneMode};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Schedule document
// ---------------------------------------------------------------------------

/// One resolved `{start_time, duration}` pair within a Schedule Entry's
/// Times list (§3, §6). Each cycle carries its own duration — the wire
/// format in §6 is authoritative over the simplified single-duration
/// phrasing in §3's data-model prose; see DESIGN.md.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTime {
    pub start: TimeCode,
    pub duration: Duration,
}

/// A validated, in-scope Schedule Entry for one non-disabled zone.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub mode: ZoneMode,
    pub period: Period,
    pub cycles: u32,
    pub anchor_date: NaiveDate,
    pub times: Vec<ScheduleTime>,
}

impl ScheduleEntry {
    fn validate(&self) -> CoreResult<()> {
        if self.cycles == 0 {
            return Err(CoreError::validation("cycles must be a positive integer"));
        }
        if self.times.len() != self.cycles as usize {
            return Err(CoreError::validation(format!(
                "times list has {} entries but cycles = {}",
                self.times.len(),
                self.cycles
            )));
        }
        for t in &self.times {
            if t.duration.is_zero() || t.duration >= Duration::from_secs(24 * 3600) {
                return Err(CoreError::validation(format!(
                    "duration {:?} is out of range [1s, 24h)",
                    t.duration
                )));
            }
        }
        Ok(())
    }
}

/// A single zone's entry in the Schedule document: either disabled, or an
/// active, validated [`ScheduleEntry`].
#[derive(Debug, Clone)]
pub enum ZoneSchedule {
    Disabled,
    Active(ScheduleEntry),
}

/// The full Schedule document: every configured zone's recurrence.
#[derive(Debug, Clone, Default)]
pub struct ScheduleDocument {
    pub zones: HashMap<ZoneId, ZoneSchedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawScheduleTime {
    start_time: String,
    duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawZoneEntry {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cycles: Option<u32>,
    #[serde(default, rename = "startDay", skip_serializing_if = "Option::is_none")]
    start_day: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    times: Vec<RawScheduleTime>,
}

impl From<&ZoneSchedule> for RawZoneEntry {
    /// Inverse of `TryFrom<RawZoneEntry> for ZoneSchedule` — this, together
    /// with the omitted UI-only fields, is the rewrite side of §6's
    /// field-stripping requirement: a Schedule document written back out by
    /// the core never contains `zone_id`, `scheduleMode`,
    /// `showDurationPicker`, `showTimePicker`, or `originalIndex`.
    fn from(zsched: &ZoneSchedule) -> Self {
        match zsched {
            ZoneSchedule::Disabled => RawZoneEntry {
                mode: "disabled".to_string(),
                period: None,
                cycles: None,
                start_day: None,
                times: Vec::new(),
            },
            ZoneSchedule::Active(entry) => RawZoneEntry {
                mode: match entry.mode {
                    ZoneMode::Disabled => "disabled".to_string(),
                    ZoneMode::ManualScheduled => "manual-scheduled".to_string(),
                    ZoneMode::Smart => "smart".to_string(),
                },
                period: Some(entry.period),
                cycles: Some(entry.cycles),
                start_day: match entry.period {
                    Period::Daily => None,
                    _ => Some(entry.anchor_date.format("%Y-%m-%d").to_string()),
                },
                times: entry
                    .times
                    .iter()
                    .map(|t| RawScheduleTime {
                        start_time: t.start.to_string(),
                        duration: format_hms(t.duration),
                    })
                    .collect(),
            },
        }
    }
}

fn parse_hms(s: &str) -> Option<Duration> {
    let mut parts = s.splitn(3, ':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let sec: u64 = parts.next()?.parse().ok()?;
    if m > 59 || sec > 59 {
        return None;
    }
    Some(Duration::from_secs(h * 3600 + m * 60 + sec))
}

fn format_hms(d: Duration) -> String {
    let total = d.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

impl TryFrom<RawZoneEntry> for ZoneSchedule {
    type Error = CoreError;

    fn try_from(raw: RawZoneEntry) -> CoreResult<Self> {
        let mode = match raw.mode.as_str() {
            "disabled" => return Ok(ZoneSchedule::Disabled),
            "manual-scheduled" => ZoneMode::ManualScheduled,
            "smart" => ZoneMode::Smart,
            other => {
                return Err(CoreError::validation(format!(
                    "unrecognised zone mode '{other}'"
                )))
            }
        };

        let period = raw
            .period
            .ok_or_else(|| CoreError::validation("active zone entry missing 'period'"))?;
        let cycles = raw
            .cycles
            .ok_or_else(|| CoreError::validation("active zone entry missing 'cycles'"))?;

        let anchor_date = match period {
            Period::Daily => NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            _ => {
                let s = raw.start_day.as_deref().ok_or_else(|| {
                    CoreError::validation("weekly/monthly entry missing 'startDay'")
                })?;
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| CoreError::validation(format!("invalid startDay '{s}'")))?
            }
        };

        let mut times = Vec::with_capacity(raw.times.len());
        for t in &raw.times {
            let start = TimeCode::parse(&t.start_time).ok_or_else(|| {
                CoreError::validation(format!("invalid time code '{}'", t.start_time))
            })?;
            let duration = parse_hms(&t.duration).ok_or_else(|| {
                CoreError::validation(format!("invalid duration '{}'", t.duration))
            })?;
            times.push(ScheduleTime { start, duration });
        }

        let entry = ScheduleEntry {
            mode,
            period,
            cycles,
            anchor_date,
            times,
        };
        entry.validate()?;
        Ok(ZoneSchedule::Active(entry))
    }
}

/// Read and parse the Schedule document from TOML.
///
/// UI-only fields that collaborators may have written into the file
/// (`zone_id`, `scheduleMode`, `showDurationPicker`, `showTimePicker`,
/// `originalIndex`) are not part of [`RawZoneEntry`] and are silently
/// dropped by deserialization — the typed round trip through this module
/// is itself the stripping mechanism described in §6.
pub fn load_schedule_document(path: &str) -> Result<ScheduleDocument> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedule document: {path}"))?;
    let raw: HashMap<ZoneId, RawZoneEntry> = toml::from_str(&contents)
        .with_context(|| format!("failed to parse schedule document: {path}"))?;

    let mut zones = HashMap::with_capacity(raw.len());
    for (zone, entry) in raw {
        let parsed = ZoneSchedule::try_from(entry)
            .with_context(|| format!("zone {zone} failed schedule validation"))?;
        zones.insert(zone, parsed);
    }
    Ok(ScheduleDocument { zones })
}

/// Rewrite the Schedule document to TOML, stripping UI-only fields (§6) and
/// atomically replacing the destination, the same write-temp-then-rename
/// idiom [`crate::snapshot::save`] uses for the Active-Run Snapshot.
pub fn save_schedule_document(path: &str, document: &ScheduleDocument) -> Result<()> {
    let raw: HashMap<ZoneId, RawZoneEntry> = document
        .zones
        .iter()
        .map(|(zone, zsched)| (*zone, RawZoneEntry::from(zsched)))
        .collect();
    let contents =
        toml::to_string_pretty(&raw).context("failed to serialize schedule document")?;

    let tmp_path = format!("{path}.tmp");
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write schedule document temp file: {tmp_path}"))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace schedule document: {path}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Garden settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GardenSettings {
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub timezone: String,
    pub timer_multiplier: f64,
}

impl GardenSettings {
    pub fn validate(&self) -> CoreResult<()> {
        if !(-90.0..=90.0).contains(&self.gps_lat) {
            return Err(CoreError::validation("gps_lat out of range [-90, 90]"));
        }
        if !(-180.0..=180.0).contains(&self.gps_lon) {
            return Err(CoreError::validation("gps_lon out of range [-180, 180]"));
        }
        if !(0.1..=10.0).contains(&self.timer_multiplier) {
            return Err(CoreError::validation(
                "timer_multiplier out of range [0.1, 10.0]",
            ));
        }
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| CoreError::validation(format!("unknown IANA timezone '{}'", self.timezone)))?;
        Ok(())
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().expect("validated at load time")
    }
}

pub fn load_garden_settings(path: &str) -> Result<GardenSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read garden settings: {path}"))?;
    let settings: GardenSettings = toml::from_str(&contents)
        .with_context(|| format!("failed to parse garden settings: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("garden settings at {path} failed validation"))?;
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Hardware configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub zone_count: u8,
    pub outputs: Vec<String>,
    pub pump_index: u8,
    pub active_low: bool,
    /// Free-text tag describing the output-numbering convention in use
    /// (e.g. "BCM" vs "BOARD" in the original source) — passed through
    /// for collaborators, not interpreted by the core.
    pub numbering_convention: String,
}

impl HardwareConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(1..=ZoneId::MAX_ZONES).contains(&self.zone_count) {
            return Err(CoreError::validation("zoneCount must be in 1..=8"));
        }
        if self.outputs.len() != self.zone_count as usize {
            return Err(CoreError::validation(
                "outputs list length must equal zoneCount",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for o in &self.outputs {
            if !seen.insert(o) {
                return Err(CoreError::validation(format!(
                    "output identifier '{o}' used by more than one zone"
                )));
            }
        }
        if self.pump_index > self.zone_count {
            return Err(CoreError::validation(
                "pumpIndex must be 0 (no pump) or within 1..=zoneCount",
            ));
        }
        Ok(())
    }

    pub fn polarity(&self) -> Polarity {
        if self.active_low {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    pub fn pump_zone(&self) -> Option<ZoneId> {
        if self.pump_index == 0 {
            None
        } else {
            Some(ZoneId::new(self.pump_index))
        }
    }

    /// `(zone, output_identifier, polarity)` triples suitable for handing
    /// to a [`crate::hardware::HardwareDriver`] constructor.
    pub fn driver_outputs(&self) -> Vec<(ZoneId, String, Polarity)> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, out)| (ZoneId::new(i as u8 + 1), out.clone(), self.polarity()))
            .collect()
    }
}

pub fn load_hardware_config(path: &str) -> Result<HardwareConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read hardware configuration: {path}"))?;
    let config: HardwareConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse hardware configuration: {path}"))?;
    config
        .validate()
        .with_context(|| format!("hardware configuration at {path} failed validation"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
