//! Time Resolver (component C, §4.C). Converts Time Codes into absolute
//! instants against a civil date, garden location, and IANA time zone.

use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use std::collections::VecDeque;
use sunrise::{Coordinates, SolarDay, SolarEvent};

/// Which solar anchor a [`TimeCode::Solar`] is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarAnchor {
    Sunrise,
    Sunset,
    Zenith,
}

/// A parsed Time Code (§3). Either a wall-clock time or an offset from a
/// solar anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCode {
    Clock { hour: u8, minute: u8 },
    Solar { anchor: SolarAnchor, offset_minutes: i32 },
}

impl TimeCode {
    /// Parse a Time Code from its textual form. Returns `None` for any
    /// malformed or unrecognised code — callers must treat this as
    /// *undefined* and skip the entry, never substitute a default.
    pub fn parse(raw: &str) -> Option<TimeCode> {
        let s = raw.trim();

        if let Some((anchor, rest)) = Self::split_anchor(s) {
            let offset_minutes = if rest.is_empty() {
                0
            } else {
                rest.parse::<i32>().ok()?
            };
            return Some(TimeCode::Solar { anchor, offset_minutes });
        }

        let mut parts = s.splitn(2, ':');
        let hour: u8 = parts.next()?.parse().ok()?;
        let minute: u8 = parts.next()?.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(TimeCode::Clock { hour, minute })
    }

    fn split_anchor(s: &str) -> Option<(SolarAnchor, &str)> {
        const ANCHORS: [(&str, SolarAnchor); 3] = [
            ("SUNRISE", SolarAnchor::Sunrise),
            ("SUNSET", SolarAnchor::Sunset),
            ("ZENITH", SolarAnchor::Zenith),
        ];
        for (prefix, anchor) in ANCHORS {
            if let Some(rest) = s.strip_prefix(prefix) {
                if rest.is_empty() || rest.starts_with('+') || rest.starts_with('-') {
                    return Some((anchor, rest));
                }
            }
        }
        None
    }
}

impl std::fmt::Display for TimeCode {
    /// Inverse of [`TimeCode::parse`] — used when rewriting the schedule
    /// document (§6) so a round trip through this type never drifts.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeCode::Clock { hour, minute } => write!(f, "{hour:02}:{minute:02}"),
            TimeCode::Solar { anchor, offset_minutes } => {
                let anchor_str = match anchor {
                    SolarAnchor::Sunrise => "SUNRISE",
                    SolarAnchor::Sunset => "SUNSET",
                    SolarAnchor::Zenith => "ZENITH",
                };
                match offset_minutes.cmp(&0) {
                    std::cmp::Ordering::Equal => write!(f, "{anchor_str}"),
                    std::cmp::Ordering::Greater => write!(f, "{anchor_str}+{offset_minutes}"),
                    std::cmp::Ordering::Less => write!(f, "{anchor_str}{offset_minutes}"),
                }
            }
        }
    }
}

/// The three solar anchors for a single civil date, already localised to
/// the garden's time zone.
#[derive(Debug, Clone)]
pub struct SolarTimes {
    pub sunrise: DateTime<Tz>,
    pub sunset: DateTime<Tz>,
    pub zenith: DateTime<Tz>,
}

fn compute_solar_times(date: NaiveDate, lat: f64, lon: f64, tz: Tz) -> Option<SolarTimes> {
    let coordinates = Coordinates::new(lat, lon)?;
    let solar_day = SolarDay::new(coordinates, date);
    let sunrise_utc = solar_day.event_time(SolarEvent::Sunrise);
    let sunset_utc = solar_day.event_time(SolarEvent::Sunset);
    // `sunrise` exposes only rise/set; true solar transit is approximated
    // as their midpoint (see SPEC_FULL.md §4.C — documented open-question
    // resolution, acceptable at the ±N-minute precision this system uses).
    let zenith_utc = sunrise_utc + (sunset_utc - sunrise_utc) / 2;
    Some(SolarTimes {
        sunrise: sunrise_utc.with_timezone(&tz),
        sunset: sunset_utc.with_timezone(&tz),
        zenith: zenith_utc.with_timezone(&tz),
    })
}

/// Per-date cache of solar anchors, bounded to the last 7 distinct dates
/// (matches `original_source/core/scheduler.py`'s `solar_times_cache`).
pub struct SolarCache {
    entries: VecDeque<(NaiveDate, SolarTimes)>,
    capacity: usize,
}

impl Default for SolarCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SolarCache {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: 7,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_or_compute(&mut self, date: NaiveDate, lat: f64, lon: f64, tz: Tz) -> Option<SolarTimes> {
        if let Some((_, times)) = self.entries.iter().find(|(d, _)| *d == date) {
            return Some(times.clone());
        }
        let times = compute_solar_times(date, lat, lon, tz)?;
        self.entries.push_back((date, times.clone()));
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        Some(times)
    }
}

/// Resolves Time Codes into absolute instants, owning the per-date solar
/// cache across calls.
pub struct TimeResolver {
    cache: SolarCache,
}

impl Default for TimeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeResolver {
    pub fn new() -> Self {
        Self {
            cache: SolarCache::new(),
        }
    }

    pub fn resolve(
        &mut self,
        code: &TimeCode,
        date: NaiveDate,
        lat: f64,
        lon: f64,
        tz: Tz,
    ) -> Option<DateTime<Tz>> {
        match *code {
            TimeCode::Clock { hour, minute } => {
                let naive = date.and_hms_opt(hour as u32, minute as u32, 0)?;
                tz.from_local_datetime(&naive).single()
            }
            TimeCode::Solar {
                anchor,
                offset_minutes,
            } => {
                let times = self.cache.get_or_compute(date, lat, lon, tz)?;
                let base = match anchor {
                    SolarAnchor::Sunrise => times.sunrise,
                    SolarAnchor::Sunset => times.sunset,
                    SolarAnchor::Zenith => times.zenith,
                };
                Some(base + Duration::minutes(offset_minutes as i64))
            }
        }
    }
}
