//! Recurrence Evaluator (component D, §4.D). Decides whether a zone's
//! schedule entry fires on a given civil date.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Recurrence period of a Schedule Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "D")]
    Daily,
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "M")]
    Monthly,
}

/// Decide whether a schedule entry with the given period and anchor date
/// fires on `today`.
///
/// Monthly entries anchored on a day that does not exist in the current
/// month (e.g. anchor day 31 in a 30-day month) simply never fire that
/// month. This mirrors the original source exactly and is documented as
/// accepted behaviour rather than a bug (SPEC_FULL.md §9).
pub fn fires_today(period: Period, anchor_date: NaiveDate, today: NaiveDate) -> bool {
    match period {
        Period::Daily => true,
        Period::Weekly => today.weekday() == anchor_date.weekday(),
        Period::Monthly => today.day() == anchor_date.day(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn daily_always_fires() {
        let anchor = d(2026, 1, 1);
        for day in 1..=28u32 {
            assert!(fires_today(Period::Daily, anchor, d(2026, 2, day)));
        }
    }

    #[test]
    fn weekly_fires_on_matching_weekday() {
        // 2026-07-28 is a Tuesday.
        let anchor = d(2026, 7, 28);
        assert!(fires_today(Period::Weekly, anchor, d(2026, 8, 4))); // next Tuesday
        assert!(!fires_today(Period::Weekly, anchor, d(2026, 8, 5))); // Wednesday
    }

    #[test]
    fn monthly_fires_on_matching_day_of_month() {
        let anchor = d(2026, 1, 15);
        assert!(fires_today(Period::Monthly, anchor, d(2026, 3, 15)));
        assert!(!fires_today(Period::Monthly, anchor, d(2026, 3, 14)));
    }

    #[test]
    fn monthly_anchor_on_31st_never_fires_in_shorter_months() {
        let anchor = d(2026, 1, 31);
        // February has no 31st; day() comparison can never match.
        for day in 1..=28u32 {
            assert!(!fires_today(Period::Monthly, anchor, d(2026, 2, day)));
        }
    }

    #[test]
    fn cycles_per_period_does_not_influence_fires_today() {
        // fires_today takes no cycles parameter at all — cycles only
        // constrains the length of a Schedule Entry's Times list.
        let anchor = d(2026, 1, 1);
        assert!(fires_today(Period::Daily, anchor, d(2026, 6, 1)));
    }
}
