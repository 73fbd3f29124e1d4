//! UTC time discipline and DST-aware civil windows.
//!
//! Every instant that crosses a crate boundary or touches disk is a
//! `DateTime<Utc>` rendered with an explicit `+00:00` offset.  Civil
//! day/week windows are computed with zone-aware arithmetic so DST
//! transition days come out as 23h or 25h intervals, never as fixed
//! offsets.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use chrono::offset::LocalResult;
use chrono_tz::Tz;
use thiserror::Error;

/// Canonical on-disk timestamp format: seconds precision, explicit offset.
pub const UTC_FORMAT: &str = "%Y-%m-%dT%H:%M:%S+00:00";

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("timestamp '{0}' is not ISO-8601 with an explicit offset")]
    Unparseable(String),
    #[error("unknown time zone '{0}'")]
    UnknownZone(String),
}

/// Current instant in UTC, truncated to whole seconds.
///
/// Sub-second precision is dropped so that `parse(format(now_utc()))`
/// is exact.
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render an instant in the canonical `+00:00` form.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format(UTC_FORMAT).to_string()
}

/// Parse an ISO-8601 timestamp carrying an explicit offset.
///
/// `Z` and any non-zero offset are accepted and normalized to UTC;
/// naive timestamps are rejected.  Sub-second digits are truncated for
/// the same reason [`now_utc`] truncates them.
pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|_| TimeError::Unparseable(raw.to_string()))?;
    let utc = parsed.with_timezone(&Utc);
    Ok(utc.with_nanosecond(0).unwrap_or(utc))
}

/// Resolve a named IANA zone.
pub fn parse_zone(name: &str) -> Result<Tz, TimeError> {
    name.parse::<Tz>()
        .map_err(|_| TimeError::UnknownZone(name.to_string()))
}

/// A civil day or week projected onto UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilWindow {
    pub utc_start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub utc_end: DateTime<Utc>,
    /// True when the window crosses a DST boundary (duration differs
    /// from the nominal 24h / 168h).
    pub dst_transition: bool,
}

impl CivilWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.utc_start && ts < self.utc_end
    }

    pub fn duration(&self) -> Duration {
        self.utc_end - self.utc_start
    }
}

/// The `[00:00, 24:00)` interval of `date` in `zone`, in UTC.
pub fn day_window(date: NaiveDate, zone: Tz) -> CivilWindow {
    let next = date.succ_opt().unwrap_or(NaiveDate::MAX);
    let utc_start = local_midnight(date, zone);
    let utc_end = local_midnight(next, zone);
    CivilWindow {
        utc_start,
        utc_end,
        dst_transition: utc_end - utc_start != Duration::hours(24),
    }
}

/// The Monday-based week containing `date` in `zone`, in UTC.
pub fn week_window(date: NaiveDate, zone: Tz) -> CivilWindow {
    let monday = date.week(Weekday::Mon).first_day();
    let next_monday = monday
        .checked_add_days(chrono::Days::new(7))
        .unwrap_or(NaiveDate::MAX);
    let utc_start = local_midnight(monday, zone);
    let utc_end = local_midnight(next_monday, zone);
    CivilWindow {
        utc_start,
        utc_end,
        dst_transition: utc_end - utc_start != Duration::hours(24 * 7),
    }
}

/// First valid instant of `date` in `zone`, converted to UTC.
///
/// On a spring-forward day where midnight itself does not exist the
/// probe walks forward in 15-minute steps until the zone yields a real
/// instant (the window still exists, just shorter).  Ambiguous local
/// midnights (fall-back) resolve to the earlier instant.
fn local_midnight(date: NaiveDate, zone: Tz) -> DateTime<Utc> {
    let mut naive = date.and_time(NaiveTime::MIN);
    for _ in 0..8 {
        match naive.and_local_timezone(zone) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => naive += Duration::minutes(15),
        }
    }
    // No real zone skips more than two hours; treat the date as UTC.
    DateTime::from_naive_utc_and_offset(date.and_time(NaiveTime::MIN), Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_carries_explicit_offset() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 8, 13, 42, 17).unwrap();
        assert_eq!(format_utc(ts), "2025-10-08T13:42:17+00:00");
    }

    #[test]
    fn parse_rejects_naive_timestamps() {
        assert!(parse_utc("2025-10-08T13:42:17").is_err());
        assert!(parse_utc("2025-10-08 13:42").is_err());
    }

    #[test]
    fn parse_normalizes_z_and_offsets() {
        let a = parse_utc("2025-10-08T13:42:17Z").unwrap();
        let b = parse_utc("2025-10-08T15:42:17+02:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(format_utc(a), "2025-10-08T13:42:17+00:00");
    }

    #[test]
    fn parse_format_round_trip() {
        let ts = now_utc();
        assert_eq!(parse_utc(&format_utc(ts)).unwrap(), ts);
    }

    #[test]
    fn plain_day_is_24h() {
        let zone = parse_zone("Europe/Brussels").unwrap();
        let w = day_window(NaiveDate::from_ymd_opt(2025, 7, 15).unwrap(), zone);
        assert_eq!(w.duration(), Duration::hours(24));
        assert!(!w.dst_transition);
    }

    #[test]
    fn fall_back_day_is_25h() {
        let zone = parse_zone("Europe/Brussels").unwrap();
        let w = day_window(NaiveDate::from_ymd_opt(2025, 10, 26).unwrap(), zone);
        assert_eq!(w.duration(), Duration::hours(25));
        assert!(w.dst_transition);
        assert_eq!(w.utc_start, Utc.with_ymd_and_hms(2025, 10, 25, 22, 0, 0).unwrap());
        assert_eq!(w.utc_end, Utc.with_ymd_and_hms(2025, 10, 26, 23, 0, 0).unwrap());
    }

    #[test]
    fn spring_forward_day_is_23h() {
        let zone = parse_zone("Europe/Brussels").unwrap();
        let w = day_window(NaiveDate::from_ymd_opt(2025, 3, 30).unwrap(), zone);
        assert_eq!(w.duration(), Duration::hours(23));
        assert!(w.dst_transition);
    }

    #[test]
    fn week_window_starts_monday_and_flags_dst() {
        let zone = parse_zone("Europe/Brussels").unwrap();
        // 2025-10-26 (fall-back Sunday) falls in the week of Mon 2025-10-20.
        let w = week_window(NaiveDate::from_ymd_opt(2025, 10, 23).unwrap(), zone);
        assert_eq!(w.duration(), Duration::hours(169));
        assert!(w.dst_transition);
    }

    #[test]
    fn gap_midnight_still_yields_a_window() {
        // America/Sao_Paulo historically sprang forward at midnight, so
        // 2018-11-04 had no 00:00 local.
        let zone = parse_zone("America/Sao_Paulo").unwrap();
        let w = day_window(NaiveDate::from_ymd_opt(2018, 11, 4).unwrap(), zone);
        assert_eq!(w.duration(), Duration::hours(23));
        assert!(w.dst_transition);
    }
}
