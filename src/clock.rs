//! Monotonic time + broken-down local calendar time, behind a trait so the
//! kernel's scheduling logic can be driven by a fake clock in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// A broken-down local timestamp: everything the scheduler and executor need
/// to evaluate recurrence and format persisted dates, without re-deriving it
/// from an `OffsetDateTime` at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub year: i32,
    pub month: u8, // 1..=12
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub ordinal_day: u16, // 1..=366, day of year
}

impl LocalTime {
    pub fn hhmm(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    pub fn date_str(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    /// Absolute day count used for recurrence arithmetic. Proleptic and
    /// monotone across year boundaries — unlike the bare ordinal day, this
    /// never wraps at Dec 31 -> Jan 1.
    pub fn absolute_day(&self) -> i64 {
        self.year as i64 * 366 + self.ordinal_day as i64
    }

    fn from_offset(dt: OffsetDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month() as u8,
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            ordinal_day: dt.ordinal(),
        }
    }
}

/// Parse a persisted `YYYY-MM-DD` date into an absolute day count, using the
/// same proleptic scheme as [`LocalTime::absolute_day`]. Returns `None` if
/// the string can't be parsed.
pub fn parse_date_to_absolute_day(date: &str) -> Option<i64> {
    let mut parts = date.split('-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let date = time::Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()?;
    Some(year as i64 * 366 + date.ordinal() as i64)
}

pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary monotone epoch. Used only for durations
    /// (e.g. "how long has this zone been on"), never persisted.
    fn monotonic_secs(&self) -> i64;

    /// Current broken-down local time.
    fn local_time(&self) -> LocalTime;
}

/// Real clock: OS time, local timezone assumed UTC (embedded deployments
/// configure the system clock to local time directly, matching the original
/// firmware's `time.localtime()` which has no timezone concept of its own).
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic_secs(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn local_time(&self) -> LocalTime {
        LocalTime::from_offset(OffsetDateTime::now_utc())
    }
}

/// Deterministic clock for tests: holds a single atomic unix-timestamp that
/// tests advance explicitly. `local_time()` is derived from it, so advancing
/// the clock moves both the monotonic reading and the calendar view in
/// lockstep — there is exactly one "now" in a test, as there would be on
/// real hardware.
pub struct FakeClock {
    unix_secs: AtomicI64,
}

impl FakeClock {
    pub fn new(unix_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            unix_secs: AtomicI64::new(unix_secs),
        })
    }

    pub fn advance(&self, secs: i64) {
        self.unix_secs.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, unix_secs: i64) {
        self.unix_secs.store(unix_secs, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn monotonic_secs(&self) -> i64 {
        self.unix_secs.load(Ordering::SeqCst)
    }

    fn local_time(&self) -> LocalTime {
        let dt = OffsetDateTime::from_unix_timestamp(self.unix_secs.load(Ordering::SeqCst))
            .expect("fake clock holds a valid unix timestamp");
        LocalTime::from_offset(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advance_moves_monotonic_and_local_together() {
        let clock = FakeClock::new(1_718_000_000);
        let before = clock.local_time();
        clock.advance(3600);
        let after = clock.local_time();
        assert_eq!(clock.monotonic_secs(), 1_718_003_600);
        assert!(after.hour != before.hour || after.day != before.day);
    }

    #[test]
    fn absolute_day_does_not_wrap_at_year_boundary() {
        // 2024-12-31 and 2025-01-01 must be consecutive, not reset to 1.
        let dec31 = LocalTime {
            year: 2024,
            month: 12,
            day: 31,
            hour: 0,
            minute: 0,
            second: 0,
            ordinal_day: 366, // 2024 is a leap year
        };
        let jan1 = LocalTime {
            year: 2025,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            ordinal_day: 1,
        };
        assert_eq!(jan1.absolute_day() - dec31.absolute_day(), 1);
    }

    #[test]
    fn parse_date_to_absolute_day_matches_local_time() {
        let lt = LocalTime {
            year: 2024,
            month: 6,
            day: 15,
            hour: 6,
            minute: 0,
            second: 0,
            ordinal_day: 167,
        };
        assert_eq!(parse_date_to_absolute_day("2024-06-15"), Some(lt.absolute_day()));
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert_eq!(parse_date_to_absolute_day("not-a-date"), None);
        assert_eq!(parse_date_to_absolute_day("2024-13-01"), None);
        assert_eq!(parse_date_to_absolute_day("2024-06-15-extra"), None);
    }
}
