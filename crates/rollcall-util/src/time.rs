//! Time utilities for rollcalld
//!
//! Everything the monitor compares is wall-clock local time: class windows,
//! the daily reset boundary, and the timestamps carried by relayed messages.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `ROLLCALL_MOCK_TIME` environment variable overrides
//! the system time. The mock clock advances at the real rate from the given
//! instant.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2026-10-15 14:30:00`)

use chrono::{
    DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Weekday,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "ROLLCALL_MOCK_TIME";

static MOCK_TIME_OFFSET: OnceLock<Option<ChronoDuration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)]
fn get_mock_time_offset() -> Option<ChronoDuration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let raw = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S") else {
                tracing::warn!(
                    mock_time = %raw,
                    expected_format = "%Y-%m-%d %H:%M:%S",
                    "Invalid mock time format"
                );
                return None;
            };
            let mock = local_from_naive(naive)?;
            let offset = mock.signed_duration_since(Local::now());
            tracing::info!(mock_time = %raw, offset_secs = offset.num_seconds(), "Mock time enabled");
            Some(offset)
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Current local time, honouring `ROLLCALL_MOCK_TIME` in debug builds.
#[allow(clippy::disallowed_methods)]
pub fn now() -> DateTime<Local> {
    let real_now = Local::now();
    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Resolve a naive local datetime, taking the earlier instant on DST folds.
pub fn local_from_naive(naive: NaiveDateTime) -> Option<DateTime<Local>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

/// Time elapsed from `since` to `now`, zero if `since` is in the future.
pub fn elapsed(now: DateTime<Local>, since: DateTime<Local>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Whole minutes, as used in alert texts.
pub fn whole_minutes(d: Duration) -> u64 {
    d.as_secs() / 60
}

/// Wall-clock time of day with minute resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
}

impl WallClock {
    pub const MIDNIGHT: WallClock = WallClock { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    /// This time of day on `date`, in the local zone.
    pub fn on(self, date: NaiveDate) -> Option<DateTime<Local>> {
        local_from_naive(date.and_time(self.to_naive_time()))
    }
}

impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.hour, self.minute).cmp(&(other.hour, other.minute))
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Error returned when an "HH:MM" string does not parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallClockParseError(pub String);

impl fmt::Display for WallClockParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time '{}', expected HH:MM", self.0)
    }
}

impl std::error::Error for WallClockParseError {}

impl FromStr for WallClock {
    type Err = WallClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WallClockParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        WallClock::new(hour, minute).ok_or_else(err)
    }
}

impl Serialize for WallClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WallClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Days of the week mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const MONDAY: u8 = 1 << 0;
    pub const TUESDAY: u8 = 1 << 1;
    pub const WEDNESDAY: u8 = 1 << 2;
    pub const THURSDAY: u8 = 1 << 3;
    pub const FRIDAY: u8 = 1 << 4;
    pub const SATURDAY: u8 = 1 << 5;
    pub const SUNDAY: u8 = 1 << 6;

    pub const WEEKENDS: DaysOfWeek = DaysOfWeek(Self::SATURDAY | Self::SUNDAY);
    pub const NONE: DaysOfWeek = DaysOfWeek(0);

    pub fn new(mask: u8) -> Self {
        Self(mask & 0x7F)
    }

    fn bit(weekday: Weekday) -> u8 {
        match weekday {
            Weekday::Mon => Self::MONDAY,
            Weekday::Tue => Self::TUESDAY,
            Weekday::Wed => Self::WEDNESDAY,
            Weekday::Thu => Self::THURSDAY,
            Weekday::Fri => Self::FRIDAY,
            Weekday::Sat => Self::SATURDAY,
            Weekday::Sun => Self::SUNDAY,
        }
    }

    pub fn with(self, weekday: Weekday) -> Self {
        Self(self.0 | Self::bit(weekday))
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        (self.0 & Self::bit(weekday)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Parse a weekday name ("mon", "monday", "월").
pub fn parse_weekday(name: &str) -> Option<Weekday> {
    match name.trim().to_lowercase().as_str() {
        "mon" | "monday" | "월" => Some(Weekday::Mon),
        "tue" | "tuesday" | "화" => Some(Weekday::Tue),
        "wed" | "wednesday" | "수" => Some(Weekday::Wed),
        "thu" | "thursday" | "목" => Some(Weekday::Thu),
        "fri" | "friday" | "금" => Some(Weekday::Fri),
        "sat" | "saturday" | "토" => Some(Weekday::Sat),
        "sun" | "sunday" | "일" => Some(Weekday::Sun),
        _ => None,
    }
}

/// A same-day window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    pub start: WallClock,
    pub end: WallClock,
}

impl DailyWindow {
    pub fn new(start: WallClock, end: WallClock) -> Self {
        Self { start, end }
    }

    /// Whether the time of day of `dt` falls inside the window.
    pub fn contains(&self, dt: &DateTime<Local>) -> bool {
        let time = WallClock::from_naive_time(dt.time());
        time >= self.start && time < self.end
    }

    /// The window's start instant on the day of `dt`.
    pub fn start_on(&self, dt: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.start.on(dt.date_naive())
    }

    /// The window's end instant on the day of `dt`.
    pub fn end_on(&self, dt: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.end.on(dt.date_naive())
    }
}

/// Most recent instant at or before `now` whose time of day is `at`.
pub fn most_recent_boundary(now: DateTime<Local>, at: WallClock) -> DateTime<Local> {
    let today = now.date_naive();
    match at.on(today) {
        Some(boundary) if boundary <= now => boundary,
        _ => today
            .pred_opt()
            .and_then(|yesterday| at.on(yesterday))
            .unwrap_or(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wall_clock_parses_hh_mm() {
        assert_eq!("09:05".parse::<WallClock>().unwrap(), WallClock::new(9, 5).unwrap());
        assert_eq!("9:05".parse::<WallClock>().unwrap(), WallClock::new(9, 5).unwrap());
        assert!("24:00".parse::<WallClock>().is_err());
        assert!("12:5".parse::<WallClock>().is_err());
        assert!("noon".parse::<WallClock>().is_err());
    }

    #[test]
    fn wall_clock_serde_uses_string_form() {
        let wc = WallClock::new(18, 40).unwrap();
        let json = serde_json::to_string(&wc).unwrap();
        assert_eq!(json, "\"18:40\"");
        let back: WallClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wc);
    }

    #[test]
    fn daily_window_is_half_open() {
        let lunch = DailyWindow::new(WallClock::new(11, 50).unwrap(), WallClock::new(12, 50).unwrap());
        assert!(!lunch.contains(&at(2026, 10, 15, 11, 49)));
        assert!(lunch.contains(&at(2026, 10, 15, 11, 50)));
        assert!(lunch.contains(&at(2026, 10, 15, 12, 49)));
        assert!(!lunch.contains(&at(2026, 10, 15, 12, 50)));
    }

    #[test]
    fn boundary_before_reset_time_is_yesterday() {
        let reset = WallClock::new(9, 0).unwrap();
        assert_eq!(most_recent_boundary(at(2026, 10, 15, 8, 30), reset), at(2026, 10, 14, 9, 0));
        assert_eq!(most_recent_boundary(at(2026, 10, 15, 9, 0), reset), at(2026, 10, 15, 9, 0));
        assert_eq!(most_recent_boundary(at(2026, 10, 15, 17, 0), reset), at(2026, 10, 15, 9, 0));
    }

    #[test]
    fn elapsed_saturates() {
        let a = at(2026, 10, 15, 10, 0);
        let b = at(2026, 10, 15, 10, 25);
        assert_eq!(elapsed(b, a), Duration::from_secs(25 * 60));
        assert_eq!(elapsed(a, b), Duration::ZERO);
    }

    #[test]
    fn weekday_names() {
        assert_eq!(parse_weekday("Sat"), Some(Weekday::Sat));
        assert_eq!(parse_weekday("일"), Some(Weekday::Sun));
        assert_eq!(parse_weekday("someday"), None);
        let mask = DaysOfWeek::NONE.with(Weekday::Sat);
        assert!(mask.contains(Weekday::Sat));
        assert!(!mask.contains(Weekday::Sun));
    }

    #[test]
    fn test_mock_time_env_var_name() {
        assert_eq!(MOCK_TIME_ENV_VAR, "ROLLCALL_MOCK_TIME");
    }
}
