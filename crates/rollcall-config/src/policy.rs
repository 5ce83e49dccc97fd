//! Validated policy structures

use crate::schema::{
    RawCalendarConfig, RawConfig, RawMonitorConfig, RawNotifierConfig, RawRelayConfig,
    RawServiceConfig, RawStudent,
};
use crate::validation::{parse_date, parse_time, parse_weekdays};
use chrono::{Datelike, NaiveDate};
use rollcall_util::{default_data_dir, default_socket_path, DailyWindow, DaysOfWeek, WallClock};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CLASS_START: WallClock = WallClock { hour: 10, minute: 10 };
pub const DEFAULT_CLASS_END: WallClock = WallClock { hour: 18, minute: 40 };
pub const DEFAULT_LUNCH_START: WallClock = WallClock { hour: 11, minute: 50 };
pub const DEFAULT_LUNCH_END: WallClock = WallClock { hour: 12, minute: 50 };

/// Name parts that denote a role in the classroom tool rather than a person
pub const DEFAULT_ROLE_KEYWORDS: &[&str] = &[
    "조교", "주강사", "멘토", "매니저", "코치", "개발자", "학생", "수강생", "교육생", "강사",
    "관리자", "운영자", "팀장", "회장", "강의", "실습", "프로젝트", "팀",
];

fn minutes(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default) * 60)
}

/// Validated policy ready for use by the daemon and the engine
#[derive(Debug, Clone)]
pub struct Policy {
    pub service: ServiceConfig,
    pub monitor: MonitorPolicy,
    pub relay: Option<RelayConfig>,
    pub notifier: Option<NotifierConfig>,
    pub calendar: CalendarPolicy,
    pub students: Vec<SeedStudent>,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            monitor: MonitorPolicy::from_raw(raw.monitor),
            relay: raw.relay.map(RelayConfig::from_raw),
            notifier: raw.notifier.map(NotifierConfig::from_raw),
            calendar: CalendarPolicy::from_raw(raw.calendar),
            students: raw.students.into_iter().map(SeedStudent::from_raw).collect(),
        }
    }
}

/// Process-level settings; not hot-reloadable
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub warmup: Duration,
    pub shutdown_grace: Duration,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            warmup: Duration::from_secs(raw.warmup_seconds.unwrap_or(60)),
            shutdown_grace: Duration::from_secs(raw.shutdown_grace_seconds.unwrap_or(10)),
        }
    }
}

/// Everything the engine evaluates against; swapped wholesale on reload
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorPolicy {
    pub check_interval: Duration,
    pub camera_off_threshold: Duration,
    pub alert_cooldown: Duration,
    pub leave_alert_threshold: Duration,
    pub leave_alert_cooldown: Duration,
    pub return_reminder_interval: Duration,
    pub class_window: DailyWindow,
    pub lunch_window: Option<DailyWindow>,
    pub daily_reset_time: WallClock,
    pub ignore_keywords: Vec<String>,
    pub role_keywords: Vec<String>,
}

impl MonitorPolicy {
    fn from_raw(raw: RawMonitorConfig) -> Self {
        let time = |value: &Option<String>, default: WallClock| {
            value
                .as_deref()
                .and_then(|v| parse_time(v).ok())
                .unwrap_or(default)
        };

        let lunch_window = match (&raw.lunch_start, &raw.lunch_end) {
            (None, None) => Some(DailyWindow::new(DEFAULT_LUNCH_START, DEFAULT_LUNCH_END)),
            (start, end) => Some(DailyWindow::new(
                time(start, DEFAULT_LUNCH_START),
                time(end, DEFAULT_LUNCH_END),
            )),
        }
        // An empty window ("12:00" to "12:00") disables lunch
        .filter(|w| w.start < w.end);

        Self {
            check_interval: Duration::from_secs(raw.check_interval_seconds.unwrap_or(60)),
            camera_off_threshold: minutes(raw.camera_off_threshold_minutes, 20),
            alert_cooldown: minutes(raw.alert_cooldown_minutes, 60),
            leave_alert_threshold: minutes(raw.leave_alert_threshold_minutes, 30),
            leave_alert_cooldown: minutes(raw.leave_alert_cooldown_minutes, 60),
            return_reminder_interval: minutes(raw.return_reminder_minutes, 10),
            class_window: DailyWindow::new(
                time(&raw.class_start, DEFAULT_CLASS_START),
                time(&raw.class_end, DEFAULT_CLASS_END),
            ),
            lunch_window,
            daily_reset_time: time(&raw.daily_reset_time, WallClock::MIDNIGHT),
            ignore_keywords: raw.ignore_keywords.unwrap_or_default(),
            role_keywords: raw.role_keywords.unwrap_or_else(|| {
                DEFAULT_ROLE_KEYWORDS.iter().map(|s| s.to_string()).collect()
            }),
        }
    }
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self::from_raw(RawMonitorConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_base: String,
    pub token_env: String,
    pub presence_channel: String,
    pub status_channel: Option<String>,
    pub poll_interval: Duration,
    pub history_page_size: u32,
    pub history_max_attempts: u32,
    pub request_timeout: Duration,
}

impl RelayConfig {
    fn from_raw(raw: RawRelayConfig) -> Self {
        Self {
            api_base: raw
                .api_base
                .unwrap_or_else(|| "https://slack.com/api".into()),
            token_env: raw
                .token_env
                .unwrap_or_else(|| "ROLLCALL_RELAY_TOKEN".into()),
            presence_channel: raw.presence_channel,
            status_channel: raw.status_channel,
            poll_interval: Duration::from_secs(raw.poll_interval_seconds.unwrap_or(5)),
            history_page_size: raw.history_page_size.unwrap_or(200),
            history_max_attempts: raw.history_max_attempts.unwrap_or(5),
            request_timeout: Duration::from_secs(raw.request_timeout_seconds.unwrap_or(10)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub api_base: String,
    pub token_env: String,
    pub admin_channel: String,
    pub request_timeout: Duration,
}

impl NotifierConfig {
    fn from_raw(raw: RawNotifierConfig) -> Self {
        Self {
            api_base: raw
                .api_base
                .unwrap_or_else(|| "https://discord.com/api/v10".into()),
            token_env: raw
                .token_env
                .unwrap_or_else(|| "ROLLCALL_NOTIFIER_TOKEN".into()),
            admin_channel: raw.admin_channel,
            request_timeout: Duration::from_secs(raw.request_timeout_seconds.unwrap_or(10)),
        }
    }
}

/// Days on which monitoring is skipped entirely
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarPolicy {
    pub excluded_weekdays: DaysOfWeek,
    pub holidays: Vec<NaiveDate>,
}

impl CalendarPolicy {
    fn from_raw(raw: RawCalendarConfig) -> Self {
        let excluded_weekdays = match raw.excluded_weekdays {
            Some(names) => parse_weekdays(&names).unwrap_or(DaysOfWeek::WEEKENDS),
            None => DaysOfWeek::WEEKENDS,
        };
        let mut holidays: Vec<NaiveDate> =
            raw.holidays.iter().filter_map(|d| parse_date(d)).collect();
        holidays.sort();
        holidays.dedup();
        Self {
            excluded_weekdays,
            holidays,
        }
    }

    pub fn is_excluded(&self, date: NaiveDate) -> bool {
        self.excluded_weekdays.contains(date.weekday()) || self.holidays.binary_search(&date).is_ok()
    }
}

impl Default for CalendarPolicy {
    fn default() -> Self {
        Self::from_raw(RawCalendarConfig::default())
    }
}

/// Roster entry from the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedStudent {
    pub name: String,
    pub contact_id: Option<String>,
    pub is_admin: bool,
}

impl SeedStudent {
    fn from_raw(raw: RawStudent) -> Self {
        Self {
            name: raw.name.trim().to_string(),
            contact_id: raw.contact_id.filter(|c| !c.trim().is_empty()),
            is_admin: raw.admin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_defaults_follow_classroom_schedule() {
        let policy = MonitorPolicy::default();
        assert_eq!(policy.camera_off_threshold, Duration::from_secs(20 * 60));
        assert_eq!(policy.alert_cooldown, Duration::from_secs(60 * 60));
        assert_eq!(policy.check_interval, Duration::from_secs(60));
        assert_eq!(policy.class_window.start, DEFAULT_CLASS_START);
        assert_eq!(
            policy.lunch_window,
            Some(DailyWindow::new(DEFAULT_LUNCH_START, DEFAULT_LUNCH_END))
        );
        assert_eq!(policy.daily_reset_time, WallClock::MIDNIGHT);
        assert!(policy.role_keywords.iter().any(|k| k == "조교"));
    }

    #[test]
    fn calendar_excludes_weekends_and_holidays() {
        let calendar = CalendarPolicy::from_raw(RawCalendarConfig {
            excluded_weekdays: None,
            holidays: vec!["2026-10-09".into()],
        });
        // Friday holiday
        assert!(calendar.is_excluded(NaiveDate::from_ymd_opt(2026, 10, 9).unwrap()));
        // Saturday
        assert!(calendar.is_excluded(NaiveDate::from_ymd_opt(2026, 10, 10).unwrap()));
        // Thursday
        assert!(!calendar.is_excluded(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()));
    }
}
