//! Configuration validation

use crate::schema::{RawConfig, RawMonitorConfig};
use chrono::NaiveDate;
use rollcall_util::{parse_weekday, DaysOfWeek, WallClock};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid time for {field} '{value}': expected HH:MM")]
    InvalidTimeFormat { field: &'static str, value: String },

    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Unknown weekday: {0}")]
    InvalidWeekday(String),

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Duplicate student name: {0}")]
    DuplicateStudent(String),

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_monitor(&config.monitor);

    if let Some(names) = &config.calendar.excluded_weekdays {
        if let Err(e) = parse_weekdays(names) {
            errors.push(e);
        }
    }
    for day in &config.calendar.holidays {
        if parse_date(day).is_none() {
            errors.push(ValidationError::InvalidDate(day.clone()));
        }
    }

    let mut seen = HashSet::new();
    for student in &config.students {
        let name = student.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::GlobalError("student name cannot be empty".into()));
        } else if !seen.insert(name.to_string()) {
            errors.push(ValidationError::DuplicateStudent(name.to_string()));
        }
    }

    if let Some(relay) = &config.relay {
        if relay.presence_channel.trim().is_empty() {
            errors.push(ValidationError::GlobalError("relay.presence_channel cannot be empty".into()));
        }
        if relay.history_page_size == Some(0) {
            errors.push(ValidationError::NotPositive { field: "relay.history_page_size" });
        }
        if relay.history_max_attempts == Some(0) {
            errors.push(ValidationError::NotPositive { field: "relay.history_max_attempts" });
        }
    }
    if let Some(notifier) = &config.notifier {
        if notifier.admin_channel.trim().is_empty() {
            errors.push(ValidationError::GlobalError("notifier.admin_channel cannot be empty".into()));
        }
    }

    errors
}

fn validate_monitor(monitor: &RawMonitorConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let durations = [
        ("monitor.check_interval_seconds", monitor.check_interval_seconds),
        ("monitor.camera_off_threshold_minutes", monitor.camera_off_threshold_minutes),
        ("monitor.alert_cooldown_minutes", monitor.alert_cooldown_minutes),
        ("monitor.leave_alert_threshold_minutes", monitor.leave_alert_threshold_minutes),
        ("monitor.leave_alert_cooldown_minutes", monitor.leave_alert_cooldown_minutes),
        ("monitor.return_reminder_minutes", monitor.return_reminder_minutes),
    ];
    for (field, value) in durations {
        if value == Some(0) {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    let mut time = |field: &'static str, value: &Option<String>| -> Option<WallClock> {
        let value = value.as_ref()?;
        match parse_time(value) {
            Ok(t) => Some(t),
            Err(_) => {
                errors.push(ValidationError::InvalidTimeFormat {
                    field,
                    value: value.clone(),
                });
                None
            }
        }
    };

    let class_start = time("monitor.class_start", &monitor.class_start);
    let class_end = time("monitor.class_end", &monitor.class_end);
    let lunch_start = time("monitor.lunch_start", &monitor.lunch_start);
    let lunch_end = time("monitor.lunch_end", &monitor.lunch_end);
    time("monitor.daily_reset_time", &monitor.daily_reset_time);

    let class_start = class_start.unwrap_or(crate::DEFAULT_CLASS_START);
    let class_end = class_end.unwrap_or(crate::DEFAULT_CLASS_END);
    if class_start >= class_end {
        errors.push(ValidationError::InvalidWindow(format!(
            "class window {}-{} must start before it ends",
            class_start, class_end
        )));
    }

    match (lunch_start, lunch_end) {
        (Some(start), Some(end)) => {
            if start >= end {
                errors.push(ValidationError::InvalidWindow(format!(
                    "lunch window {}-{} must start before it ends",
                    start, end
                )));
            } else if start < class_start || end > class_end {
                errors.push(ValidationError::InvalidWindow(format!(
                    "lunch window {}-{} must lie inside the class window {}-{}",
                    start, end, class_start, class_end
                )));
            }
        }
        (None, None) => {}
        _ if monitor.lunch_start.is_some() != monitor.lunch_end.is_some() => {
            errors.push(ValidationError::InvalidWindow(
                "lunch_start and lunch_end must be set together".into(),
            ));
        }
        // One side failed to parse and was already reported
        _ => {}
    }

    errors
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<WallClock, String> {
    s.parse::<WallClock>().map_err(|e| e.to_string())
}

/// Parse a YYYY-MM-DD date
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse a list of weekday names into a mask
pub fn parse_weekdays(names: &[String]) -> Result<DaysOfWeek, ValidationError> {
    names.iter().try_fold(DaysOfWeek::NONE, |mask, name| {
        parse_weekday(name)
            .map(|day| mask.with(day))
            .ok_or_else(|| ValidationError::InvalidWeekday(name.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawCalendarConfig, RawStudent};
    use chrono::Weekday;

    fn config_with(monitor: RawMonitorConfig) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: Default::default(),
            monitor,
            relay: None,
            notifier: None,
            calendar: RawCalendarConfig::default(),
            students: vec![],
        }
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("14:30").unwrap(), WallClock::new(14, 30).unwrap());
        assert!(parse_time("24:00").is_err());
        assert!(parse_time("12:60").is_err());
        assert!(parse_time("invalid").is_err());
    }

    #[test]
    fn test_parse_weekdays() {
        let mask = parse_weekdays(&["sat".into(), "sun".into()]).unwrap();
        assert!(mask.contains(Weekday::Sat));
        assert!(!mask.contains(Weekday::Mon));
        assert!(matches!(
            parse_weekdays(&["funday".into()]),
            Err(ValidationError::InvalidWeekday(_))
        ));
    }

    #[test]
    fn reports_every_problem_at_once() {
        let config = config_with(RawMonitorConfig {
            camera_off_threshold_minutes: Some(0),
            class_start: Some("19:00".into()),
            lunch_start: Some("25:00".into()),
            lunch_end: Some("13:00".into()),
            ..Default::default()
        });

        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::NotPositive { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidWindow(_))));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidTimeFormat { field: "monitor.lunch_start", .. }
        )));
    }

    #[test]
    fn lunch_must_sit_inside_class_hours() {
        let config = config_with(RawMonitorConfig {
            class_start: Some("10:00".into()),
            class_end: Some("18:00".into()),
            lunch_start: Some("09:00".into()),
            lunch_end: Some("10:30".into()),
            ..Default::default()
        });
        let errors = validate_config(&config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::InvalidWindow(_)));
    }

    #[test]
    fn half_configured_lunch_is_rejected() {
        let config = config_with(RawMonitorConfig {
            lunch_start: Some("12:00".into()),
            ..Default::default()
        });
        assert!(!validate_config(&config).is_empty());
    }

    #[test]
    fn duplicate_students_are_reported() {
        let mut config = config_with(RawMonitorConfig::default());
        config.students = vec![
            RawStudent { name: "김유나".into(), contact_id: None, admin: false },
            RawStudent { name: " 김유나 ".into(), contact_id: Some("1".into()), admin: false },
        ];
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateStudent(_))));
    }
}
