//! Monitoring windows and the daily boundary

use chrono::{DateTime, Local};
use rollcall_channel_api::HolidayCalendar;
use rollcall_config::MonitorPolicy;
use rollcall_util::most_recent_boundary;

/// Why a tick evaluated nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSkip {
    MonitoringPaused,
    ExcludedDay,
    OutsideClass,
    Lunch,
}

impl TickSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickSkip::MonitoringPaused => "monitoring_paused",
            TickSkip::ExcludedDay => "excluded_day",
            TickSkip::OutsideClass => "outside_class",
            TickSkip::Lunch => "lunch",
        }
    }
}

pub fn skip_reason(
    policy: &MonitorPolicy,
    calendar: &dyn HolidayCalendar,
    monitoring_paused: bool,
    now: DateTime<Local>,
) -> Option<TickSkip> {
    if monitoring_paused {
        Some(TickSkip::MonitoringPaused)
    } else if calendar.is_excluded(now.date_naive()) {
        Some(TickSkip::ExcludedDay)
    } else if !policy.class_window.contains(&now) {
        Some(TickSkip::OutsideClass)
    } else if policy.lunch_window.is_some_and(|lunch| lunch.contains(&now)) {
        Some(TickSkip::Lunch)
    } else {
        None
    }
}

/// Start of the monitored segment containing `now`: lunch end in the
/// afternoon, class start otherwise
pub fn segment_start(policy: &MonitorPolicy, now: DateTime<Local>) -> Option<DateTime<Local>> {
    if let Some(lunch) = policy.lunch_window {
        if let Some(lunch_end) = lunch.end_on(&now) {
            if now >= lunch_end {
                return Some(lunch_end);
            }
        }
    }
    policy.class_window.start_on(&now)
}

/// The boundary to reset at, if one passed since the last reset
pub fn reset_due(
    last_reset_at: Option<DateTime<Local>>,
    now: DateTime<Local>,
    policy: &MonitorPolicy,
) -> Option<DateTime<Local>> {
    let boundary = most_recent_boundary(now, policy.daily_reset_time);
    match last_reset_at {
        Some(last) if last >= boundary => None,
        _ => Some(boundary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_channel_api::FixedCalendar;
    use rollcall_util::WallClock;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, d, h, m, 0).unwrap()
    }

    #[test]
    fn skips_outside_class_and_at_lunch() {
        let policy = MonitorPolicy::default();
        let calendar = FixedCalendar::new();
        let skip = |t| skip_reason(&policy, &calendar, false, t);

        assert_eq!(skip(at(15, 10, 9)), Some(TickSkip::OutsideClass));
        assert_eq!(skip(at(15, 10, 10)), None);
        assert_eq!(skip(at(15, 11, 50)), Some(TickSkip::Lunch));
        assert_eq!(skip(at(15, 12, 50)), None);
        assert_eq!(skip(at(15, 18, 40)), Some(TickSkip::OutsideClass));
    }

    #[test]
    fn excluded_days_and_pause_win() {
        let policy = MonitorPolicy::default();
        let calendar = FixedCalendar::new();
        calendar.exclude(at(15, 0, 0).date_naive());
        assert_eq!(
            skip_reason(&policy, &calendar, false, at(15, 14, 0)),
            Some(TickSkip::ExcludedDay)
        );
        assert_eq!(
            skip_reason(&policy, &calendar, true, at(15, 14, 0)),
            Some(TickSkip::MonitoringPaused)
        );
    }

    #[test]
    fn segments_start_at_class_start_or_lunch_end() {
        let policy = MonitorPolicy::default();
        assert_eq!(segment_start(&policy, at(15, 11, 0)), Some(at(15, 10, 10)));
        assert_eq!(segment_start(&policy, at(15, 13, 0)), Some(at(15, 12, 50)));

        let no_lunch = MonitorPolicy {
            lunch_window: None,
            ..MonitorPolicy::default()
        };
        assert_eq!(segment_start(&no_lunch, at(15, 13, 0)), Some(at(15, 10, 10)));
    }

    #[test]
    fn reset_is_due_once_per_boundary() {
        let policy = MonitorPolicy {
            daily_reset_time: WallClock::new(6, 0).unwrap(),
            ..MonitorPolicy::default()
        };
        assert_eq!(reset_due(None, at(15, 9, 0), &policy), Some(at(15, 6, 0)));
        assert_eq!(reset_due(Some(at(15, 6, 0)), at(15, 9, 0), &policy), None);
        assert_eq!(reset_due(Some(at(14, 6, 0)), at(15, 5, 59), &policy), None);
        assert_eq!(
            reset_due(Some(at(14, 6, 0)), at(15, 6, 0), &policy),
            Some(at(15, 6, 0))
        );
    }
}
