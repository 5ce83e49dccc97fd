//! Holiday calendar backed by the config file

use chrono::NaiveDate;
use rollcall_channel_api::HolidayCalendar;
use rollcall_config::CalendarPolicy;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Excluded weekdays plus listed holidays; swapped on config reload
pub struct ConfiguredCalendar {
    policy: RwLock<CalendarPolicy>,
}

impl ConfiguredCalendar {
    pub fn new(policy: CalendarPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub fn replace(&self, policy: CalendarPolicy) {
        debug!(holidays = policy.holidays.len(), "Calendar updated");
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }
}

impl HolidayCalendar for ConfiguredCalendar {
    fn is_excluded(&self, date: NaiveDate) -> bool {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_excluded(date)
    }
}
