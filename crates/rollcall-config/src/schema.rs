//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    #[serde(default)]
    pub service: RawServiceConfig,

    #[serde(default)]
    pub monitor: RawMonitorConfig,

    /// Relay chat platform; absent means no live feed and no history recovery
    pub relay: Option<RawRelayConfig>,

    /// Notification platform; absent means alerts fail and are retried
    pub notifier: Option<RawNotifierConfig>,

    #[serde(default)]
    pub calendar: RawCalendarConfig,

    /// Seed roster, created in the registry if missing
    #[serde(default)]
    pub students: Vec<RawStudent>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    pub socket_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    /// No alerts are sent for this long after startup
    pub warmup_seconds: Option<u64>,
    /// How long in-flight sends may take to finish on shutdown
    pub shutdown_grace_seconds: Option<u64>,
}

/// Thresholds, windows and keyword lists used by the engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawMonitorConfig {
    pub check_interval_seconds: Option<u64>,
    pub camera_off_threshold_minutes: Option<u64>,
    pub alert_cooldown_minutes: Option<u64>,
    pub leave_alert_threshold_minutes: Option<u64>,
    pub leave_alert_cooldown_minutes: Option<u64>,
    pub return_reminder_minutes: Option<u64>,

    /// "HH:MM"
    pub class_start: Option<String>,
    pub class_end: Option<String>,
    pub lunch_start: Option<String>,
    pub lunch_end: Option<String>,
    /// "HH:MM"; midnight when absent
    pub daily_reset_time: Option<String>,

    /// Names containing any of these are never tracked
    pub ignore_keywords: Option<Vec<String>>,
    /// Name parts that denote a role rather than a person
    pub role_keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRelayConfig {
    pub api_base: Option<String>,
    /// Environment variable holding the bot token
    pub token_env: Option<String>,
    /// Channel the classroom tool relays camera/join/leave messages to
    pub presence_channel: String,
    /// Admin channel carrying free-form status reports
    pub status_channel: Option<String>,
    pub poll_interval_seconds: Option<u64>,
    pub history_page_size: Option<u32>,
    pub history_max_attempts: Option<u32>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawNotifierConfig {
    pub api_base: Option<String>,
    pub token_env: Option<String>,
    /// Channel for escalations and leave alerts
    pub admin_channel: String,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawCalendarConfig {
    /// Weekday names; weekends when absent
    pub excluded_weekdays: Option<Vec<String>>,
    /// "YYYY-MM-DD"
    #[serde(default)]
    pub holidays: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawStudent {
    pub name: String,
    pub contact_id: Option<String>,
    #[serde(default)]
    pub admin: bool,
}
