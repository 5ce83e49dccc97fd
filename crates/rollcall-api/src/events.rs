//! Event types for rollcalld -> dashboard streaming

use chrono::{DateTime, Local, NaiveDate};
use rollcall_util::{AlertId, StudentId};
use serde::{Deserialize, Serialize};

use crate::{AlertKind, Audience, DashboardOverview, StudentView, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: rollcall_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Aggregate counts, pushed after every tick
    Overview(DashboardOverview),

    /// One student's presence changed
    StudentChanged(StudentView),

    /// An alert was delivered and its stage committed
    AlertSent {
        alert_id: AlertId,
        student_id: StudentId,
        kind: AlertKind,
        audience: Audience,
        stage: u32,
    },

    /// An alert could not be delivered; it is retried next tick
    AlertFailed {
        student_id: StudentId,
        kind: AlertKind,
        error: String,
    },

    /// The daily boundary was crossed and counters were cleared
    DailyReset { date: NaiveDate },

    /// Presence was rebuilt from relay history
    RecoveryCompleted {
        replayed: usize,
        history_available: bool,
    },

    MonitoringPaused { paused: bool },

    NotificationsPaused { paused: bool },

    ConfigReloaded,

    /// Service is shutting down
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization() {
        let event = Event::new(EventPayload::AlertSent {
            alert_id: AlertId::new(),
            student_id: StudentId::new(3),
            kind: AlertKind::CameraOff,
            audience: Audience::Student,
            stage: 1,
        });

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.api_version, API_VERSION);
        assert!(matches!(
            parsed.payload,
            EventPayload::AlertSent { stage: 1, .. }
        ));
    }

    #[test]
    fn overview_payload_tag() {
        let event = Event::new(EventPayload::Overview(DashboardOverview::default()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "overview");
        assert_eq!(json["payload"]["total"], 0);
    }
}
