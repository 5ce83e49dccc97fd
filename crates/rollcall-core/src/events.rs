//! Presence events consumed and core events emitted by the engine

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AbsenceKind, AlertKind, Audience, DashboardOverview, StudentView};
use rollcall_util::{AlertId, StudentId};

/// A status report or admin action setting an absence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub kind: AbsenceKind,
    /// When the suppression begins; in the future means pending
    pub start: DateTime<Local>,
    /// Last covered day, inclusive
    pub end: Option<NaiveDate>,
    pub reason: Option<String>,
}

/// Normalized presence occurrence for one student
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    CameraOn,
    CameraOff,
    Join,
    Leave,
    StatusChange(StatusChange),
}

impl PresenceEvent {
    /// Camera and room events are ordered by their source timestamp;
    /// status changes are not.
    pub fn is_presence(&self) -> bool {
        !matches!(self, PresenceEvent::StatusChange(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PresenceEvent::CameraOn => "camera_on",
            PresenceEvent::CameraOff => "camera_off",
            PresenceEvent::Join => "join",
            PresenceEvent::Leave => "leave",
            PresenceEvent::StatusChange(_) => "status_change",
        }
    }
}

/// A presence event resolved to a registered student
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub student_id: StudentId,
    pub timestamp: DateTime<Local>,
    pub event: PresenceEvent,
}

/// Events emitted by the engine for the daemon to broadcast
#[derive(Debug, Clone)]
pub enum CoreEvent {
    StudentChanged(StudentView),

    AlertSent {
        alert_id: AlertId,
        student_id: StudentId,
        kind: AlertKind,
        audience: Audience,
        stage: u32,
    },

    AlertFailed {
        student_id: StudentId,
        kind: AlertKind,
        error: String,
    },

    DailyReset { date: NaiveDate },

    RecoveryCompleted {
        replayed: usize,
        history_available: bool,
    },

    MonitoringPaused { paused: bool },

    NotificationsPaused { paused: bool },

    PolicyReloaded,

    Overview(DashboardOverview),
}
