//! Audit event types

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AbsenceKind, AlertChoice, AlertKind, Audience};
use rollcall_util::{AlertId, StudentId};
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    ConfigReloaded { success: bool },

    /// Presence rebuilt from relay history after a restart
    RecoveryCompleted {
        replayed: usize,
        history_available: bool,
    },

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

    AlertResponse {
        alert_id: AlertId,
        student_id: StudentId,
        choice: AlertChoice,
    },

    StatusSet {
        student_id: StudentId,
        kind: AbsenceKind,
        start: DateTime<Local>,
        end: Option<NaiveDate>,
        /// "relay", "admin" or "response"
        source: String,
    },

    StatusCleared {
        student_id: StudentId,
        kind: AbsenceKind,
    },

    DailyReset { date: NaiveDate },

    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Set by the store
    pub id: i64,
    pub timestamp: DateTime<Local>,
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0,
            timestamp: rollcall_util::now(),
            event,
        }
    }

    pub fn at(event: AuditEventType, timestamp: DateTime<Local>) -> Self {
        Self {
            id: 0,
            timestamp,
            event,
        }
    }
}
