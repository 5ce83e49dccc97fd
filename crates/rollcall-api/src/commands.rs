//! Command types for the rollcalld protocol

use chrono::{DateTime, Local, NaiveDate};
use rollcall_util::{AlertId, ClientId, StudentId};
use serde::{Deserialize, Serialize};

use crate::{
    AbsenceKind, AlertChoice, ClientRole, DashboardOverview, HealthStatus, ServiceStateSnapshot,
    StudentView, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    StudentNotFound,
    UnknownAlert,
    PermissionDenied,
    ConfigError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Get current service state
    GetState,

    /// Presence view of every registered student
    ListStudents,

    GetOverview,

    /// Forward a button press from the notification platform
    RespondToAlert {
        alert_id: AlertId,
        choice: AlertChoice,
    },

    /// Admin: record an absence for a student (admin only)
    SetStatus {
        student_id: StudentId,
        kind: AbsenceKind,
        /// Defaults to now
        start: Option<DateTime<Local>>,
        end: Option<NaiveDate>,
        reason: Option<String>,
    },

    /// Admin: clear the active absence and any pending ones
    ClearStatus { student_id: StudentId },

    /// Admin: stop or resume all threshold evaluation
    SetMonitoringPaused { paused: bool },

    /// Admin: stop or resume outbound notifications
    SetNotificationsPaused { paused: bool },

    /// Re-read the configuration file
    ReloadConfig,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    UnsubscribeEvents,

    GetHealth,

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Commands that change state require the admin role.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::SetStatus { .. }
                | Command::ClearStatus { .. }
                | Command::SetMonitoringPaused { .. }
                | Command::SetNotificationsPaused { .. }
                | Command::ReloadConfig
                | Command::RespondToAlert { .. }
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    State(ServiceStateSnapshot),
    Students { students: Vec<StudentView> },
    Overview(DashboardOverview),
    ResponseAccepted,
    StatusUpdated(StudentView),
    MonitoringPaused { paused: bool },
    NotificationsPaused { paused: bool },
    ConfigReloaded,
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_is_tagged() {
        let req = Request::new(
            7,
            Command::RespondToAlert {
                alert_id: AlertId::new(),
                choice: AlertChoice::Away,
            },
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["command"]["type"], "respond_to_alert");
        assert_eq!(json["command"]["choice"], "away");

        let parsed: Request = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_id, 7);
    }

    #[test]
    fn state_changing_commands_need_admin() {
        assert!(Command::ReloadConfig.requires_admin());
        assert!(Command::ClearStatus { student_id: StudentId::new(1) }.requires_admin());
        assert!(!Command::ListStudents.requires_admin());
        assert!(!Command::SubscribeEvents.requires_admin());
    }

    #[test]
    fn error_response_serialization() {
        let resp = Response::error(3, ErrorInfo::new(ErrorCode::UnknownAlert, "expired"));
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed.result {
            ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::UnknownAlert),
            ResponseResult::Ok(_) => panic!("expected error"),
        }
    }
}
