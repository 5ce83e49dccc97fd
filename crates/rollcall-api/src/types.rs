//! Shared types for the rollcalld API

use chrono::{DateTime, Local, NaiveDate};
use rollcall_util::{AlertId, StudentId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Camera state reported by the classroom tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    On,
    Off,
}

/// Whether the student is currently inside the virtual room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Joined,
    Left,
}

/// Kind of a reported absence. "No absence" is `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceKind {
    /// Stepped out (외출)
    Leave,
    /// Left early for the day (조퇴)
    EarlyLeave,
    /// Vacation (휴가)
    Vacation,
    /// Absent (결석)
    Absence,
    /// Arriving late (지각)
    Late,
}

impl AbsenceKind {
    pub const ALL: [AbsenceKind; 5] = [
        AbsenceKind::Leave,
        AbsenceKind::EarlyLeave,
        AbsenceKind::Vacation,
        AbsenceKind::Absence,
        AbsenceKind::Late,
    ];

    /// Day/period-scoped kinds survive Join events and the daily reset.
    pub fn is_period_scoped(&self) -> bool {
        matches!(self, AbsenceKind::Vacation | AbsenceKind::Absence)
    }

    /// Kinds that end when the student walks back into the room.
    pub fn cleared_by_join(&self) -> bool {
        matches!(
            self,
            AbsenceKind::Leave | AbsenceKind::EarlyLeave | AbsenceKind::Late
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbsenceKind::Leave => "leave",
            AbsenceKind::EarlyLeave => "early_leave",
            AbsenceKind::Vacation => "vacation",
            AbsenceKind::Absence => "absence",
            AbsenceKind::Late => "late",
        }
    }

    /// Label used in outbound chat texts.
    pub fn label(&self) -> &'static str {
        match self {
            AbsenceKind::Leave => "외출",
            AbsenceKind::EarlyLeave => "조퇴",
            AbsenceKind::Vacation => "휴가",
            AbsenceKind::Absence => "결석",
            AbsenceKind::Late => "지각",
        }
    }
}

impl fmt::Display for AbsenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbsenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AbsenceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown absence kind '{}'", s))
    }
}

/// An absence that is in effect, or scheduled when `start` is in the future
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Absence {
    pub kind: AbsenceKind,
    /// When the report was received
    pub set_at: DateTime<Local>,
    /// When the suppression begins
    pub start: DateTime<Local>,
    /// Last day covered (inclusive), for period-scoped kinds
    pub end: Option<NaiveDate>,
    pub reason: Option<String>,
}

impl Absence {
    /// Whether the covered period ended before `today`.
    pub fn has_ended_before(&self, today: NaiveDate) -> bool {
        match self.end {
            Some(end) => end < today,
            None => self.start.date_naive() < today,
        }
    }
}

/// Escalation counters for one notification track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCounter {
    pub stage_count: u32,
    pub last_notified_at: Option<DateTime<Local>>,
}

impl StageCounter {
    pub fn is_active(&self) -> bool {
        self.stage_count > 0
    }

    pub fn advance(&mut self, at: DateTime<Local>) {
        self.stage_count += 1;
        self.last_notified_at = Some(at);
    }

    pub fn clear(&mut self) {
        *self = StageCounter::default();
    }
}

/// Durable per-student record of which alerts already fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub student_id: StudentId,
    /// Camera-off escalation
    pub camera: StageCounter,
    /// Left-room escalation (admin only)
    pub leave: StageCounter,
    /// Return requests sent to the student after an admin asked for one
    pub return_request: StageCounter,
}

impl NotificationRecord {
    pub fn empty(student_id: StudentId) -> Self {
        Self {
            student_id,
            camera: StageCounter::default(),
            leave: StageCounter::default(),
            return_request: StageCounter::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.camera.is_active() && !self.leave.is_active() && !self.return_request.is_active()
    }
}

/// Registry entry for a student
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: StudentId,
    /// Name shown in the classroom tool; the match key for relayed events
    pub display_name: String,
    /// Direct-message recipient id on the notification platform
    pub contact_id: Option<String>,
    pub is_admin: bool,
}

/// What an outbound alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CameraOff,
    LeftRoom,
    ReturnRequest,
}

/// Interactive response offered on an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChoice {
    /// Student says the camera is back on
    Resumed,
    /// Student says they stepped away
    Away,
    /// Admin marks the student as out (외출)
    MarkLeave,
    /// Admin marks the student as gone for the day (조퇴)
    MarkEarlyLeave,
    /// Admin asks the student to confirm their return
    RequestReturn,
}

impl AlertChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChoice::Resumed => "resumed",
            AlertChoice::Away => "away",
            AlertChoice::MarkLeave => "mark_leave",
            AlertChoice::MarkEarlyLeave => "mark_early_leave",
            AlertChoice::RequestReturn => "request_return",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertChoice::Resumed => "카메라 켰어요",
            AlertChoice::Away => "자리 비움",
            AlertChoice::MarkLeave => "외출 처리",
            AlertChoice::MarkEarlyLeave => "조퇴 처리",
            AlertChoice::RequestReturn => "복귀 요청",
        }
    }

    /// Component id embedded in interactive buttons: `<alert_id>:<choice>`.
    pub fn component_id(&self, alert_id: AlertId) -> String {
        format!("{}:{}", alert_id, self.as_str())
    }

    /// Inverse of [`AlertChoice::component_id`].
    pub fn parse_component_id(raw: &str) -> Option<(AlertId, AlertChoice)> {
        let (id, choice) = raw.split_once(':')?;
        let alert_id = id.parse().ok()?;
        let choice = [
            AlertChoice::Resumed,
            AlertChoice::Away,
            AlertChoice::MarkLeave,
            AlertChoice::MarkEarlyLeave,
            AlertChoice::RequestReturn,
        ]
        .into_iter()
        .find(|c| c.as_str() == choice)?;
        Some((alert_id, choice))
    }
}

/// Who receives an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Student,
    Admin,
    StudentAndAdmin,
}

impl Audience {
    pub fn includes_student(&self) -> bool {
        matches!(self, Audience::Student | Audience::StudentAndAdmin)
    }

    pub fn includes_admin(&self) -> bool {
        matches!(self, Audience::Admin | Audience::StudentAndAdmin)
    }
}

/// Presence view of a student for clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentView {
    pub id: StudentId,
    pub display_name: String,
    pub is_admin: bool,
    pub camera_state: CameraState,
    pub last_state_change_at: Option<DateTime<Local>>,
    pub join_state: JoinState,
    pub last_leave_at: Option<DateTime<Local>>,
    pub not_joined_today: bool,
    pub absence: Option<Absence>,
    pub pending: Vec<Absence>,
    pub camera_stage: u32,
    pub leave_stage: u32,
    /// Minutes the camera has been off while joined, if it is off
    pub camera_off_minutes: Option<u64>,
}

/// Aggregate counts pushed to dashboard clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardOverview {
    pub total: usize,
    pub camera_on: usize,
    pub camera_off: usize,
    pub left: usize,
    pub not_joined_today: usize,
    pub threshold_exceeded: usize,
    pub absent: usize,
}

/// Service state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateSnapshot {
    pub api_version: u32,
    pub monitoring_paused: bool,
    pub notifications_paused: bool,
    pub recovered: bool,
    pub last_tick_at: Option<DateTime<Local>>,
    pub last_reset_at: Option<DateTime<Local>>,
    pub overview: DashboardOverview,
}

/// Client role, derived from the peer uid of the IPC connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Dashboard or bridge process running as another user: read-only
    Observer,
    /// Same user as the daemon, or root
    Admin,
}

impl ClientRole {
    pub fn can_administer(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub recovered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_scoped_kinds() {
        assert!(AbsenceKind::Vacation.is_period_scoped());
        assert!(AbsenceKind::Absence.is_period_scoped());
        assert!(!AbsenceKind::Leave.is_period_scoped());
        assert!(AbsenceKind::EarlyLeave.cleared_by_join());
        assert!(!AbsenceKind::Vacation.cleared_by_join());
    }

    #[test]
    fn absence_kind_string_form_matches_serde() {
        for kind in AbsenceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<AbsenceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn component_ids_round_trip() {
        let alert_id = AlertId::new();
        let raw = AlertChoice::MarkEarlyLeave.component_id(alert_id);
        assert_eq!(
            AlertChoice::parse_component_id(&raw),
            Some((alert_id, AlertChoice::MarkEarlyLeave))
        );
        assert_eq!(AlertChoice::parse_component_id("garbage"), None);
        assert_eq!(
            AlertChoice::parse_component_id(&format!("{}:dance", alert_id)),
            None
        );
    }

    #[test]
    fn stage_counter_advance_and_clear() {
        let now = Local::now();
        let mut counter = StageCounter::default();
        counter.advance(now);
        counter.advance(now);
        assert_eq!(counter.stage_count, 2);
        assert_eq!(counter.last_notified_at, Some(now));
        counter.clear();
        assert!(!counter.is_active());
        assert!(counter.last_notified_at.is_none());
    }

    #[test]
    fn absence_end_handling() {
        let start = Local::now();
        let today = start.date_naive();
        let single_day = Absence {
            kind: AbsenceKind::Vacation,
            set_at: start,
            start,
            end: None,
            reason: None,
        };
        assert!(!single_day.has_ended_before(today));
        assert!(single_day.has_ended_before(today.succ_opt().unwrap()));

        let ranged = Absence {
            end: Some(today.succ_opt().unwrap()),
            ..single_day
        };
        assert!(!ranged.has_ended_before(today.succ_opt().unwrap()));
    }
}
