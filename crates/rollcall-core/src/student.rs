//! Per-student presence state machine

use chrono::{DateTime, Local};
use rollcall_api::{
    Absence, AlertKind, CameraState, JoinState, NotificationRecord, StageCounter, StudentRecord,
    StudentView,
};
use rollcall_store::StoredAbsences;
use rollcall_util::{elapsed, whole_minutes, StudentId};

use crate::{PresenceEvent, StatusChange};

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Presence fields changed
    Changed,
    /// A Join ended an absence
    Returned(Absence),
    /// Status took effect immediately
    StatusSet,
    /// Status stored until its start instant
    Scheduled,
    /// Older than the last applied presence event; ignored
    Stale,
}

/// Delivery bookkeeping for one notification track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackGuard {
    /// Bumped whenever the track is cleared
    pub epoch: u64,
    /// A send for this track is outstanding
    pub in_flight: bool,
    /// Stage whose direct message went out although the admin copy failed
    pub student_reached: Option<u32>,
}

/// Ticket for an outstanding send, checked again on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTicket {
    pub epoch: u64,
    pub expected_stage: u32,
}

fn slot(kind: AlertKind) -> usize {
    match kind {
        AlertKind::CameraOff => 0,
        AlertKind::LeftRoom => 1,
        AlertKind::ReturnRequest => 2,
    }
}

fn later(a: Option<DateTime<Local>>, b: Option<DateTime<Local>>) -> Option<DateTime<Local>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentState {
    pub record: StudentRecord,
    pub camera_state: CameraState,
    pub last_state_change_at: Option<DateTime<Local>>,
    pub join_state: JoinState,
    pub last_leave_at: Option<DateTime<Local>>,
    pub joined_today: bool,
    pub absence: Option<Absence>,
    /// Future-dated statuses, ordered by start
    pub pending: Vec<Absence>,
    pub notifications: NotificationRecord,
    /// An admin asked the student to confirm their return
    pub return_requested: bool,
    /// Start of the current monitored window segment; timers never start earlier
    pub timer_anchor: Option<DateTime<Local>>,
    /// Timestamp of the newest camera/room event applied
    pub last_event_at: Option<DateTime<Local>>,
    guards: [TrackGuard; 3],
}

impl StudentState {
    /// A student nobody has seen yet: camera off, outside the room
    pub fn new(record: StudentRecord) -> Self {
        let notifications = NotificationRecord::empty(record.id);
        Self {
            record,
            camera_state: CameraState::Off,
            last_state_change_at: None,
            join_state: JoinState::Left,
            last_leave_at: None,
            joined_today: false,
            absence: None,
            pending: Vec::new(),
            notifications,
            return_requested: false,
            timer_anchor: None,
            last_event_at: None,
            guards: [TrackGuard::default(); 3],
        }
    }

    pub fn id(&self) -> StudentId {
        self.record.id
    }

    pub fn display_name(&self) -> &str {
        &self.record.display_name
    }

    pub fn is_admin(&self) -> bool {
        self.record.is_admin
    }

    pub fn not_joined_today(&self) -> bool {
        !self.joined_today
    }

    pub fn is_joined(&self) -> bool {
        self.join_state == JoinState::Joined
    }

    /// Apply one event that happened at `at`.
    pub fn apply(&mut self, event: &PresenceEvent, at: DateTime<Local>) -> Applied {
        if event.is_presence() {
            if matches!(self.last_event_at, Some(last) if at < last) {
                return Applied::Stale;
            }
            self.last_event_at = Some(at);
        }

        match event {
            PresenceEvent::CameraOn => {
                self.camera_state = CameraState::On;
                self.last_state_change_at = Some(at);
                self.timer_anchor = None;
                self.clear_track(AlertKind::CameraOff);
                Applied::Changed
            }
            PresenceEvent::CameraOff => {
                self.camera_state = CameraState::Off;
                self.last_state_change_at = Some(at);
                self.timer_anchor = None;
                Applied::Changed
            }
            PresenceEvent::Join => {
                // The classroom tool admits everyone with the camera off
                self.join_state = JoinState::Joined;
                self.joined_today = true;
                self.last_leave_at = None;
                self.camera_state = CameraState::Off;
                self.last_state_change_at = Some(at);
                self.timer_anchor = None;
                self.return_requested = false;
                self.clear_track(AlertKind::CameraOff);
                self.clear_track(AlertKind::LeftRoom);
                self.clear_track(AlertKind::ReturnRequest);

                let returned = self
                    .absence
                    .as_ref()
                    .is_some_and(|a| a.kind.cleared_by_join() && a.set_at <= at && a.start <= at);
                match returned.then(|| self.absence.take()).flatten() {
                    Some(absence) => Applied::Returned(absence),
                    None => Applied::Changed,
                }
            }
            PresenceEvent::Leave => {
                self.join_state = JoinState::Left;
                self.last_leave_at = Some(at);
                self.timer_anchor = None;
                Applied::Changed
            }
            PresenceEvent::StatusChange(change) => self.apply_status(change, at),
        }
    }

    fn apply_status(&mut self, change: &StatusChange, at: DateTime<Local>) -> Applied {
        let absence = Absence {
            kind: change.kind,
            set_at: at,
            start: change.start,
            end: change.end,
            reason: change.reason.clone(),
        };

        if change.start > at {
            let duplicate = self.pending.iter().any(|p| {
                p.kind == absence.kind && p.start == absence.start && p.end == absence.end
            });
            if !duplicate {
                self.pending.push(absence);
                self.pending.sort_by_key(|p| p.start);
            }
            return Applied::Scheduled;
        }

        self.set_absence(absence);
        Applied::StatusSet
    }

    fn set_absence(&mut self, absence: Absence) {
        self.absence = Some(absence);
        self.return_requested = false;
        self.clear_track(AlertKind::CameraOff);
        self.clear_track(AlertKind::LeftRoom);
        self.clear_track(AlertKind::ReturnRequest);
    }

    /// Drop the active absence and every pending one
    pub fn clear_status(&mut self) -> Option<Absence> {
        self.pending.clear();
        self.absence.take()
    }

    /// Activate pending statuses whose start has passed; returns the ones activated.
    pub fn activate_pending(&mut self, now: DateTime<Local>) -> Vec<Absence> {
        let due = self.pending.iter().take_while(|p| p.start <= now).count();
        let activated: Vec<Absence> = self.pending.drain(..due).collect();
        if let Some(last) = activated.last() {
            self.set_absence(last.clone());
        }
        activated
    }

    /// Start of a new day at `boundary`. Presence is forgotten exactly as a
    /// restart would forget it, so the day is rebuilt from events after the
    /// boundary only. Returns whether absences changed.
    pub fn daily_reset(&mut self, boundary: DateTime<Local>) -> bool {
        self.reset_presence();
        self.prune_absences(boundary)
    }

    /// Drop absences that cannot apply to the day starting at `boundary`:
    /// ended period-scoped ones and instant ones set before it.
    /// Returns whether anything was removed.
    pub fn prune_absences(&mut self, boundary: DateTime<Local>) -> bool {
        let today = boundary.date_naive();
        let stale = |a: &Absence, from: DateTime<Local>| {
            if a.kind.is_period_scoped() {
                a.has_ended_before(today)
            } else {
                from < boundary
            }
        };

        let before = (self.absence.is_some(), self.pending.len());
        if self.absence.as_ref().is_some_and(|a| stale(a, a.set_at)) {
            self.absence = None;
        }
        self.pending.retain(|p| !stale(p, p.start));
        before != (self.absence.is_some(), self.pending.len())
    }

    /// Forget all presence knowledge before a replay
    pub fn reset_presence(&mut self) {
        self.camera_state = CameraState::Off;
        self.last_state_change_at = None;
        self.join_state = JoinState::Left;
        self.last_leave_at = None;
        self.joined_today = false;
        self.timer_anchor = None;
        self.last_event_at = None;
        self.return_requested = false;
        self.clear_track(AlertKind::CameraOff);
        self.clear_track(AlertKind::LeftRoom);
        self.clear_track(AlertKind::ReturnRequest);
    }

    // Notification tracks

    pub fn track(&self, kind: AlertKind) -> &StageCounter {
        match kind {
            AlertKind::CameraOff => &self.notifications.camera,
            AlertKind::LeftRoom => &self.notifications.leave,
            AlertKind::ReturnRequest => &self.notifications.return_request,
        }
    }

    fn track_mut(&mut self, kind: AlertKind) -> &mut StageCounter {
        match kind {
            AlertKind::CameraOff => &mut self.notifications.camera,
            AlertKind::LeftRoom => &mut self.notifications.leave,
            AlertKind::ReturnRequest => &mut self.notifications.return_request,
        }
    }

    pub fn guard(&self, kind: AlertKind) -> TrackGuard {
        self.guards[slot(kind)]
    }

    pub fn clear_track(&mut self, kind: AlertKind) {
        self.track_mut(kind).clear();
        let guard = &mut self.guards[slot(kind)];
        guard.epoch += 1;
        guard.student_reached = None;
    }

    /// Mark a send as outstanding; `None` while another is in flight
    pub fn begin_delivery(&mut self, kind: AlertKind) -> Option<DeliveryTicket> {
        let expected_stage = self.track(kind).stage_count;
        let guard = &mut self.guards[slot(kind)];
        if guard.in_flight {
            return None;
        }
        guard.in_flight = true;
        Some(DeliveryTicket {
            epoch: guard.epoch,
            expected_stage,
        })
    }

    /// Settle an outstanding send. The stage advances only when the send
    /// succeeded and the track was not cleared or advanced meanwhile.
    pub fn finish_delivery(
        &mut self,
        kind: AlertKind,
        ticket: DeliveryTicket,
        delivered: bool,
        at: DateTime<Local>,
    ) -> bool {
        let guard = &mut self.guards[slot(kind)];
        guard.in_flight = false;
        let current = guard.epoch == ticket.epoch
            && self.track(kind).stage_count == ticket.expected_stage;
        if delivered && current {
            self.track_mut(kind).advance(at);
            self.guards[slot(kind)].student_reached = None;
            true
        } else {
            false
        }
    }

    /// Remember that a failed dual-audience send did reach the student, so
    /// the retry of the same stage goes to the admin only
    pub fn note_student_reached(&mut self, kind: AlertKind, ticket: DeliveryTicket) {
        let current = self.guards[slot(kind)].epoch == ticket.epoch
            && self.track(kind).stage_count == ticket.expected_stage;
        if current {
            self.guards[slot(kind)].student_reached = Some(ticket.expected_stage);
        }
    }

    /// Whether the direct message for the stage behind `ticket` already went out
    pub fn student_reached(&self, kind: AlertKind, ticket: DeliveryTicket) -> bool {
        let guard = self.guards[slot(kind)];
        guard.epoch == ticket.epoch && guard.student_reached == Some(ticket.expected_stage)
    }

    /// When the camera-off timer started, honouring the window anchor
    pub fn camera_timer_start(&self) -> Option<DateTime<Local>> {
        self.last_state_change_at
            .map(|changed| later(Some(changed), self.timer_anchor).unwrap_or(changed))
    }

    /// When the left-room timer started, honouring the window anchor
    pub fn leave_timer_start(&self) -> Option<DateTime<Local>> {
        self.last_leave_at
            .map(|left| later(Some(left), self.timer_anchor).unwrap_or(left))
    }

    pub fn stored_absences(&self) -> StoredAbsences {
        StoredAbsences {
            student_id: self.id(),
            active: self.absence.clone(),
            pending: self.pending.clone(),
        }
    }

    pub fn view(&self, now: DateTime<Local>) -> StudentView {
        let camera_off_minutes = (self.camera_state == CameraState::Off && self.is_joined())
            .then(|| self.camera_timer_start())
            .flatten()
            .map(|since| whole_minutes(elapsed(now, since)));

        StudentView {
            id: self.id(),
            display_name: self.record.display_name.clone(),
            is_admin: self.is_admin(),
            camera_state: self.camera_state,
            last_state_change_at: self.last_state_change_at,
            join_state: self.join_state,
            last_leave_at: self.last_leave_at,
            not_joined_today: self.not_joined_today(),
            absence: self.absence.clone(),
            pending: self.pending.clone(),
            camera_stage: self.notifications.camera.stage_count,
            leave_stage: self.notifications.leave.stage_count,
            camera_off_minutes,
        }
    }
}
