//! Presence engine
//!
//! Owns every student's state. Inbound messages, admin actions and scheduler
//! ticks all go through `&mut self`, so updates for one student are applied
//! in a single strict order. Sends happen outside the engine; see
//! [`crate::deliver`].

use chrono::{DateTime, Local};
use rollcall_api::{
    AbsenceKind, AlertChoice, AlertKind, CameraState, DashboardOverview, HealthStatus,
    NotificationRecord, ServiceStateSnapshot, StudentView, API_VERSION,
};
use rollcall_channel_api::{HolidayCalendar, Notifier, OutboundAlert, RelayMessage};
use rollcall_config::MonitorPolicy;
use rollcall_store::{AuditEvent, AuditEventType, Registry, Store, StoreError};
use rollcall_util::{
    elapsed, most_recent_boundary, AlertId, MessageId, Result, RollcallError, StudentId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    camera_threshold_exceeded, evaluate_camera, evaluate_leave, evaluate_return, merge_record,
    reset_due, segment_start, skip_reason, Applied, ClassifiedEvent,
    ClassifyError, Classifier, CoreEvent, DeliveryIntent, DeliveryReceipt, PresenceEvent,
    StatusChange, StudentState, TickSkip,
};

/// Collaborators injected into the engine
#[derive(Clone)]
pub struct EngineContext {
    pub registry: Arc<dyn Registry>,
    pub store: Arc<dyn Store>,
    pub calendar: Arc<dyn HolidayCalendar>,
    pub notifier: Arc<dyn Notifier>,
}

/// Whether an inbound message is live or replayed history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Live,
    /// No audit entries, no broadcasts, no notification writes
    Replay,
}

/// An alert with interactive choices that a recipient can still answer
#[derive(Debug, Clone)]
struct IssuedAlert {
    student_id: StudentId,
    kind: AlertKind,
    choices: Vec<AlertChoice>,
}

struct RecoveryInProgress {
    boundary: DateTime<Local>,
    held_records: HashMap<StudentId, NotificationRecord>,
}

/// Result of one scheduler tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Alerts to send; settle each with [`PresenceEngine::complete_delivery`]
    pub deliveries: Vec<DeliveryIntent>,
    pub events: Vec<CoreEvent>,
    pub skipped: Option<TickSkip>,
}

fn store_error(e: StoreError) -> RollcallError {
    RollcallError::store(e.to_string())
}

fn audit(store: &dyn Store, event: AuditEventType, at: DateTime<Local>) {
    let _ = store.append_audit(AuditEvent::at(event, at));
}

fn save_record(store: &dyn Store, state: &StudentState) {
    if let Err(e) = store.save_notification_record(&state.notifications) {
        warn!(student = %state.display_name(), error = %e, "Failed to persist notification record");
    }
}

fn save_absences(store: &dyn Store, state: &StudentState) {
    if let Err(e) = store.save_absences(&state.stored_absences()) {
        warn!(student = %state.display_name(), error = %e, "Failed to persist absences");
    }
}

pub struct PresenceEngine {
    ctx: EngineContext,
    policy: MonitorPolicy,
    classifier: Classifier,
    students: BTreeMap<StudentId, StudentState>,
    issued: HashMap<AlertId, IssuedAlert>,
    seen_messages: HashSet<MessageId>,
    monitoring_paused: bool,
    notifications_paused: bool,
    started_at: DateTime<Local>,
    warmup: Duration,
    last_tick_at: Option<DateTime<Local>>,
    last_reset_at: Option<DateTime<Local>>,
    /// The previous tick was inside a monitored window
    was_active: bool,
    recovered: bool,
    recovery: Option<RecoveryInProgress>,
}

impl PresenceEngine {
    /// Load the roster, durable notification records and absences.
    pub fn new(
        ctx: EngineContext,
        policy: MonitorPolicy,
        warmup: Duration,
        started_at: DateTime<Local>,
    ) -> Result<Self> {
        let mut students: BTreeMap<StudentId, StudentState> = ctx
            .registry
            .list_students()
            .map_err(store_error)?
            .into_iter()
            .map(|record| (record.id, StudentState::new(record)))
            .collect();

        for record in ctx.store.load_notification_records().map_err(store_error)? {
            if let Some(state) = students.get_mut(&record.student_id) {
                state.notifications = record;
            }
        }
        for stored in ctx.store.load_absences().map_err(store_error)? {
            if let Some(state) = students.get_mut(&stored.student_id) {
                state.absence = stored.active;
                state.pending = stored.pending;
            }
        }
        let last_reset_at = ctx.store.last_reset_at().map_err(store_error)?;

        info!(
            students = students.len(),
            last_reset_at = ?last_reset_at,
            "Presence engine initialized"
        );

        Ok(Self {
            classifier: Classifier::new(&policy),
            ctx,
            policy,
            students,
            issued: HashMap::new(),
            seen_messages: HashSet::new(),
            monitoring_paused: false,
            notifications_paused: false,
            started_at,
            warmup,
            last_tick_at: None,
            last_reset_at,
            was_active: false,
            recovered: false,
            recovery: None,
        })
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.ctx.notifier)
    }

    pub fn student(&self, id: StudentId) -> Option<&StudentState> {
        self.students.get(&id)
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn last_reset_at(&self) -> Option<DateTime<Local>> {
        self.last_reset_at
    }

    /// Swap in a reloaded policy
    pub fn reload_policy(&mut self, policy: MonitorPolicy, now: DateTime<Local>) -> CoreEvent {
        if policy.class_window != self.policy.class_window
            || policy.lunch_window != self.policy.lunch_window
        {
            // Re-anchor timers against the new windows on the next tick
            self.was_active = false;
        }
        self.classifier = Classifier::new(&policy);
        self.policy = policy;

        audit(
            self.ctx.store.as_ref(),
            AuditEventType::ConfigReloaded { success: true },
            now,
        );
        info!("Monitor policy reloaded");

        CoreEvent::PolicyReloaded
    }

    /// Pick up registry changes: new students, renamed or promoted ones,
    /// deletions
    pub fn refresh_roster(&mut self) -> Result<()> {
        let records = self.ctx.registry.list_students().map_err(store_error)?;
        let ids: HashSet<StudentId> = records.iter().map(|r| r.id).collect();

        self.students.retain(|id, state| {
            let keep = ids.contains(id);
            if !keep {
                info!(student = %state.display_name(), "Student removed from registry");
            }
            keep
        });
        for record in records {
            match self.students.get_mut(&record.id) {
                Some(state) => state.record = record,
                None => {
                    debug!(student = %record.display_name, "Student added to roster");
                    self.students.insert(record.id, StudentState::new(record));
                }
            }
        }
        Ok(())
    }

    // Inbound messages

    /// Classify and apply one relayed message. Duplicates are ignored.
    pub fn handle_message(&mut self, message: &RelayMessage, mode: IngestMode) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        if mode == IngestMode::Live && self.recovery.is_none() {
            if let Some(last_reset) = self.last_reset_at {
                if message.timestamp < last_reset {
                    debug!(message_id = %message.id, "Dropping relay message from before the day boundary");
                    return events;
                }
                // A new day starts before its first event, not at the next tick
                if let Some(boundary) = reset_due(Some(last_reset), message.timestamp, &self.policy) {
                    events.extend(self.daily_reset(boundary));
                }
            }
        }

        if !self.seen_messages.insert(message.id.clone()) {
            debug!(message_id = %message.id, "Duplicate relay message");
            return events;
        }

        let classified = {
            let roster: Vec<(StudentId, &str)> = self
                .students
                .values()
                .map(|s| (s.id(), s.display_name()))
                .collect();
            self.classifier
                .classify(&message.text, message.timestamp, &roster)
        };

        match classified {
            Ok(Some(event)) => events.extend(self.apply_event(event, "relay", mode)),
            Ok(None) => {}
            Err(e @ ClassifyError::InvalidStatus { .. }) => {
                warn!(message_id = %message.id, error = %e, "Dropping malformed status report");
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Dropping message for unresolved student");
            }
        }
        events
    }

    fn apply_event(&mut self, event: ClassifiedEvent, source: &str, mode: IngestMode) -> Vec<CoreEvent> {
        let live = mode == IngestMode::Live;
        let store = self.ctx.store.as_ref();
        let Some(state) = self.students.get_mut(&event.student_id) else {
            return Vec::new();
        };

        let records_before = state.notifications.clone();
        let applied = state.apply(&event.event, event.timestamp);

        match &applied {
            Applied::Stale => {
                debug!(
                    student = %state.display_name(),
                    event = event.event.name(),
                    at = %event.timestamp,
                    "Ignoring event older than the last one applied"
                );
                return Vec::new();
            }
            Applied::Changed => {
                debug!(student = %state.display_name(), event = event.event.name(), "Presence updated");
            }
            Applied::Returned(absence) => {
                info!(student = %state.display_name(), kind = %absence.kind, "Absence ended by return");
                save_absences(store, state);
                if live {
                    audit(
                        store,
                        AuditEventType::StatusCleared {
                            student_id: state.id(),
                            kind: absence.kind,
                        },
                        event.timestamp,
                    );
                }
            }
            Applied::StatusSet | Applied::Scheduled => {
                if let PresenceEvent::StatusChange(change) = &event.event {
                    info!(
                        student = %state.display_name(),
                        kind = %change.kind,
                        start = %change.start,
                        scheduled = applied == Applied::Scheduled,
                        source,
                        "Status recorded"
                    );
                    if live {
                        audit(
                            store,
                            AuditEventType::StatusSet {
                                student_id: state.id(),
                                kind: change.kind,
                                start: change.start,
                                end: change.end,
                                source: source.to_string(),
                            },
                            event.timestamp,
                        );
                    }
                }
                save_absences(store, state);
            }
        }

        if !live {
            return Vec::new();
        }
        if state.notifications != records_before {
            save_record(store, state);
        }
        vec![CoreEvent::StudentChanged(state.view(event.timestamp))]
    }

    // Admin actions

    pub fn set_status(
        &mut self,
        student_id: StudentId,
        kind: AbsenceKind,
        start: Option<DateTime<Local>>,
        end: Option<chrono::NaiveDate>,
        reason: Option<String>,
        now: DateTime<Local>,
    ) -> Result<Vec<CoreEvent>> {
        if !self.students.contains_key(&student_id) {
            return Err(RollcallError::StudentNotFound(student_id));
        }
        let start = start.unwrap_or(now);
        if end.is_some_and(|end| end < start.date_naive()) {
            return Err(RollcallError::validation("end date is before the start"));
        }
        let end = end.or_else(|| kind.is_period_scoped().then(|| start.date_naive()));

        let event = ClassifiedEvent {
            student_id,
            timestamp: now,
            event: PresenceEvent::StatusChange(StatusChange {
                kind,
                start,
                end,
                reason,
            }),
        };
        Ok(self.apply_event(event, "admin", IngestMode::Live))
    }

    /// Drop the active absence and every pending one
    pub fn clear_status(&mut self, student_id: StudentId, now: DateTime<Local>) -> Result<Vec<CoreEvent>> {
        let store = self.ctx.store.as_ref();
        let state = self
            .students
            .get_mut(&student_id)
            .ok_or(RollcallError::StudentNotFound(student_id))?;

        let had_pending = !state.pending.is_empty();
        let cleared = state.clear_status();
        if let Some(absence) = &cleared {
            info!(student = %state.display_name(), kind = %absence.kind, "Status cleared by admin");
            audit(
                store,
                AuditEventType::StatusCleared {
                    student_id,
                    kind: absence.kind,
                },
                now,
            );
        }
        if cleared.is_some() || had_pending {
            save_absences(store, state);
        }
        Ok(vec![CoreEvent::StudentChanged(state.view(now))])
    }

    /// Act on a button pressed on a previously sent alert
    pub fn apply_response(
        &mut self,
        alert_id: AlertId,
        choice: AlertChoice,
        now: DateTime<Local>,
    ) -> Result<Vec<CoreEvent>> {
        let issued = self.issued.get(&alert_id).ok_or(RollcallError::UnknownAlert)?;
        if !issued.choices.contains(&choice) {
            return Err(RollcallError::ChoiceNotOffered(choice.as_str().to_string()));
        }
        let IssuedAlert { student_id, kind, .. } = issued.clone();
        self.issued.remove(&alert_id);

        audit(
            self.ctx.store.as_ref(),
            AuditEventType::AlertResponse {
                alert_id,
                student_id,
                choice,
            },
            now,
        );
        info!(%alert_id, student_id = %student_id, alert = ?kind, choice = choice.as_str(), "Alert response");

        let absence = match choice {
            // A genuine camera-on notice follows from the relay
            AlertChoice::Resumed => return Ok(Vec::new()),
            AlertChoice::Away | AlertChoice::MarkLeave => AbsenceKind::Leave,
            AlertChoice::MarkEarlyLeave => AbsenceKind::EarlyLeave,
            AlertChoice::RequestReturn => return self.request_return(student_id, now),
        };

        let event = ClassifiedEvent {
            student_id,
            timestamp: now,
            event: PresenceEvent::StatusChange(StatusChange {
                kind: absence,
                start: now,
                end: None,
                reason: Some(format!("alert response: {}", choice.as_str())),
            }),
        };
        Ok(self.apply_event(event, "response", IngestMode::Live))
    }

    fn request_return(&mut self, student_id: StudentId, now: DateTime<Local>) -> Result<Vec<CoreEvent>> {
        let store = self.ctx.store.as_ref();
        let state = self
            .students
            .get_mut(&student_id)
            .ok_or(RollcallError::StudentNotFound(student_id))?;

        if state.is_joined() {
            info!(student = %state.display_name(), "Return requested but student is already back");
            return Ok(Vec::new());
        }
        state.return_requested = true;
        state.clear_track(AlertKind::ReturnRequest);
        save_record(store, state);
        Ok(vec![CoreEvent::StudentChanged(state.view(now))])
    }

    pub fn set_monitoring_paused(&mut self, paused: bool) -> CoreEvent {
        if self.monitoring_paused != paused {
            info!(paused, "Monitoring pause changed");
        }
        self.monitoring_paused = paused;
        CoreEvent::MonitoringPaused { paused }
    }

    pub fn set_notifications_paused(&mut self, paused: bool) -> CoreEvent {
        if self.notifications_paused != paused {
            info!(paused, "Notification pause changed");
        }
        self.notifications_paused = paused;
        CoreEvent::NotificationsPaused { paused }
    }

    // Scheduler

    /// One scheduler pass at `now`.
    ///
    /// Order: daily reset, pending activation, window check, re-anchoring,
    /// then evaluation. Resets and activations run even outside class hours.
    pub fn tick(&mut self, now: DateTime<Local>) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if let Some(boundary) = reset_due(self.last_reset_at, now, &self.policy) {
            outcome.events.extend(self.daily_reset(boundary));
        }
        outcome.events.extend(self.activate_pending(now));
        self.last_tick_at = Some(now);

        if let Some(skip) = skip_reason(
            &self.policy,
            self.ctx.calendar.as_ref(),
            self.monitoring_paused,
            now,
        ) {
            if self.was_active {
                debug!(reason = skip.as_str(), "Monitoring window closed");
            }
            self.was_active = false;
            outcome.skipped = Some(skip);
            outcome.events.push(CoreEvent::Overview(self.overview(now)));
            return outcome;
        }

        if !self.was_active {
            if let Some(anchor) = segment_start(&self.policy, now) {
                for state in self.students.values_mut() {
                    state.timer_anchor = Some(anchor);
                }
                debug!(%anchor, "Monitoring window opened, timers anchored");
            }
            self.was_active = true;
        }

        if elapsed(now, self.started_at) < self.warmup {
            debug!("Warmup, not evaluating alerts");
        } else if !self.notifications_paused {
            outcome.deliveries = self.plan_deliveries(now);
        }

        outcome.events.push(CoreEvent::Overview(self.overview(now)));
        outcome
    }

    fn plan_deliveries(&mut self, now: DateTime<Local>) -> Vec<DeliveryIntent> {
        let mut intents = Vec::new();

        for state in self.students.values_mut() {
            let plans = [
                evaluate_camera(state, &self.policy, now),
                evaluate_leave(state, &self.policy, now),
                evaluate_return(state, &self.policy, now),
            ];
            for plan in plans.into_iter().flatten() {
                let Some(ticket) = state.begin_delivery(plan.kind) else {
                    debug!(student = %state.display_name(), alert = ?plan.kind, "Previous send still in flight");
                    continue;
                };

                let student_reached = state.student_reached(plan.kind, ticket);
                let alert_id = AlertId::new();
                debug!(
                    student = %state.display_name(),
                    alert = ?plan.kind,
                    stage = plan.stage,
                    audience = ?plan.audience,
                    "Alert due"
                );
                intents.push(DeliveryIntent {
                    receipt: DeliveryReceipt {
                        student_id: state.id(),
                        kind: plan.kind,
                        alert_id,
                        ticket,
                        planned_at: now,
                    },
                    alert: OutboundAlert {
                        alert_id,
                        student_id: state.id(),
                        student_name: state.display_name().to_string(),
                        kind: plan.kind,
                        stage: plan.stage,
                        audience: plan.audience,
                        text: plan.text,
                        choices: plan.choices,
                    },
                    contact_id: state.record.contact_id.clone(),
                    student_reached,
                });
            }
        }

        intents
    }

    /// Settle a send planned by [`PresenceEngine::tick`].
    ///
    /// The stage is committed at the planned instant, and only if the send
    /// succeeded and the track did not change while it was outstanding.
    pub fn complete_delivery(
        &mut self,
        intent: DeliveryIntent,
        result: std::result::Result<(), String>,
    ) -> Vec<CoreEvent> {
        let DeliveryIntent {
            receipt,
            alert,
            student_reached,
            ..
        } = intent;
        let store = self.ctx.store.as_ref();
        let Some(state) = self.students.get_mut(&receipt.student_id) else {
            debug!(student_id = %receipt.student_id, "Student removed while alert was in flight");
            return Vec::new();
        };

        match result {
            Ok(()) => {
                if !alert.choices.is_empty() {
                    self.issued.insert(
                        alert.alert_id,
                        IssuedAlert {
                            student_id: receipt.student_id,
                            kind: receipt.kind,
                            choices: alert.choices.clone(),
                        },
                    );
                }

                let committed =
                    state.finish_delivery(receipt.kind, receipt.ticket, true, receipt.planned_at);
                if !committed {
                    info!(
                        student = %state.display_name(),
                        alert = ?receipt.kind,
                        "Alert delivered after its track changed, stage not committed"
                    );
                    return Vec::new();
                }

                save_record(store, state);
                let stage = state.track(receipt.kind).stage_count;
                audit(
                    store,
                    AuditEventType::AlertSent {
                        alert_id: alert.alert_id,
                        student_id: receipt.student_id,
                        kind: receipt.kind,
                        audience: alert.audience,
                        stage,
                    },
                    receipt.planned_at,
                );
                info!(
                    student = %state.display_name(),
                    alert = ?receipt.kind,
                    stage,
                    audience = ?alert.audience,
                    "Alert sent"
                );

                vec![
                    CoreEvent::AlertSent {
                        alert_id: alert.alert_id,
                        student_id: receipt.student_id,
                        kind: receipt.kind,
                        audience: alert.audience,
                        stage,
                    },
                    CoreEvent::StudentChanged(state.view(receipt.planned_at)),
                ]
            }
            Err(error) => {
                state.finish_delivery(receipt.kind, receipt.ticket, false, receipt.planned_at);
                if student_reached && alert.audience.includes_admin() {
                    state.note_student_reached(receipt.kind, receipt.ticket);
                }
                warn!(
                    student = %state.display_name(),
                    alert = ?receipt.kind,
                    student_reached,
                    error = %error,
                    "Alert delivery failed, retrying next tick"
                );
                audit(
                    store,
                    AuditEventType::AlertFailed {
                        student_id: receipt.student_id,
                        kind: receipt.kind,
                        error: error.clone(),
                    },
                    receipt.planned_at,
                );
                vec![CoreEvent::AlertFailed {
                    student_id: receipt.student_id,
                    kind: receipt.kind,
                    error,
                }]
            }
        }
    }

    fn activate_pending(&mut self, now: DateTime<Local>) -> Vec<CoreEvent> {
        let store = self.ctx.store.as_ref();
        let mut events = Vec::new();

        for state in self.students.values_mut() {
            let activated = state.activate_pending(now);
            if activated.is_empty() {
                continue;
            }
            for absence in &activated {
                info!(student = %state.display_name(), kind = %absence.kind, "Scheduled status now in effect");
            }
            save_absences(store, state);
            save_record(store, state);
            events.push(CoreEvent::StudentChanged(state.view(now)));
        }

        events
    }

    fn daily_reset(&mut self, boundary: DateTime<Local>) -> Vec<CoreEvent> {
        let store = self.ctx.store.as_ref();
        let today = boundary.date_naive();

        for state in self.students.values_mut() {
            if state.daily_reset(boundary) {
                save_absences(store, state);
            }
        }
        if let Err(e) = store.clear_notification_records() {
            warn!(error = %e, "Failed to clear notification records");
        }
        self.issued.clear();
        self.seen_messages.clear();
        self.was_active = false;

        self.last_reset_at = Some(boundary);
        if let Err(e) = store.set_last_reset_at(boundary) {
            warn!(error = %e, "Failed to persist reset instant");
        }
        audit(store, AuditEventType::DailyReset { date: today }, boundary);
        info!(date = %today, "Daily reset");

        vec![CoreEvent::DailyReset { date: today }]
    }

    // Recovery

    /// Forget presence and hold notification records aside until replay is
    /// done. Returns the day boundary history must be read from.
    pub fn begin_recovery(&mut self, now: DateTime<Local>) -> DateTime<Local> {
        let boundary = most_recent_boundary(now, self.policy.daily_reset_time);
        let store = self.ctx.store.as_ref();
        let mut held_records = HashMap::new();

        for state in self.students.values_mut() {
            held_records.insert(state.id(), state.notifications.clone());
            state.reset_presence();
            if state.prune_absences(boundary) {
                save_absences(store, state);
            }
        }

        self.seen_messages.clear();
        self.recovered = false;
        self.recovery = Some(RecoveryInProgress {
            boundary,
            held_records,
        });
        info!(%boundary, "Recovery started");
        boundary
    }

    /// Replay history in order with every side effect suppressed.
    /// Returns how many new messages were processed.
    pub fn replay(&mut self, messages: &[RelayMessage]) -> usize {
        let mut replayed = 0;
        for message in messages {
            if self.seen_messages.contains(&message.id) {
                continue;
            }
            self.handle_message(message, IngestMode::Replay);
            replayed += 1;
        }
        replayed
    }

    /// Merge held notification records into replayed presence and resume.
    pub fn finish_recovery(
        &mut self,
        now: DateTime<Local>,
        replayed: usize,
        history_available: bool,
    ) -> Vec<CoreEvent> {
        let RecoveryInProgress {
            boundary,
            held_records,
        } = self.recovery.take().unwrap_or_else(|| RecoveryInProgress {
            boundary: most_recent_boundary(now, self.policy.daily_reset_time),
            held_records: HashMap::new(),
        });
        let store = self.ctx.store.as_ref();

        for state in self.students.values_mut() {
            if let Some(stored) = held_records.get(&state.id()) {
                merge_record(state, stored, boundary);
            }
            save_record(store, state);
        }

        let last_reset = self.last_reset_at.map_or(boundary, |last| last.max(boundary));
        self.last_reset_at = Some(last_reset);
        if let Err(e) = store.set_last_reset_at(last_reset) {
            warn!(error = %e, "Failed to persist reset instant");
        }

        self.recovered = true;
        self.was_active = false;
        audit(
            store,
            AuditEventType::RecoveryCompleted {
                replayed,
                history_available,
            },
            now,
        );
        info!(replayed, history_available, "Recovery completed");

        vec![
            CoreEvent::RecoveryCompleted {
                replayed,
                history_available,
            },
            CoreEvent::Overview(self.overview(now)),
        ]
    }

    // Views

    pub fn overview(&self, now: DateTime<Local>) -> DashboardOverview {
        let mut overview = DashboardOverview::default();
        for state in self.students.values().filter(|s| !s.is_admin()) {
            overview.total += 1;
            if state.absence.is_some() {
                overview.absent += 1;
            }
            if state.is_joined() {
                match state.camera_state {
                    CameraState::On => overview.camera_on += 1,
                    CameraState::Off => overview.camera_off += 1,
                }
            } else if state.joined_today {
                overview.left += 1;
            } else if state.absence.is_none() {
                overview.not_joined_today += 1;
            }
            if camera_threshold_exceeded(state, &self.policy, now) {
                overview.threshold_exceeded += 1;
            }
        }
        overview
    }

    pub fn list_students(&self, now: DateTime<Local>) -> Vec<StudentView> {
        self.students.values().map(|s| s.view(now)).collect()
    }

    pub fn student_view(&self, id: StudentId, now: DateTime<Local>) -> Result<StudentView> {
        self.students
            .get(&id)
            .map(|s| s.view(now))
            .ok_or(RollcallError::StudentNotFound(id))
    }

    pub fn snapshot(&self, now: DateTime<Local>) -> ServiceStateSnapshot {
        ServiceStateSnapshot {
            api_version: API_VERSION,
            monitoring_paused: self.monitoring_paused,
            notifications_paused: self.notifications_paused,
            recovered: self.recovered,
            last_tick_at: self.last_tick_at,
            last_reset_at: self.last_reset_at,
            overview: self.overview(now),
        }
    }

    pub fn health(&self) -> HealthStatus {
        let store_ok = self.ctx.store.is_healthy();
        HealthStatus {
            live: true,
            ready: self.recovered && store_ok,
            store_ok,
            recovered: self.recovered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliver;
    use chrono::TimeZone;
    use rollcall_api::{Audience, JoinState};
    use rollcall_channel_api::{Delivery, FixedCalendar, MockNotifier, RelayChannel};
    use rollcall_store::SqliteStore;

    struct Harness {
        engine: PresenceEngine,
        notifier: Arc<MockNotifier>,
        store: Arc<SqliteStore>,
        next_message: u32,
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 15, h, m, 0).unwrap()
    }

    fn policy() -> MonitorPolicy {
        MonitorPolicy {
            camera_off_threshold: Duration::from_secs(20 * 60),
            alert_cooldown: Duration::from_secs(10 * 60),
            leave_alert_threshold: Duration::from_secs(30 * 60),
            leave_alert_cooldown: Duration::from_secs(60 * 60),
            return_reminder_interval: Duration::from_secs(10 * 60),
            ..MonitorPolicy::default()
        }
    }

    fn harness_with(store: Arc<SqliteStore>) -> Harness {
        let notifier = Arc::new(MockNotifier::new());
        let ctx = EngineContext {
            registry: store.clone(),
            store: store.clone(),
            calendar: Arc::new(FixedCalendar::new()),
            notifier: notifier.clone(),
        };
        let engine = PresenceEngine::new(ctx, policy(), Duration::ZERO, at(8, 0)).unwrap();
        Harness {
            engine,
            notifier,
            store,
            next_message: 0,
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.create_student("김유나", Some("1001"), false).unwrap();
        store.create_student("이민호", Some("1002"), false).unwrap();
        store.create_student("관리자", Some("9"), true).unwrap();
        store.create_student("Kim Yuna", Some("1003"), false).unwrap();
        let mut h = harness_with(store);
        // Yesterday's boundary already handled
        h.engine.last_reset_at = Some(at(0, 0));
        h
    }

    impl Harness {
        fn id(&self, name: &str) -> StudentId {
            self.store.find_by_display_name(name).unwrap().unwrap().id
        }

        fn message(&mut self, channel: RelayChannel, text: &str, when: DateTime<Local>) -> RelayMessage {
            self.next_message += 1;
            RelayMessage {
                id: MessageId::new(format!("m{}", self.next_message)),
                channel,
                author: None,
                text: text.to_string(),
                timestamp: when,
            }
        }

        fn relay(&mut self, text: &str, when: DateTime<Local>) -> Vec<CoreEvent> {
            let message = self.message(RelayChannel::Presence, text, when);
            self.engine.handle_message(&message, IngestMode::Live)
        }

        /// Tick and perform every planned send inline
        async fn tick(&mut self, now: DateTime<Local>) -> Vec<CoreEvent> {
            let outcome = self.engine.tick(now);
            let mut events = outcome.events;
            for mut intent in outcome.deliveries {
                let result = deliver(self.notifier.as_ref(), &mut intent)
                    .await
                    .map_err(|e| e.to_string());
                events.extend(self.engine.complete_delivery(intent, result));
            }
            events
        }

        fn sent_to(&self, student: StudentId) -> Vec<(Delivery, OutboundAlert)> {
            self.notifier
                .sent()
                .into_iter()
                .filter(|(_, alert)| alert.student_id == student)
                .collect()
        }
    }

    /// Joined at 12:59, camera on at 13:00, off at 13:05
    fn camera_off_scenario(h: &mut Harness) {
        h.relay("김유나님이 입장했습니다", at(12, 59));
        h.relay("김유나 님의 카메라가 on 되었습니다", at(13, 0));
        h.relay("김유나 님의 카메라가 off 되었습니다", at(13, 5));
    }

    #[tokio::test]
    async fn camera_alert_at_threshold_then_cooldown() {
        let mut h = harness();
        let yuna = h.id("김유나");
        camera_off_scenario(&mut h);

        h.tick(at(13, 24)).await;
        assert!(h.sent_to(yuna).is_empty());

        let events = h.tick(at(13, 25)).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, CoreEvent::AlertSent { stage: 1, .. })));
        let sent = h.sent_to(yuna);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Delivery::Direct("1001".into()));
        assert_eq!(sent[0].1.audience, Audience::Student);

        h.tick(at(13, 30)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);

        h.tick(at(13, 35)).await;
        let sent = h.sent_to(yuna);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].0, Delivery::Direct("1001".into()));
        assert_eq!(sent[2].0, Delivery::Admin);
        assert_eq!(sent[2].1.stage, 2);

        let record = h.engine.student(yuna).unwrap().notifications.camera;
        assert_eq!(record.stage_count, 2);
        assert_eq!(record.last_notified_at, Some(at(13, 35)));
        // Persisted as well
        let stored = h.store.load_notification_records().unwrap();
        assert!(stored.iter().any(|r| r.student_id == yuna && r.camera.stage_count == 2));
    }

    #[tokio::test]
    async fn camera_on_resets_escalation() {
        let mut h = harness();
        let yuna = h.id("김유나");
        camera_off_scenario(&mut h);
        h.tick(at(13, 25)).await;
        h.relay("김유나 님의 카메라가 on 되었습니다", at(13, 27));

        let state = h.engine.student(yuna).unwrap();
        assert_eq!(state.notifications.camera.stage_count, 0);
        h.tick(at(13, 40)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);
    }

    #[tokio::test]
    async fn early_leave_report_suppresses_from_its_start() {
        let mut h = harness();
        let yuna = h.id("Kim Yuna");
        h.relay("Kim Yuna님이 입장했습니다", at(12, 59));
        let report = h.message(RelayChannel::Status, "조퇴 - Kim Yuna, today 14:00", at(13, 0));
        h.engine.handle_message(&report, IngestMode::Live);

        let state = h.engine.student(yuna).unwrap();
        assert!(state.absence.is_none());
        assert_eq!(state.pending.len(), 1);

        // Still monitored before 14:00
        h.tick(at(13, 19)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);

        h.tick(at(14, 0)).await;
        let state = h.engine.student(yuna).unwrap();
        assert_eq!(state.absence.as_ref().map(|a| a.kind), Some(AbsenceKind::EarlyLeave));
        assert!(!state.notifications.camera.is_active());

        h.tick(at(15, 30)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);
    }

    #[tokio::test]
    async fn unknown_names_are_dropped() {
        let mut h = harness();
        let events = h.relay("홍길동님이 입장했습니다", at(13, 0));
        assert!(events.is_empty());
        assert_eq!(h.engine.overview(at(13, 0)).camera_off, 0);
    }

    #[tokio::test]
    async fn admins_are_never_notified() {
        let mut h = harness();
        let admin = h.id("관리자");
        h.relay("관리자님이 입장했습니다", at(10, 15));
        h.relay("관리자님이 퇴장했습니다", at(13, 0));
        for hour in [11, 14, 15, 16, 17] {
            h.tick(at(hour, 30)).await;
        }
        assert!(h.sent_to(admin).is_empty());
        assert_eq!(h.engine.overview(at(17, 30)).total, 3);
    }

    #[tokio::test]
    async fn failed_send_is_retried_without_advancing() {
        let mut h = harness();
        let yuna = h.id("김유나");
        camera_off_scenario(&mut h);

        h.notifier.set_failing(true);
        let events = h.tick(at(13, 25)).await;
        assert!(events.iter().any(|e| matches!(e, CoreEvent::AlertFailed { .. })));
        assert_eq!(h.engine.student(yuna).unwrap().notifications.camera.stage_count, 0);

        h.notifier.set_failing(false);
        h.tick(at(13, 26)).await;
        let camera = h.engine.student(yuna).unwrap().notifications.camera;
        assert_eq!(camera.stage_count, 1);
        assert_eq!(camera.last_notified_at, Some(at(13, 26)));
    }

    #[tokio::test]
    async fn dual_audience_retry_skips_the_reached_student() {
        let mut h = harness();
        let yuna = h.id("김유나");
        camera_off_scenario(&mut h);
        h.tick(at(13, 25)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);

        // Stage 2 goes to both; the student gets it, the admin channel is down
        h.notifier.set_admin_failing(true);
        let events = h.tick(at(13, 35)).await;
        assert!(events.iter().any(|e| matches!(e, CoreEvent::AlertFailed { .. })));
        assert_eq!(h.engine.student(yuna).unwrap().notifications.camera.stage_count, 1);
        let sent = h.sent_to(yuna);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, Delivery::Direct("1001".into()));

        h.notifier.set_admin_failing(false);
        let events = h.tick(at(13, 36)).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, CoreEvent::AlertSent { stage: 2, .. })));
        let sent = h.sent_to(yuna);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].0, Delivery::Admin);
        assert_eq!(sent[2].1.stage, 2);

        let camera = h.engine.student(yuna).unwrap().notifications.camera;
        assert_eq!(camera.stage_count, 2);
        assert_eq!(camera.last_notified_at, Some(at(13, 36)));
    }

    #[tokio::test]
    async fn lunch_and_evenings_are_quiet() {
        let mut h = harness();
        h.relay("김유나님이 입장했습니다", at(10, 30));
        let outcome = h.engine.tick(at(12, 0));
        assert_eq!(outcome.skipped, Some(TickSkip::Lunch));
        assert!(outcome.deliveries.is_empty());

        // Time at lunch does not count: 12:50 + 20 minutes
        h.tick(at(13, 9)).await;
        assert!(h.notifier.sent().is_empty());
        h.tick(at(13, 10)).await;
        assert_eq!(h.notifier.sent().len(), 1);

        let outcome = h.engine.tick(at(19, 0));
        assert_eq!(outcome.skipped, Some(TickSkip::OutsideClass));
    }

    #[tokio::test]
    async fn left_room_alert_and_return_request() {
        let mut h = harness();
        let minho = h.id("이민호");
        h.relay("이민호님이 입장했습니다", at(13, 0));
        h.relay("이민호님이 퇴장했습니다", at(13, 10));

        h.tick(at(13, 40)).await;
        let sent = h.sent_to(minho);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Delivery::Admin);
        let alert_id = sent[0].1.alert_id;

        h.engine
            .apply_response(alert_id, AlertChoice::RequestReturn, at(13, 41))
            .unwrap();
        // Answered alerts cannot be answered again
        assert!(matches!(
            h.engine.apply_response(alert_id, AlertChoice::MarkLeave, at(13, 41)),
            Err(RollcallError::UnknownAlert)
        ));

        h.tick(at(13, 41)).await;
        let sent = h.sent_to(minho);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, Delivery::Direct("1002".into()));
        assert_eq!(sent[1].1.kind, AlertKind::ReturnRequest);

        h.tick(at(13, 45)).await;
        assert_eq!(h.sent_to(minho).len(), 2);
        h.tick(at(13, 51)).await;
        assert_eq!(h.sent_to(minho).len(), 3);

        h.relay("이민호님이 입장했습니다", at(13, 55));
        let state = h.engine.student(minho).unwrap();
        assert!(!state.return_requested);
        assert!(!state.notifications.leave.is_active());
    }

    #[tokio::test]
    async fn away_response_marks_leave() {
        let mut h = harness();
        let yuna = h.id("김유나");
        camera_off_scenario(&mut h);
        h.tick(at(13, 25)).await;
        let alert_id = h.sent_to(yuna)[0].1.alert_id;

        assert!(matches!(
            h.engine.apply_response(alert_id, AlertChoice::MarkEarlyLeave, at(13, 26)),
            Err(RollcallError::ChoiceNotOffered(_))
        ));
        h.engine
            .apply_response(alert_id, AlertChoice::Away, at(13, 26))
            .unwrap();

        let state = h.engine.student(yuna).unwrap();
        assert_eq!(state.absence.as_ref().map(|a| a.kind), Some(AbsenceKind::Leave));
        h.tick(at(14, 30)).await;
        assert_eq!(h.sent_to(yuna).len(), 1);

        // Coming back clears the leave
        h.relay("김유나님이 입장했습니다", at(14, 40));
        assert!(h.engine.student(yuna).unwrap().absence.is_none());
    }

    #[tokio::test]
    async fn paused_notifications_send_nothing() {
        let mut h = harness();
        camera_off_scenario(&mut h);
        h.engine.set_notifications_paused(true);
        h.tick(at(14, 0)).await;
        assert!(h.notifier.sent().is_empty());

        h.engine.set_notifications_paused(false);
        h.tick(at(14, 1)).await;
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn daily_reset_clears_tracks_and_keeps_vacations() {
        let mut h = harness();
        let yuna = h.id("김유나");
        let minho = h.id("이민호");
        camera_off_scenario(&mut h);
        h.tick(at(13, 25)).await;
        let tomorrow = at(0, 0) + chrono::Duration::days(1);
        h.engine
            .set_status(
                minho,
                AbsenceKind::Vacation,
                None,
                Some(tomorrow.date_naive()),
                Some("가족 행사".into()),
                at(13, 30),
            )
            .unwrap();

        let events = h.tick(tomorrow).await;
        assert!(events.iter().any(|e| matches!(e, CoreEvent::DailyReset { .. })));

        let state = h.engine.student(yuna).unwrap();
        assert!(!state.notifications.camera.is_active());
        assert!(h.engine.student(minho).unwrap().absence.is_some());
        assert_eq!(h.store.last_reset_at().unwrap(), Some(tomorrow));
        assert!(h.store.load_notification_records().unwrap().is_empty());

        // Same boundary is not reset twice
        let events = h.tick(tomorrow + chrono::Duration::minutes(1)).await;
        assert!(!events.iter().any(|e| matches!(e, CoreEvent::DailyReset { .. })));
    }

    #[tokio::test]
    async fn live_reset_matches_restart_on_the_same_history() {
        let next_day = |h: u32, m: u32| at(h, m) + chrono::Duration::days(1);
        let evening = |h: &mut Harness| {
            vec![
                h.message(RelayChannel::Presence, "김유나님이 입장했습니다", at(17, 0)),
                h.message(RelayChannel::Presence, "이민호님이 입장했습니다", at(17, 5)),
                h.message(RelayChannel::Presence, "이민호 님의 카메라가 on 되었습니다", at(17, 6)),
                // Shortly after midnight, before any tick
                h.message(
                    RelayChannel::Presence,
                    "이민호님이 입장했습니다",
                    next_day(0, 0) + chrono::Duration::seconds(30),
                ),
            ]
        };

        // Still in the room at midnight, no events the next morning
        let mut live = harness();
        let messages = evening(&mut live);
        let yuna = live.id("김유나");
        let minho = live.id("이민호");
        let kim = live.id("Kim Yuna");
        for message in &messages {
            live.engine.handle_message(message, IngestMode::Live);
        }
        live.tick(next_day(0, 1)).await;
        live.tick(next_day(10, 11)).await;
        live.tick(next_day(11, 0)).await;

        // Restart the next morning: history starts at the boundary
        let mut restarted = harness();
        let messages = evening(&mut restarted);
        let boundary = restarted.engine.begin_recovery(next_day(11, 0));
        assert_eq!(boundary, next_day(0, 0));
        let since_boundary: Vec<_> = messages
            .into_iter()
            .filter(|m| m.timestamp >= boundary)
            .collect();
        let replayed = restarted.engine.replay(&since_boundary);
        restarted.engine.finish_recovery(next_day(11, 0), replayed, true);
        restarted.tick(next_day(11, 0)).await;

        for id in [yuna, minho, kim] {
            assert_eq!(
                presence(live.engine.student(id).unwrap()),
                presence(restarted.engine.student(id).unwrap())
            );
        }
        let state = live.engine.student(yuna).unwrap();
        assert_eq!(state.join_state, JoinState::Left);
        assert!(state.not_joined_today());
        assert!(live.engine.student(minho).unwrap().is_joined());
        assert!(live.sent_to(yuna).is_empty());
        assert!(restarted.sent_to(yuna).is_empty());
        assert_eq!(live.engine.last_reset_at(), Some(next_day(0, 0)));
    }

    fn history(h: &mut Harness) -> Vec<RelayMessage> {
        vec![
            h.message(RelayChannel::Presence, "김유나님이 입장했습니다", at(10, 20)),
            h.message(RelayChannel::Presence, "김유나 님의 카메라가 on 되었습니다", at(10, 21)),
            h.message(RelayChannel::Presence, "이민호님이 입장했습니다", at(10, 25)),
            h.message(RelayChannel::Presence, "김유나 님의 카메라가 off 되었습니다", at(10, 40)),
            h.message(RelayChannel::Presence, "이민호님이 퇴장했습니다", at(11, 0)),
            h.message(RelayChannel::Status, "외출 - 이민호, 병원", at(11, 1)),
        ]
    }

    type Presence = (
        CameraState,
        Option<DateTime<Local>>,
        JoinState,
        Option<DateTime<Local>>,
        bool,
        Option<rollcall_api::Absence>,
        Vec<rollcall_api::Absence>,
    );

    fn presence(state: &StudentState) -> Presence {
        (
            state.camera_state,
            state.last_state_change_at,
            state.join_state,
            state.last_leave_at,
            state.joined_today,
            state.absence.clone(),
            state.pending.clone(),
        )
    }

    #[tokio::test]
    async fn replay_is_idempotent_and_silent() {
        let mut h = harness();
        let yuna = h.id("김유나");
        let minho = h.id("이민호");
        let kim = h.id("Kim Yuna");
        let messages = history(&mut h);

        h.engine.begin_recovery(at(11, 30));
        assert_eq!(h.engine.replay(&messages), 6);
        let events = h.engine.finish_recovery(at(11, 30), 6, true);
        assert!(events.iter().any(|e| matches!(e, CoreEvent::RecoveryCompleted { replayed: 6, .. })));
        let first: Vec<_> = [yuna, minho, kim]
            .iter()
            .map(|id| presence(h.engine.student(*id).unwrap()))
            .collect();

        h.engine.begin_recovery(at(11, 30));
        h.engine.replay(&messages);
        h.engine.finish_recovery(at(11, 30), 6, true);
        let second: Vec<_> = [yuna, minho, kim]
            .iter()
            .map(|id| presence(h.engine.student(*id).unwrap()))
            .collect();

        assert_eq!(first, second);
        assert!(h.notifier.sent().is_empty());

        let state = h.engine.student(yuna).unwrap();
        assert_eq!(state.camera_state, CameraState::Off);
        assert_eq!(state.last_state_change_at, Some(at(10, 40)));
        assert_eq!(h.engine.student(minho).unwrap().join_state, JoinState::Left);
        assert!(h.engine.student(kim).unwrap().not_joined_today());
    }

    #[tokio::test]
    async fn recovery_restores_stages_and_timers() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.create_student("김유나", Some("1001"), false).unwrap();
        let yuna = store.find_by_display_name("김유나").unwrap().unwrap().id;

        // Before the crash: stage 1 sent at 11:00
        let mut record = NotificationRecord::empty(yuna);
        record.camera.advance(at(11, 0));
        store.save_notification_record(&record).unwrap();

        let mut h = harness_with(store);
        let messages = vec![
            h.message(RelayChannel::Presence, "김유나님이 입장했습니다", at(10, 20)),
            h.message(RelayChannel::Presence, "김유나 님의 카메라가 off 되었습니다", at(10, 40)),
        ];
        h.engine.begin_recovery(at(11, 5));
        h.engine.replay(&messages);
        h.engine.finish_recovery(at(11, 5), 2, true);

        let state = h.engine.student(yuna).unwrap();
        assert_eq!(state.notifications.camera.stage_count, 1);
        assert!(h.engine.is_recovered());

        // Cooldown continues from the stored send, not the restart
        h.tick(at(11, 9)).await;
        assert!(h.notifier.sent().is_empty());
        h.tick(at(11, 10)).await;
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.stage, 2);
    }

    #[tokio::test]
    async fn live_feed_overlapping_replay_is_deduplicated() {
        let mut h = harness();
        let yuna = h.id("김유나");
        let messages = history(&mut h);
        h.engine.begin_recovery(at(11, 30));
        h.engine.replay(&messages);
        h.engine.finish_recovery(at(11, 30), 6, true);

        // The poller re-delivers the newest message
        let events = h.engine.handle_message(&messages[3], IngestMode::Live);
        assert!(events.is_empty());
        assert_eq!(h.engine.student(yuna).unwrap().last_state_change_at, Some(at(10, 40)));
    }
}
