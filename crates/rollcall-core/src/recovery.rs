//! Restart recovery
//!
//! Presence is rebuilt by replaying relay history since the last daily
//! boundary. Which alerts already fired cannot be learned from history, so
//! durable notification records are merged back afterwards; wherever the
//! replayed presence contradicts a stored record, presence wins.

use chrono::{DateTime, Local};
use rollcall_api::{CameraState, JoinState, NotificationRecord, StageCounter};
use rollcall_channel_api::{
    ChannelError, ChannelResult, HistoryPage, RelayChannel, RelayMessage, RelaySource,
};
use rollcall_config::RelayConfig;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{CoreEvent, PresenceEngine, StudentState};

/// Exponential backoff for history requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.history_max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.cap)
    }
}

/// Summary of one recovery run
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub boundary: DateTime<Local>,
    pub fetched: usize,
    pub replayed: usize,
    pub history_available: bool,
    /// Events to broadcast once recovery is done
    pub events: Vec<CoreEvent>,
}

async fn fetch_page(
    relay: &dyn RelaySource,
    channel: RelayChannel,
    oldest: DateTime<Local>,
    cursor: Option<String>,
    retry: &RetryPolicy,
) -> ChannelResult<HistoryPage> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match relay.fetch_history(channel, oldest, cursor.clone()).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                let delay = match &e {
                    ChannelError::RateLimited { retry_after } => {
                        (*retry_after).max(retry.backoff_delay(attempt))
                    }
                    _ => retry.backoff_delay(attempt),
                };
                warn!(
                    channel = ?channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "History fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Every message on `channels` since `oldest`, de-duplicated and in
/// chronological order
pub async fn fetch_history(
    relay: &dyn RelaySource,
    channels: &[RelayChannel],
    oldest: DateTime<Local>,
    retry: &RetryPolicy,
) -> ChannelResult<Vec<RelayMessage>> {
    let mut seen = HashSet::new();
    let mut messages = Vec::new();

    for &channel in channels {
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        loop {
            let page = fetch_page(relay, channel, oldest, cursor.take(), retry).await?;
            pages += 1;
            messages.extend(
                page.messages
                    .into_iter()
                    .filter(|m| seen.insert(m.id.clone())),
            );
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(channel = ?channel, pages, "Fetched relay history");
    }

    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    Ok(messages)
}

/// Rebuild presence from relay history.
///
/// Never fails: when history cannot be fetched every student starts as not
/// joined and live events take over from there.
pub async fn recover(
    engine: &mut PresenceEngine,
    relay: Option<&dyn RelaySource>,
    retry: &RetryPolicy,
    now: DateTime<Local>,
) -> RecoveryReport {
    let boundary = engine.begin_recovery(now);

    let (messages, history_available) = match relay {
        Some(relay) => match fetch_history(relay, &relay.channels(), boundary, retry).await {
            Ok(messages) => (messages, true),
            Err(e) => {
                error!(error = %e, "Relay history unavailable, starting with everyone not joined");
                (Vec::new(), false)
            }
        },
        None => {
            warn!("No relay configured, skipping history replay");
            (Vec::new(), false)
        }
    };

    let replayed = engine.replay(&messages);
    let events = engine.finish_recovery(now, replayed, history_available);

    RecoveryReport {
        boundary,
        fetched: messages.len(),
        replayed,
        history_available,
        events,
    }
}

fn notified_since(counter: &StageCounter, since: Option<DateTime<Local>>, boundary: DateTime<Local>) -> bool {
    match (counter.last_notified_at, since) {
        (Some(notified), Some(since)) => notified >= since && notified >= boundary,
        _ => false,
    }
}

/// Merge a stored notification record into replayed presence.
pub fn merge_record(state: &mut StudentState, stored: &NotificationRecord, boundary: DateTime<Local>) {
    let clear = state.absence.is_some() || state.is_admin();
    let camera_live = !clear
        && state.camera_state == CameraState::Off
        && state.join_state == JoinState::Joined;
    let away = !clear && state.join_state == JoinState::Left;

    state.notifications.camera =
        if camera_live && notified_since(&stored.camera, state.last_state_change_at, boundary) {
            stored.camera
        } else {
            StageCounter::default()
        };
    state.notifications.leave =
        if away && notified_since(&stored.leave, state.last_leave_at, boundary) {
            stored.leave
        } else {
            StageCounter::default()
        };

    let return_live =
        away && notified_since(&stored.return_request, state.last_leave_at, boundary);
    state.notifications.return_request = if return_live {
        stored.return_request
    } else {
        StageCounter::default()
    };
    state.return_requested = return_live;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PresenceEvent;
    use chrono::TimeZone;
    use rollcall_api::{Absence, AbsenceKind, StudentRecord};
    use rollcall_channel_api::MockRelay;
    use rollcall_util::{MessageId, StudentId};

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 15, h, m, 0).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    fn message(id: &str, channel: RelayChannel, minute: u32) -> RelayMessage {
        RelayMessage {
            id: MessageId::new(id),
            channel,
            author: None,
            text: id.to_string(),
            timestamp: at(10, minute),
        }
    }

    fn student() -> StudentState {
        StudentState::new(StudentRecord {
            id: StudentId::new(1),
            display_name: "김유나".into(),
            contact_id: Some("1001".into()),
            is_admin: false,
        })
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(retry.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(retry.backoff_delay(5), Duration::from_secs(8));
        assert_eq!(retry.backoff_delay(30), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn history_is_paged_merged_and_sorted() {
        let relay = MockRelay::new(vec![
            message("c", RelayChannel::Presence, 3),
            message("a", RelayChannel::Presence, 1),
            message("s", RelayChannel::Status, 2),
            message("d", RelayChannel::Presence, 4),
        ]);
        let messages = fetch_history(&relay, &relay.channels(), at(0, 0), &fast_retry())
            .await
            .unwrap();

        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "s", "c", "d"]);
        // Two presence pages, one status page
        assert_eq!(relay.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let relay = MockRelay::new(vec![message("a", RelayChannel::Presence, 1)]);
        relay.fail_next(2);
        let messages = fetch_history(&relay, &[RelayChannel::Presence], at(0, 0), &fast_retry())
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(relay.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let relay = MockRelay::new(vec![message("a", RelayChannel::Presence, 1)]);
        relay.fail_next(5);
        let result =
            fetch_history(&relay, &[RelayChannel::Presence], at(0, 0), &fast_retry()).await;
        assert!(matches!(result, Err(ChannelError::Transport(_))));
        assert_eq!(relay.fetch_calls(), 3);
    }

    #[test]
    fn presence_wins_over_stored_camera_stage() {
        let boundary = at(0, 0);
        let mut stored = NotificationRecord::empty(StudentId::new(1));
        stored.camera.advance(at(10, 30));

        // Camera was turned on after the alert
        let mut s = student();
        s.apply(&PresenceEvent::Join, at(10, 0));
        s.apply(&PresenceEvent::CameraOn, at(10, 40));
        merge_record(&mut s, &stored, boundary);
        assert!(!s.notifications.camera.is_active());

        // Still off since before the alert: keep escalating from stage 1
        let mut s = student();
        s.apply(&PresenceEvent::Join, at(10, 0));
        merge_record(&mut s, &stored, boundary);
        assert_eq!(s.notifications.camera, stored.camera);
    }

    #[test]
    fn records_from_before_the_boundary_are_dropped() {
        let mut stored = NotificationRecord::empty(StudentId::new(1));
        stored.leave.advance(at(10, 30));

        let mut s = student();
        s.apply(&PresenceEvent::Join, at(9, 0));
        s.apply(&PresenceEvent::Leave, at(10, 0));
        merge_record(&mut s, &stored, at(11, 0));
        assert!(!s.notifications.leave.is_active());
    }

    #[test]
    fn return_request_survives_only_while_away() {
        let mut stored = NotificationRecord::empty(StudentId::new(1));
        stored.return_request.advance(at(10, 45));

        let mut s = student();
        s.apply(&PresenceEvent::Join, at(9, 0));
        s.apply(&PresenceEvent::Leave, at(10, 0));
        merge_record(&mut s, &stored, at(0, 0));
        assert!(s.return_requested);

        s.apply(&PresenceEvent::Join, at(11, 0));
        merge_record(&mut s, &stored, at(0, 0));
        assert!(!s.return_requested);
        assert!(!s.notifications.return_request.is_active());
    }

    #[test]
    fn prune_drops_yesterdays_leave_and_ended_vacations() {
        let boundary = at(0, 0);
        let yesterday = boundary - chrono::Duration::days(1);
        let absence = |kind, set_at: DateTime<Local>, end| Absence {
            kind,
            set_at,
            start: set_at,
            end,
            reason: None,
        };

        let mut s = student();
        s.absence = Some(absence(AbsenceKind::EarlyLeave, yesterday, None));
        assert!(s.prune_absences(boundary));
        assert!(s.absence.is_none());

        let mut s = student();
        s.absence = Some(absence(
            AbsenceKind::Vacation,
            yesterday,
            Some(boundary.date_naive()),
        ));
        s.pending.push(absence(AbsenceKind::Vacation, yesterday, Some(yesterday.date_naive())));
        assert!(s.prune_absences(boundary));
        assert!(s.absence.is_some());
        assert!(s.pending.is_empty());
    }
}
