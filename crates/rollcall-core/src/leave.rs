//! Left-room monitoring and return requests

use chrono::{DateTime, Local};
use rollcall_api::{AlertChoice, AlertKind, Audience, JoinState};
use rollcall_config::MonitorPolicy;
use rollcall_util::{elapsed, whole_minutes};

use crate::{reachable_audience, AlertPlan, StudentState};

const DISPOSITIONS: [AlertChoice; 3] = [
    AlertChoice::MarkLeave,
    AlertChoice::MarkEarlyLeave,
    AlertChoice::RequestReturn,
];

fn away(state: &StudentState) -> bool {
    !state.is_admin() && state.join_state == JoinState::Left && state.absence.is_none()
}

/// Admin-only alert for a student who left the room and has not come back
pub fn evaluate_leave(
    state: &StudentState,
    policy: &MonitorPolicy,
    now: DateTime<Local>,
) -> Option<AlertPlan> {
    if !away(state) {
        return None;
    }
    let since = state.leave_timer_start()?;
    let gone_for = elapsed(now, since);
    let track = state.track(AlertKind::LeftRoom);
    let minutes = whole_minutes(gone_for);

    let (stage, text) = if !track.is_active() {
        if gone_for < policy.leave_alert_threshold {
            return None;
        }
        (
            1,
            format!(
                "{} 님이 {}분째 자리를 비웠습니다. 처리 방법을 선택해 주세요.",
                state.display_name(),
                minutes
            ),
        )
    } else {
        let last = track.last_notified_at?;
        if elapsed(now, last) < policy.leave_alert_cooldown {
            return None;
        }
        let stage = track.stage_count + 1;
        (
            stage,
            format!(
                "[{}차 알림] {} 님이 {}분째 복귀하지 않았습니다.",
                stage,
                state.display_name(),
                minutes
            ),
        )
    };

    Some(AlertPlan {
        kind: AlertKind::LeftRoom,
        stage,
        audience: Audience::Admin,
        choices: DISPOSITIONS.to_vec(),
        text,
    })
}

/// Student reminder after an admin asked them to come back
pub fn evaluate_return(
    state: &StudentState,
    policy: &MonitorPolicy,
    now: DateTime<Local>,
) -> Option<AlertPlan> {
    if !state.return_requested || !away(state) {
        return None;
    }
    let track = state.track(AlertKind::ReturnRequest);
    let name = state.display_name();

    let (stage, text) = match track.last_notified_at {
        None => (
            1,
            format!(
                "{} 님, 관리자가 복귀 확인을 요청했습니다. 수업에 다시 입장해 주세요.",
                name
            ),
        ),
        Some(last) if elapsed(now, last) >= policy.return_reminder_interval => {
            let stage = track.stage_count + 1;
            (
                stage,
                format!(
                    "[{}차 알림] {} 님, 아직 복귀가 확인되지 않았습니다. 수업에 입장해 주세요.",
                    stage, name
                ),
            )
        }
        Some(_) => return None,
    };

    Some(AlertPlan {
        kind: AlertKind::ReturnRequest,
        stage,
        audience: reachable_audience(state, Audience::Student),
        choices: Vec::new(),
        text,
    })
}
