//! Camera-off escalation
//!
//! The first alert goes to the student once the camera has been off for the
//! threshold. Every later stage waits out the cooldown since the previous
//! send and copies the admin channel.

use chrono::{DateTime, Local};
use rollcall_api::{AlertChoice, AlertKind, Audience, CameraState};
use rollcall_config::MonitorPolicy;
use rollcall_util::{elapsed, whole_minutes};

use crate::StudentState;

/// An alert the engine wants to send for one student
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPlan {
    pub kind: AlertKind,
    /// Stage this alert will commit; 1 for the first alert
    pub stage: u32,
    pub audience: Audience,
    pub choices: Vec<AlertChoice>,
    pub text: String,
}

/// Students without a contact id can only be reached through the admin channel
pub fn reachable_audience(state: &StudentState, wanted: Audience) -> Audience {
    let has_contact = state
        .record
        .contact_id
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if has_contact || !wanted.includes_student() {
        wanted
    } else {
        Audience::Admin
    }
}

fn camera_monitored(state: &StudentState) -> bool {
    !state.is_admin()
        && state.camera_state == CameraState::Off
        && state.is_joined()
        && state.absence.is_none()
}

/// Whether the camera has been off for at least the threshold
pub fn camera_threshold_exceeded(
    state: &StudentState,
    policy: &MonitorPolicy,
    now: DateTime<Local>,
) -> bool {
    camera_monitored(state)
        && state
            .camera_timer_start()
            .is_some_and(|since| elapsed(now, since) >= policy.camera_off_threshold)
}

pub fn evaluate_camera(
    state: &StudentState,
    policy: &MonitorPolicy,
    now: DateTime<Local>,
) -> Option<AlertPlan> {
    if !camera_monitored(state) {
        return None;
    }
    let since = state.camera_timer_start()?;
    let off_for = elapsed(now, since);
    let track = state.track(AlertKind::CameraOff);
    let name = state.display_name();
    let minutes = whole_minutes(off_for);

    if !track.is_active() {
        if off_for < policy.camera_off_threshold {
            return None;
        }
        return Some(AlertPlan {
            kind: AlertKind::CameraOff,
            stage: 1,
            audience: reachable_audience(state, Audience::Student),
            choices: vec![AlertChoice::Resumed, AlertChoice::Away],
            text: format!(
                "{} 님, 카메라가 {}분째 꺼져 있습니다. 수업 중이라면 카메라를 켜 주세요.",
                name, minutes
            ),
        });
    }

    let last = track.last_notified_at?;
    if elapsed(now, last) < policy.alert_cooldown {
        return None;
    }
    let stage = track.stage_count + 1;
    Some(AlertPlan {
        kind: AlertKind::CameraOff,
        stage,
        audience: reachable_audience(state, Audience::StudentAndAdmin),
        choices: vec![AlertChoice::Resumed, AlertChoice::Away],
        text: format!(
            "[{}차 알림] {} 님의 카메라가 {}분째 꺼져 있습니다.",
            stage, name, minutes
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PresenceEvent;
    use chrono::TimeZone;
    use rollcall_api::{Absence, AbsenceKind, StudentRecord};
    use rollcall_util::StudentId;
    use std::time::Duration;

    fn policy() -> MonitorPolicy {
        MonitorPolicy {
            camera_off_threshold: Duration::from_secs(20 * 60),
            alert_cooldown: Duration::from_secs(10 * 60),
            ..MonitorPolicy::default()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 15, h, m, 0).unwrap()
    }

    fn joined(contact: Option<&str>, admin: bool) -> StudentState {
        let mut s = StudentState::new(StudentRecord {
            id: StudentId::new(1),
            display_name: "김유나".into(),
            contact_id: contact.map(str::to_string),
            is_admin: admin,
        });
        s.apply(&PresenceEvent::Join, at(13, 0));
        s.apply(&PresenceEvent::CameraOn, at(13, 0));
        s.apply(&PresenceEvent::CameraOff, at(13, 5));
        s
    }

    #[test]
    fn first_alert_waits_for_threshold() {
        let s = joined(Some("1001"), false);
        assert_eq!(evaluate_camera(&s, &policy(), at(13, 24)), None);

        let plan = evaluate_camera(&s, &policy(), at(13, 25)).unwrap();
        assert_eq!(plan.stage, 1);
        assert_eq!(plan.audience, Audience::Student);
        assert_eq!(plan.choices, vec![AlertChoice::Resumed, AlertChoice::Away]);
        assert!(plan.text.contains("20분째"));
    }

    #[test]
    fn later_stages_wait_for_cooldown_and_copy_admin() {
        let mut s = joined(Some("1001"), false);
        s.notifications.camera.advance(at(13, 25));

        assert_eq!(evaluate_camera(&s, &policy(), at(13, 34)), None);
        let plan = evaluate_camera(&s, &policy(), at(13, 35)).unwrap();
        assert_eq!(plan.stage, 2);
        assert_eq!(plan.audience, Audience::StudentAndAdmin);
    }

    #[test]
    fn admins_and_absent_students_are_exempt() {
        let admin = joined(Some("9"), true);
        assert_eq!(evaluate_camera(&admin, &policy(), at(17, 0)), None);
        assert!(!camera_threshold_exceeded(&admin, &policy(), at(17, 0)));

        let mut away = joined(Some("1001"), false);
        away.absence = Some(Absence {
            kind: AbsenceKind::Leave,
            set_at: at(13, 6),
            start: at(13, 6),
            end: None,
            reason: None,
        });
        assert_eq!(evaluate_camera(&away, &policy(), at(17, 0)), None);
    }

    #[test]
    fn no_contact_falls_back_to_admin() {
        let s = joined(None, false);
        let plan = evaluate_camera(&s, &policy(), at(13, 30)).unwrap();
        assert_eq!(plan.audience, Audience::Admin);
    }

    #[test]
    fn camera_on_or_left_is_not_monitored() {
        let mut s = joined(Some("1001"), false);
        s.apply(&PresenceEvent::Leave, at(13, 10));
        assert_eq!(evaluate_camera(&s, &policy(), at(14, 0)), None);

        let mut s = joined(Some("1001"), false);
        s.apply(&PresenceEvent::CameraOn, at(13, 10));
        assert_eq!(evaluate_camera(&s, &policy(), at(14, 0)), None);
    }
}
