//! Relayed chat text -> typed presence events
//!
//! The classroom tool posts four fixed templates into the relay channel
//! (camera on/off, join, leave). Staff post free-form status reports, parsed
//! in [`crate::status`]. Either way the extracted name fragment is resolved
//! against the registry before an event is produced.

use chrono::{DateTime, Local};
use rollcall_config::MonitorPolicy;
use rollcall_util::StudentId;
use thiserror::Error;
use tracing::debug;

use crate::{parse_status_report, ClassifiedEvent, PresenceEvent, StatusChange};

/// Why a message that looked like an event produced none
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("No registered student matches '{0}'")]
    NotFound(String),

    #[error("'{fragment}' matches several students: {candidates:?}")]
    Ambiguous {
        fragment: String,
        candidates: Vec<String>,
    },

    #[error("Unparseable status report ({reason}): {text}")]
    InvalidStatus { text: String, reason: String },
}

/// Characters separating role prefixes, nicknames and names
const NAME_SEPARATORS: &[char] = &[
    '/', '_', '-', '|', ' ', '.', '(', ')', '@', '[', ']', '{', '}', '*',
];

const LEAVE_MARKERS: &[&str] = &["퇴장", "접속종료", "접속을종료", "나갔습니다"];
const JOIN_MARKERS: &[&str] = &["입장", "접속했습니다", "들어왔습니다"];

/// Split a relay template into the name fragment before `님` and the rest
fn split_template(text: &str) -> Option<(&str, &str)> {
    for (idx, marker) in text.match_indices('님') {
        let before = &text[..idx];
        // Drop "[10:31]"-style prefixes and leading icons
        let segment = before
            .rsplit([']', ':'])
            .next()
            .unwrap_or(before)
            .trim_start_matches(|c: char| !c.is_alphanumeric() && c != '*' && c != '(')
            .trim()
            .trim_matches('*')
            .trim();
        if !segment.is_empty() {
            return Some((segment, &text[idx + marker.len()..]));
        }
    }
    None
}

/// Match the remainder of a template against the known phrasings
fn template_event(rest: &str) -> Option<PresenceEvent> {
    let squashed: String = rest
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let after_particle = squashed
        .strip_prefix('의')
        .or_else(|| squashed.strip_prefix('이'))
        .unwrap_or(&squashed);
    if let Some(camera) = after_particle.strip_prefix("카메라") {
        let camera = camera
            .strip_prefix('를')
            .or_else(|| camera.strip_prefix('가'))
            .unwrap_or(camera);
        if camera.starts_with("켰") || camera.starts_with("on되었") {
            return Some(PresenceEvent::CameraOn);
        }
        if camera.starts_with("껐") || camera.starts_with("off되었") {
            return Some(PresenceEvent::CameraOff);
        }
    }

    if LEAVE_MARKERS.iter().any(|m| squashed.contains(m)) {
        return Some(PresenceEvent::Leave);
    }
    if JOIN_MARKERS.iter().any(|m| squashed.contains(m)) {
        return Some(PresenceEvent::Join);
    }
    None
}

pub struct Classifier {
    ignore_keywords: Vec<String>,
    role_keywords: Vec<String>,
}

impl Classifier {
    pub fn new(policy: &MonitorPolicy) -> Self {
        Self {
            ignore_keywords: policy
                .ignore_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            role_keywords: policy
                .role_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.ignore_keywords.iter().any(|k| lowered.contains(k))
    }

    /// Resolve a fragment and drop ignore-listed students. The resolved
    /// display name decides; a fragment nobody resolves to is dropped quietly
    /// when it is ignore-listed itself.
    fn resolve_unignored(
        &self,
        fragment: &str,
        roster: &[(StudentId, &str)],
    ) -> Result<Option<StudentId>, ClassifyError> {
        match self.resolve(fragment, roster) {
            Ok(id) => {
                let name = roster
                    .iter()
                    .find(|(candidate, _)| *candidate == id)
                    .map_or(fragment, |(_, name)| *name);
                if self.is_ignored(name) {
                    debug!(name, "Ignored name, dropping");
                    return Ok(None);
                }
                Ok(Some(id))
            }
            Err(_) if self.is_ignored(fragment) => {
                debug!(fragment, "Ignored unregistered name, dropping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Names to try for a fragment, most specific first
    pub fn name_candidates(&self, fragment: &str) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mut push = |candidate: &str| {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !candidates.iter().any(|c| c == candidate) {
                candidates.push(candidate.to_string());
            }
        };

        push(fragment);
        if let Some((_, suffix)) = fragment.rsplit_once('_') {
            push(suffix);
        }
        for part in fragment.split(NAME_SEPARATORS) {
            if !self.role_keywords.contains(&part.trim().to_lowercase()) {
                push(part);
            }
        }
        candidates
    }

    /// Resolve a name fragment: exact match first, then a unique substring match.
    pub fn resolve(
        &self,
        fragment: &str,
        roster: &[(StudentId, &str)],
    ) -> Result<StudentId, ClassifyError> {
        let candidates = self.name_candidates(fragment);
        let normalized: Vec<(StudentId, String)> = roster
            .iter()
            .map(|(id, name)| (*id, name.trim().to_lowercase()))
            .collect();

        for candidate in &candidates {
            let candidate = candidate.to_lowercase();
            let exact: Vec<StudentId> = normalized
                .iter()
                .filter(|(_, name)| *name == candidate)
                .map(|(id, _)| *id)
                .collect();
            if let [id] = exact.as_slice() {
                return Ok(*id);
            }
        }

        let mut partial: Vec<StudentId> = Vec::new();
        for candidate in &candidates {
            let candidate = candidate.to_lowercase();
            if candidate.chars().count() < 2 {
                continue;
            }
            for (id, name) in &normalized {
                if name.chars().count() >= 2
                    && (name.contains(&candidate) || candidate.contains(name.as_str()))
                    && !partial.contains(id)
                {
                    partial.push(*id);
                }
            }
        }

        match partial.as_slice() {
            [id] => Ok(*id),
            [] => Err(ClassifyError::NotFound(fragment.to_string())),
            ids => Err(ClassifyError::Ambiguous {
                fragment: fragment.to_string(),
                candidates: roster
                    .iter()
                    .filter(|(id, _)| ids.contains(id))
                    .map(|(_, name)| name.to_string())
                    .collect(),
            }),
        }
    }

    /// Classify one relayed message.
    ///
    /// `Ok(None)` covers text that is not an event and ignore-listed names.
    pub fn classify(
        &self,
        text: &str,
        timestamp: DateTime<Local>,
        roster: &[(StudentId, &str)],
    ) -> Result<Option<ClassifiedEvent>, ClassifyError> {
        let text = text.trim();

        if let Some((fragment, rest)) = split_template(text) {
            if let Some(event) = template_event(rest) {
                let Some(student_id) = self.resolve_unignored(fragment, roster)? else {
                    return Ok(None);
                };
                return Ok(Some(ClassifiedEvent {
                    student_id,
                    timestamp,
                    event,
                }));
            }
        }

        let Some(report) = parse_status_report(text, timestamp)? else {
            debug!(text, "Not a presence message");
            return Ok(None);
        };
        let Some(student_id) = self.resolve_unignored(&report.name, roster)? else {
            return Ok(None);
        };
        Ok(Some(ClassifiedEvent {
            student_id,
            timestamp,
            event: PresenceEvent::StatusChange(StatusChange {
                kind: report.kind,
                start: report.start,
                end: report.end,
                reason: report.reason,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_api::AbsenceKind;

    fn classifier() -> Classifier {
        let mut policy = MonitorPolicy::default();
        policy.ignore_keywords = vec!["봇".into(), "test".into()];
        Classifier::new(&policy)
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 15, 10, 31, 0).unwrap()
    }

    const ROSTER: &[(i64, &str)] = &[(1, "김유나"), (2, "이민호"), (3, "Kim Yuna"), (4, "박서준"), (5, "박서진")];

    fn roster() -> Vec<(StudentId, &'static str)> {
        ROSTER.iter().map(|(id, name)| (StudentId::new(*id), *name)).collect()
    }

    fn classify(text: &str) -> Result<Option<ClassifiedEvent>, ClassifyError> {
        classifier().classify(text, at(), &roster())
    }

    fn event_of(text: &str) -> (i64, PresenceEvent) {
        let classified = classify(text).unwrap().unwrap();
        (classified.student_id.get(), classified.event)
    }

    #[test]
    fn relay_templates() {
        assert_eq!(event_of("📷 김유나 님의 카메라가 on 되었습니다"), (1, PresenceEvent::CameraOn));
        assert_eq!(event_of("[10:31] 김유나님이 카메라를 껐습니다"), (1, PresenceEvent::CameraOff));
        assert_eq!(event_of("🚪 *이민호*님이 퇴장했습니다"), (2, PresenceEvent::Leave));
        assert_eq!(event_of("이민호님이 접속을 종료했습니다"), (2, PresenceEvent::Leave));
        assert_eq!(event_of("✅ 이민호님이 입장했습니다"), (2, PresenceEvent::Join));
        assert_eq!(event_of("Kim Yuna 님의 카메라가 OFF 되었습니다"), (3, PresenceEvent::CameraOff));
    }

    #[test]
    fn role_prefixes_are_stripped() {
        assert_eq!(event_of("조교_이민호님이 입장했습니다"), (2, PresenceEvent::Join));
        assert_eq!(event_of("[멘토] 이민호 (팀장)님이 들어왔습니다"), (2, PresenceEvent::Join));
    }

    #[test]
    fn candidates_skip_role_keywords() {
        let candidates = classifier().name_candidates("주강사/조교_이민호");
        assert_eq!(candidates, vec!["주강사/조교_이민호", "이민호"]);
    }

    #[test]
    fn exact_match_beats_substring() {
        // "박서준" is a substring candidate for nothing else but must not be
        // confused with "박서진"
        assert_eq!(event_of("박서준님이 입장했습니다"), (4, PresenceEvent::Join));
        // Nickname containing the full name
        assert_eq!(event_of("유나님이 입장했습니다"), (1, PresenceEvent::Join));
    }

    #[test]
    fn ambiguous_names_are_rejected() {
        let err = classify("박서님이 입장했습니다").unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Ambiguous { ref candidates, .. } if candidates.len() == 2
        ));
    }

    #[test]
    fn unknown_name_is_not_found() {
        assert_eq!(
            classify("홍길동님이 입장했습니다").unwrap_err(),
            ClassifyError::NotFound("홍길동".into())
        );
    }

    #[test]
    fn ignored_names_produce_nothing() {
        assert_eq!(classify("출석봇님이 입장했습니다").unwrap(), None);
        assert_eq!(classify("조퇴 - TEST student, today").unwrap(), None);
    }

    #[test]
    fn ignore_list_applies_to_the_resolved_name() {
        let roster = vec![(StudentId::new(1), "김유나"), (StudentId::new(9), "출석봇")];
        let classifier = classifier();

        // Registered bot account
        let event = classifier.classify("출석봇 님의 카메라가 off 되었습니다", at(), &roster);
        assert_eq!(event.unwrap(), None);

        // A keyword in the raw fragment does not hide a real student
        let event = classifier
            .classify("test_김유나님이 입장했습니다", at(), &roster)
            .unwrap()
            .unwrap();
        assert_eq!(event.student_id, StudentId::new(1));
        assert_eq!(event.event, PresenceEvent::Join);
    }

    #[test]
    fn chatter_is_not_an_event() {
        assert_eq!(classify("오늘 점심 뭐 먹죠?").unwrap(), None);
        assert_eq!(classify("선생님 질문 있습니다").unwrap(), None);
    }

    #[test]
    fn status_reports_are_resolved() {
        let classified = classify("조퇴 - Kim Yuna, today 14:00").unwrap().unwrap();
        assert_eq!(classified.student_id, StudentId::new(3));
        match classified.event {
            PresenceEvent::StatusChange(change) => {
                assert_eq!(change.kind, AbsenceKind::EarlyLeave);
                assert_eq!(change.start, Local.with_ymd_and_hms(2026, 10, 15, 14, 0, 0).unwrap());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_status_is_an_error() {
        assert!(matches!(
            classify("휴가 - 김유나, 13/45"),
            Err(ClassifyError::InvalidStatus { .. })
        ));
    }
}
