//! Free-form status reports
//!
//! Staff post reports such as `조퇴 - 김유나, 오늘 14:00, 병원` into the status
//! channel. The grammar is `<kind> - <name>[, <when>][, <reason>]`.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime};
use rollcall_api::AbsenceKind;
use rollcall_util::local_from_naive;

use crate::ClassifyError;

/// A parsed status report, before name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub kind: AbsenceKind,
    pub name: String,
    pub start: DateTime<Local>,
    pub end: Option<NaiveDate>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct When {
    from: NaiveDate,
    to: Option<NaiveDate>,
    time: Option<NaiveTime>,
}

fn parse_kind(raw: &str) -> Option<AbsenceKind> {
    let word = raw
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let kind = match word.as_str() {
        "지각" | "late" => AbsenceKind::Late,
        "조퇴" | "early_leave" | "early leave" | "earlyleave" => AbsenceKind::EarlyLeave,
        "외출" | "leave" => AbsenceKind::Leave,
        "휴가" | "vacation" => AbsenceKind::Vacation,
        "결석" | "병가" | "absence" | "sick" => AbsenceKind::Absence,
        _ => return None,
    };
    Some(kind)
}

const RELATIVE_DAYS: &[&str] = &["today", "오늘", "tomorrow", "내일"];

fn looks_temporal(part: &str) -> bool {
    let first = part.split_whitespace().next().unwrap_or("").to_lowercase();
    RELATIVE_DAYS.iter().any(|w| first.starts_with(w))
        || first.starts_with(|c: char| c.is_ascii_digit())
        || first.starts_with("오전")
        || first.starts_with("오후")
}

fn parse_day(token: &str, today: NaiveDate) -> Option<NaiveDate> {
    let token = token.trim().trim_end_matches('.');
    match token.to_lowercase().as_str() {
        "today" | "오늘" => return Some(today),
        "tomorrow" | "내일" => return today.checked_add_signed(Duration::days(1)),
        _ => {}
    }

    let numbers = |sep: char| -> Option<Vec<u32>> {
        token.split(sep).map(|p| p.trim().parse().ok()).collect()
    };

    if token.contains('-') {
        match numbers('-')?.as_slice() {
            [y, m, d] => NaiveDate::from_ymd_opt(*y as i32, *m, *d),
            _ => None,
        }
    } else if token.contains('.') {
        match numbers('.')?.as_slice() {
            [y, m, d] => NaiveDate::from_ymd_opt(*y as i32, *m, *d),
            _ => None,
        }
    } else if token.contains('/') {
        match numbers('/')?.as_slice() {
            [m, d] => NaiveDate::from_ymd_opt(today.year(), *m, *d),
            _ => None,
        }
    } else {
        None
    }
}

/// `HH:MM`, `H시`, `H시 M분`, `H시 반`, each optionally prefixed by 오전/오후
fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let (meridiem, rest) = if let Some(rest) = raw.strip_prefix("오전") {
        (Some(false), rest.trim())
    } else if let Some(rest) = raw.strip_prefix("오후") {
        (Some(true), rest.trim())
    } else {
        (None, raw)
    };

    let (hour, minute): (u32, u32) = if let Some((h, m)) = rest.split_once(':') {
        (h.trim().parse().ok()?, m.trim().parse().ok()?)
    } else if let Some((h, m)) = rest.split_once('시') {
        let hour = h.trim().parse().ok()?;
        let m = m.trim();
        let minute = if m.is_empty() {
            0
        } else if m == "반" {
            30
        } else {
            m.strip_suffix('분')?.trim().parse().ok()?
        };
        (hour, minute)
    } else {
        return None;
    };

    let hour = match meridiem {
        None => hour,
        Some(_) if hour == 0 || hour > 12 => return None,
        Some(true) if hour < 12 => hour + 12,
        Some(true) => hour,
        Some(false) if hour == 12 => 0,
        Some(false) => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_when(raw: &str, today: NaiveDate) -> Result<When, String> {
    // Allow spaces around the range separator
    let normalized = raw
        .split('~')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("~");
    let (first, rest) = match normalized.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (normalized.as_str(), ""),
    };

    let (from, to, time_part) = if let Some((a, b)) = first.split_once('~') {
        let from = parse_day(a, today).ok_or_else(|| format!("unrecognized date '{}'", a))?;
        let to = parse_day(b, today).ok_or_else(|| format!("unrecognized date '{}'", b))?;
        if to < from {
            return Err(format!("range {}~{} ends before it starts", a, b));
        }
        (from, Some(to), rest)
    } else if let Some(day) = parse_day(first, today) {
        (day, None, rest)
    } else {
        // No date: the whole text must be a time today
        (today, None, normalized.as_str())
    };

    let time = if time_part.is_empty() {
        None
    } else {
        Some(parse_clock(time_part).ok_or_else(|| format!("unrecognized time '{}'", time_part))?)
    };

    Ok(When { from, to, time })
}

/// Parse a status report received at `received_at`.
///
/// Returns `Ok(None)` for text that is not a status report at all.
pub fn parse_status_report(
    text: &str,
    received_at: DateTime<Local>,
) -> Result<Option<StatusReport>, ClassifyError> {
    let flattened = text.trim().replace('\n', ", ");
    let Some((kind_raw, rest)) = flattened.split_once('-') else {
        return Ok(None);
    };
    let Some(kind) = parse_kind(kind_raw) else {
        return Ok(None);
    };

    let invalid = |reason: String| ClassifyError::InvalidStatus {
        text: text.to_string(),
        reason,
    };

    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    let name = parts.first().copied().unwrap_or("").trim_matches('*').trim();
    if name.is_empty() {
        return Err(invalid("missing student name".into()));
    }

    let today = received_at.date_naive();
    let mut next = 1;
    let when = match parts.get(1) {
        Some(part) if looks_temporal(part) => {
            next = 2;
            Some(parse_when(part, today).map_err(invalid)?)
        }
        _ => None,
    };

    let reason = parts
        .get(next..)
        .map(|rest| rest.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join(", "))
        .filter(|r| !r.is_empty());

    let when = when.unwrap_or(When {
        from: today,
        to: None,
        time: None,
    });

    let start = match when.time {
        Some(time) => local_from_naive(when.from.and_time(time))
            .ok_or_else(|| invalid(format!("{} {} does not exist locally", when.from, time)))?,
        None if when.from == today => received_at,
        None => local_from_naive(when.from.and_time(NaiveTime::MIN))
            .ok_or_else(|| invalid(format!("midnight of {} does not exist locally", when.from)))?,
    };

    let end = match when.to {
        Some(to) => Some(to),
        None if kind.is_period_scoped() => Some(when.from),
        None => None,
    };

    Ok(Some(StatusReport {
        kind,
        name: name.to_string(),
        start,
        end,
        reason,
    }))
}
