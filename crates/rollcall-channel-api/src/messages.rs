//! Messages crossing the adapter boundary

use chrono::{DateTime, Local};
use rollcall_api::{AlertChoice, AlertKind, Audience};
use rollcall_util::{AlertId, MessageId, StudentId};
use serde::{Deserialize, Serialize};

/// Which relay channel a message was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayChannel {
    /// Camera/join/leave notices generated by the classroom tool
    Presence,
    /// Free-form status reports posted by staff
    Status,
}

/// One relayed chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: MessageId,
    pub channel: RelayChannel,
    pub author: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

/// One page of channel history, oldest first
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<RelayMessage>,
    /// Present when more pages follow
    pub next_cursor: Option<String>,
}

/// A fully rendered alert ready to hand to a notifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundAlert {
    pub alert_id: AlertId,
    pub student_id: StudentId,
    pub student_name: String,
    pub kind: AlertKind,
    pub stage: u32,
    pub audience: Audience,
    pub text: String,
    /// Interactive buttons; empty for plain notices
    pub choices: Vec<AlertChoice>,
}

impl OutboundAlert {
    /// `(component_id, label)` pairs for interactive buttons
    pub fn components(&self) -> Vec<(String, &'static str)> {
        self.choices
            .iter()
            .map(|choice| (choice.component_id(self.alert_id), choice.label()))
            .collect()
    }
}
