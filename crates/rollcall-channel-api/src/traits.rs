//! Adapter traits

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::Event;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{HistoryPage, OutboundAlert, RelayChannel};

/// Errors from chat-platform adapters
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Malformed platform response: {0}")]
    Decode(String),

    #[error("Student has no contact id")]
    MissingContact,

    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Live feed already taken")]
    AlreadySubscribed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Whether repeating the same request later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Transport(_) | ChannelError::RateLimited { .. } => true,
            ChannelError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Source of relayed chat messages
#[async_trait]
pub trait RelaySource: Send + Sync {
    /// Fetch one page of `channel` history starting at `oldest`
    async fn fetch_history(
        &self,
        channel: RelayChannel,
        oldest: DateTime<Local>,
        cursor: Option<String>,
    ) -> ChannelResult<HistoryPage>;

    /// Take the live feed; only one subscriber is supported
    fn subscribe(&self) -> ChannelResult<mpsc::UnboundedReceiver<crate::RelayMessage>>;

    /// Relay channels this source reads
    fn channels(&self) -> Vec<RelayChannel> {
        vec![RelayChannel::Presence]
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Outbound alert delivery
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Direct message to one student, keyed by their contact id
    async fn send_direct(&self, contact_id: &str, alert: &OutboundAlert) -> ChannelResult<()>;

    /// Post to the shared admin channel
    async fn send_admin(&self, alert: &OutboundAlert) -> ChannelResult<()>;
}

/// Days on which monitoring is skipped
pub trait HolidayCalendar: Send + Sync {
    fn is_excluded(&self, date: NaiveDate) -> bool;
}

/// Write-only push of state to dashboard clients
pub trait EventBroadcaster: Send + Sync {
    fn broadcast(&self, event: Event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(ChannelError::Transport("reset".into()).is_transient());
        assert!(ChannelError::Api { status: 502, message: "bad gateway".into() }.is_transient());
        assert!(!ChannelError::Api { status: 403, message: "missing scope".into() }.is_transient());
        assert!(!ChannelError::MissingContact.is_transient());
    }
}
