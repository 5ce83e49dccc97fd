//! In-memory adapters for unit/integration testing

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::Event;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::{
    ChannelError, ChannelResult, EventBroadcaster, HistoryPage, HolidayCalendar, Notifier,
    OutboundAlert, RelayChannel, RelayMessage, RelaySource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay with scripted history, served in pages of `page_size`
pub struct MockRelay {
    history: Mutex<Vec<RelayMessage>>,
    page_size: usize,
    live_tx: mpsc::UnboundedSender<RelayMessage>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
    fetch_calls: Mutex<u32>,

    /// Number of upcoming history requests that fail with a transport error
    pub failures_remaining: Arc<Mutex<u32>>,
}

impl MockRelay {
    pub fn new(history: Vec<RelayMessage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            history: Mutex::new(history),
            page_size: 2,
            live_tx: tx,
            live_rx: Mutex::new(Some(rx)),
            fetch_calls: Mutex::new(0),
            failures_remaining: Arc::new(Mutex::new(0)),
        }
    }

    /// Fail the next `count` history requests
    pub fn fail_next(&self, count: u32) {
        *lock(&self.failures_remaining) = count;
    }

    /// Deliver a message on the live feed
    pub fn push_live(&self, message: RelayMessage) {
        let _ = self.live_tx.send(message);
    }

    pub fn fetch_calls(&self) -> u32 {
        *lock(&self.fetch_calls)
    }
}

#[async_trait]
impl RelaySource for MockRelay {
    async fn fetch_history(
        &self,
        channel: RelayChannel,
        oldest: DateTime<Local>,
        cursor: Option<String>,
    ) -> ChannelResult<HistoryPage> {
        *lock(&self.fetch_calls) += 1;

        {
            let mut failures = lock(&self.failures_remaining);
            if *failures > 0 {
                *failures -= 1;
                return Err(ChannelError::Transport("mock history failure".into()));
            }
        }

        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| ChannelError::Decode(format!("bad cursor {}", c)))?,
            None => 0,
        };

        let matching: Vec<RelayMessage> = lock(&self.history)
            .iter()
            .filter(|m| m.channel == channel && m.timestamp >= oldest)
            .cloned()
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let messages = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(HistoryPage {
            messages,
            next_cursor,
        })
    }

    fn subscribe(&self) -> ChannelResult<mpsc::UnboundedReceiver<RelayMessage>> {
        lock(&self.live_rx)
            .take()
            .ok_or(ChannelError::AlreadySubscribed)
    }

    fn channels(&self) -> Vec<RelayChannel> {
        vec![RelayChannel::Presence, RelayChannel::Status]
    }
}

/// Where a mock notifier delivered an alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Direct(String),
    Admin,
}

/// Notifier that records every delivery
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(Delivery, OutboundAlert)>>,

    /// Configure every send to fail
    pub fail_sends: Arc<Mutex<bool>>,
    fail_admin: Mutex<bool>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.fail_sends) = failing;
    }

    pub fn sent(&self) -> Vec<(Delivery, OutboundAlert)> {
        lock(&self.sent).clone()
    }

    /// Fail only the admin-channel sends, direct messages still go out
    pub fn set_admin_failing(&self, failing: bool) {
        *lock(&self.fail_admin) = failing;
    }

    fn record(&self, delivery: Delivery, alert: &OutboundAlert) -> ChannelResult<()> {
        let admin_down = delivery == Delivery::Admin && *lock(&self.fail_admin);
        if *lock(&self.fail_sends) || admin_down {
            return Err(ChannelError::Transport("mock send failure".into()));
        }
        lock(&self.sent).push((delivery, alert.clone()));
        Ok(())
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_direct(&self, contact_id: &str, alert: &OutboundAlert) -> ChannelResult<()> {
        self.record(Delivery::Direct(contact_id.to_string()), alert)
    }

    async fn send_admin(&self, alert: &OutboundAlert) -> ChannelResult<()> {
        self.record(Delivery::Admin, alert)
    }
}

/// Calendar excluding an explicit set of dates
#[derive(Debug, Default)]
pub struct FixedCalendar {
    excluded: Mutex<HashSet<NaiveDate>>,
}

impl FixedCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(&self, date: NaiveDate) {
        lock(&self.excluded).insert(date);
    }
}

impl HolidayCalendar for FixedCalendar {
    fn is_excluded(&self, date: NaiveDate) -> bool {
        lock(&self.excluded).contains(&date)
    }
}

/// Broadcaster that keeps every event
#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<Event>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }
}

impl EventBroadcaster for RecordingBroadcaster {
    fn broadcast(&self, event: Event) {
        lock(&self.events).push(event);
    }
}
