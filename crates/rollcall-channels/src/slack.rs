//! Slack-style relay source
//!
//! The classroom tool posts camera/join/leave notices into a channel on the
//! relay platform. History is read through `conversations.history`; the live
//! feed polls the same endpoint for messages newer than the last one seen.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::Client;
use rollcall_channel_api::{
    ChannelError, ChannelResult, HistoryPage, RelayChannel, RelayMessage, RelaySource,
};
use rollcall_config::RelayConfig;
use rollcall_util::MessageId;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::{build_client, check_status, read_token, transport};

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    text: String,
    user: Option<String>,
    username: Option<String>,
    bot_id: Option<String>,
    #[serde(default)]
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Deserialize)]
struct SlackAttachment {
    text: Option<String>,
    fallback: Option<String>,
}

/// Parse a Slack `ts` ("1697350000.000100") into a local instant
pub fn parse_ts(ts: &str) -> Option<DateTime<Local>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000).map(|dt| dt.with_timezone(&Local))
}

/// Inverse of [`parse_ts`]
pub fn format_ts(at: DateTime<Local>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

fn into_relay_message(
    channel: RelayChannel,
    channel_id: &str,
    raw: SlackMessage,
) -> Option<RelayMessage> {
    let timestamp = parse_ts(&raw.ts)?;

    // Some relay bots put the body in attachments only
    let text = if raw.text.trim().is_empty() {
        raw.attachments
            .iter()
            .filter_map(|a| a.text.as_deref().or(a.fallback.as_deref()))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        raw.text
    };
    if text.trim().is_empty() {
        return None;
    }

    Some(RelayMessage {
        id: MessageId::new(format!("{}:{}", channel_id, raw.ts)),
        channel,
        author: raw.user.or(raw.username).or(raw.bot_id),
        text,
        timestamp,
    })
}

fn decode_page(
    channel: RelayChannel,
    channel_id: &str,
    body: HistoryResponse,
) -> ChannelResult<HistoryPage> {
    if !body.ok {
        return Err(ChannelError::Api {
            status: 200,
            message: body.error.unwrap_or_else(|| "unknown error".into()),
        });
    }

    let mut messages: Vec<RelayMessage> = body
        .messages
        .into_iter()
        .filter_map(|m| into_relay_message(channel, channel_id, m))
        .collect();
    // The API returns newest first
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let next_cursor = body
        .response_metadata
        .and_then(|m| m.next_cursor)
        .filter(|c| !c.is_empty());

    Ok(HistoryPage {
        messages,
        next_cursor,
    })
}

/// Relay source reading a Slack-compatible Web API
pub struct SlackRelay {
    client: Client,
    api_base: String,
    token: String,
    presence_channel: String,
    status_channel: Option<String>,
    page_size: u32,
    poll_interval: Duration,
    live_tx: mpsc::UnboundedSender<RelayMessage>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
}

impl SlackRelay {
    pub fn new(config: &RelayConfig) -> ChannelResult<Self> {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client: build_client(config.request_timeout)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: read_token(&config.token_env)?,
            presence_channel: config.presence_channel.clone(),
            status_channel: config.status_channel.clone(),
            page_size: config.history_page_size,
            poll_interval: config.poll_interval,
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
        })
    }

    fn channel_id(&self, channel: RelayChannel) -> ChannelResult<&str> {
        match channel {
            RelayChannel::Presence => Ok(&self.presence_channel),
            RelayChannel::Status => self
                .status_channel
                .as_deref()
                .ok_or_else(|| ChannelError::NotConfigured("relay.status_channel".into())),
        }
    }

    async fn history_page(
        &self,
        channel: RelayChannel,
        oldest_ts: &str,
        inclusive: bool,
        cursor: Option<&str>,
    ) -> ChannelResult<HistoryPage> {
        let channel_id = self.channel_id(channel)?;
        let limit = self.page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("channel", channel_id),
            ("oldest", oldest_ts),
            ("limit", &limit),
            ("inclusive", if inclusive { "true" } else { "false" }),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let response = self
            .client
            .get(format!("{}/conversations.history", self.api_base))
            .header("Authorization", format!("Bearer {}", self.token))
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let body: HistoryResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport)?;

        decode_page(channel, channel_id, body)
    }

    /// Every message strictly after `after_ts`, oldest first
    async fn poll_channel(&self, channel: RelayChannel, after_ts: &str) -> ChannelResult<Vec<RelayMessage>> {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .history_page(channel, after_ts, false, cursor.as_deref())
                .await?;
            collected.extend(page.messages);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        collected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(collected)
    }

    /// Start polling for new messages posted after `since`
    ///
    /// Messages are delivered to the receiver returned by [`RelaySource::subscribe`].
    pub fn spawn_live_feed(
        self: &Arc<Self>,
        since: DateTime<Local>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let channels = relay.channels();
            let mut cursors: Vec<(RelayChannel, String)> =
                channels.into_iter().map(|c| (c, format_ts(since))).collect();

            let mut interval = tokio::time::interval(relay.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval = ?relay.poll_interval, "Relay live feed started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for (channel, last_ts) in cursors.iter_mut() {
                            match relay.poll_channel(*channel, last_ts).await {
                                Ok(messages) => {
                                    for message in messages {
                                        *last_ts = format_ts(message.timestamp);
                                        if relay.live_tx.send(message).is_err() {
                                            debug!("Live feed receiver dropped");
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(channel = ?channel, error = %e, "Relay poll failed, retrying next interval");
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Relay live feed shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RelaySource for SlackRelay {
    async fn fetch_history(
        &self,
        channel: RelayChannel,
        oldest: DateTime<Local>,
        cursor: Option<String>,
    ) -> ChannelResult<HistoryPage> {
        self.history_page(channel, &format_ts(oldest), true, cursor.as_deref())
            .await
    }

    fn subscribe(&self) -> ChannelResult<mpsc::UnboundedReceiver<RelayMessage>> {
        self.live_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ChannelError::AlreadySubscribed)
    }

    fn channels(&self) -> Vec<RelayChannel> {
        let mut channels = vec![RelayChannel::Presence];
        if self.status_channel.is_some() {
            channels.push(RelayChannel::Status);
        }
        channels
    }
}
