//! Discord-style notifier
//!
//! Direct messages go through a DM channel opened per recipient; admin alerts
//! are posted to a fixed channel. Interactive choices are rendered as buttons
//! whose `custom_id` carries the alert id, so the bridge that receives the
//! click can forward it as a `RespondToAlert` command.

use async_trait::async_trait;
use reqwest::Client;
use rollcall_api::AlertChoice;
use rollcall_channel_api::{ChannelError, ChannelResult, Notifier, OutboundAlert};
use rollcall_config::NotifierConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::http::{build_client, check_status, read_token, transport};

const ACTION_ROW: u8 = 1;
const BUTTON: u8 = 2;

#[derive(Debug, Deserialize)]
struct ChannelObject {
    id: String,
}

fn button_style(choice: AlertChoice) -> u8 {
    match choice {
        AlertChoice::Resumed => 3,
        AlertChoice::Away => 2,
        AlertChoice::MarkLeave | AlertChoice::RequestReturn => 1,
        AlertChoice::MarkEarlyLeave => 4,
    }
}

/// JSON body of a create-message request
pub fn message_body(alert: &OutboundAlert) -> Value {
    if alert.choices.is_empty() {
        return json!({ "content": alert.text });
    }

    let buttons: Vec<Value> = alert
        .choices
        .iter()
        .map(|choice| {
            json!({
                "type": BUTTON,
                "style": button_style(*choice),
                "label": choice.label(),
                "custom_id": choice.component_id(alert.alert_id),
            })
        })
        .collect();

    json!({
        "content": alert.text,
        "components": [{ "type": ACTION_ROW, "components": buttons }],
    })
}

pub struct DiscordNotifier {
    client: Client,
    api_base: String,
    token: String,
    admin_channel: String,
    /// contact id -> DM channel id
    dm_channels: RwLock<HashMap<String, String>>,
}

impl DiscordNotifier {
    pub fn new(config: &NotifierConfig) -> ChannelResult<Self> {
        Ok(Self {
            client: build_client(config.request_timeout)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: read_token(&config.token_env)?,
            admin_channel: config.admin_channel.clone(),
            dm_channels: RwLock::new(HashMap::new()),
        })
    }

    async fn dm_channel(&self, contact_id: &str) -> ChannelResult<String> {
        if let Some(id) = self.dm_channels.read().await.get(contact_id) {
            return Ok(id.clone());
        }

        let response = self
            .client
            .post(format!("{}/users/@me/channels", self.api_base))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&json!({ "recipient_id": contact_id }))
            .send()
            .await
            .map_err(transport)?;
        let channel: ChannelObject = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport)?;

        debug!(contact_id, channel_id = %channel.id, "Opened DM channel");
        self.dm_channels
            .write()
            .await
            .insert(contact_id.to_string(), channel.id.clone());
        Ok(channel.id)
    }

    async fn post(&self, channel_id: &str, alert: &OutboundAlert) -> ChannelResult<()> {
        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&message_body(alert))
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send_direct(&self, contact_id: &str, alert: &OutboundAlert) -> ChannelResult<()> {
        if contact_id.trim().is_empty() {
            return Err(ChannelError::MissingContact);
        }
        let channel_id = self.dm_channel(contact_id).await?;
        self.post(&channel_id, alert).await
    }

    async fn send_admin(&self, alert: &OutboundAlert) -> ChannelResult<()> {
        self.post(&self.admin_channel, alert).await
    }
}
