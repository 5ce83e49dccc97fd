//! Shared HTTP plumbing for the platform adapters

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use rollcall_channel_api::{ChannelError, ChannelResult};
use std::time::Duration;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

pub(crate) fn build_client(timeout: Duration) -> ChannelResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ChannelError::Internal(format!("failed to create HTTP client: {}", e)))
}

/// Bot tokens are read from the environment, never from the config file
pub(crate) fn read_token(env_var: &str) -> ChannelResult<String> {
    std::env::var(env_var)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ChannelError::NotConfigured(format!("environment variable {} is not set", env_var)))
}

pub(crate) fn transport(e: reqwest::Error) -> ChannelError {
    if e.is_decode() {
        ChannelError::Decode(e.to_string())
    } else {
        ChannelError::Transport(e.to_string())
    }
}

/// Map non-success statuses to errors, passing successful responses through
pub(crate) async fn check_status(response: Response) -> ChannelResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Err(ChannelError::RateLimited { retry_after });
    }

    let message = response.text().await.unwrap_or_default();
    Err(ChannelError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Seconds, possibly fractional
pub(crate) fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
