//! Local control socket for rollcalld
//!
//! Dashboards and admin tools talk to the daemon over a Unix socket using
//! newline-delimited JSON. Each peer is assigned a role from its uid: the
//! daemon's own user and root may change state, everyone else observes.
//! Subscribed clients receive every broadcast [`rollcall_api::Event`].

mod client;
mod server;

pub use client::*;
pub use server::*;

use rollcall_api::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server socket is not bound")]
    NotStarted,

    #[error("Expected response to request {expected}, got {got}")]
    UnexpectedResponse { expected: u64, got: u64 },

    #[error("Unexpected response payload: {0}")]
    UnexpectedPayload(String),

    #[error("Daemon rejected request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
}

pub type IpcResult<T> = Result<T, IpcError>;
