//! Protocol types for rollcalld
//!
//! This crate defines the vocabulary shared between the engine, the store,
//! the chat adapters, and IPC clients:
//! - Presence and absence types
//! - Commands (requests from clients) and responses
//! - Events (service -> dashboard clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
