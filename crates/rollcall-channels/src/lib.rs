//! Chat-platform adapters for rollcalld
//!
//! This crate provides:
//! - A Slack-style relay: paginated channel history and a polling live feed
//! - A Discord-style notifier: direct messages and an admin channel, with buttons
//! - The configured holiday calendar
//! - A placeholder notifier for setups without one

mod calendar;
mod discord;
mod http;
mod slack;
mod unconfigured;

pub use calendar::*;
pub use discord::*;
pub use slack::*;
pub use unconfigured::*;
