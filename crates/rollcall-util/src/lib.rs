//! Shared utilities for rollcalld
//!
//! This crate provides:
//! - ID types (StudentId, AlertId, MessageId, ClientId)
//! - Wall-clock helpers (mock time, class windows, daily boundaries)
//! - Error types
//! - Default paths for config, socket, and data directories

mod error;
mod ids;
mod paths;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
