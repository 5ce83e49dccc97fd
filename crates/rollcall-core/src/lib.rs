//! Presence and notification engine for rollcalld
//!
//! This crate is the heart of rollcalld, containing:
//! - The classifier (relayed chat text -> typed presence events)
//! - The per-student presence state machine
//! - Camera-off escalation and the leave/return monitor
//! - The scheduler tick (windows, pending statuses, daily reset)
//! - Restart recovery from relay history

mod classifier;
mod delivery;
mod engine;
mod escalation;
mod events;
mod leave;
mod recovery;
mod roster;
mod scheduler;
mod status;
mod student;

pub use classifier::*;
pub use delivery::*;
pub use engine::*;
pub use escalation::*;
pub use events::*;
pub use leave::*;
pub use recovery::*;
pub use roster::*;
pub use scheduler::*;
pub use status::*;
pub use student::*;
