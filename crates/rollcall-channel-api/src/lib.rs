//! Chat-platform adapter traits for rollcalld
//!
//! This crate defines the seams between the presence engine and the outside
//! world: where relayed messages come from, how alerts go out, which days are
//! excluded and where dashboard updates are pushed. It contains no network
//! code itself.

mod messages;
mod mock;
mod traits;

pub use messages::*;
pub use mock::*;
pub use traits::*;
