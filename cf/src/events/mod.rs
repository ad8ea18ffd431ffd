//! Status broadcast events
//!
//! Every status change in the control plane is emitted as a [`ForgeEvent`]
//! on the [`EventBus`]. The WebSocket edge that relays these to connected
//! UIs is an external collaborator; in-process consumers (tests, loggers)
//! subscribe directly.

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::ForgeEvent;
