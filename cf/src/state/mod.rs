//! State management
//!
//! All store access flows through the [`StateManager`] actor: commands
//! arrive on a channel and are executed one at a time against the owned
//! [`forgestore::Store`], which is what makes the read-modify-write
//! operations (step-count increments, cost accumulation, terminal
//! settlement, commit counters) atomic.

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
