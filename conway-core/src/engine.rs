//! The contract between the sync layer and whatever owns the board.
//!
//! The sync server never looks inside the values returned here. It only
//! serializes them into envelopes and forwards client payloads untouched.

use serde_json::Value;
use thiserror::Error;

/// Errors an engine reports when it refuses a client-proposed update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("invalid update payload: {0}")]
    InvalidPayload(String),
    #[error("cell ({x}, {y}) is outside the {width}x{height} board")]
    OutOfBounds {
        x: u64,
        y: u64,
        width: usize,
        height: usize,
    },
}

/// Authoritative shared state, driven by client updates and an optional clock.
///
/// Implementations must leave their state unchanged when `apply_update`
/// returns an error.
pub trait StateEngine: Send + 'static {
    /// Current snapshot of the whole state.
    fn state(&self) -> Value;

    /// Static engine settings sent to clients on connect.
    fn settings(&self) -> Value;

    /// Apply a client payload and return the new snapshot.
    fn apply_update(&mut self, payload: &Value) -> Result<Value, MutationError>;

    /// Advance one step of the engine's own clock.
    ///
    /// Returns the new snapshot, or `None` if the engine has no clock.
    fn tick(&mut self) -> Option<Value> {
        None
    }
}
