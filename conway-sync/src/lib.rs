//! # conway-sync: realtime shared board over WebSocket
//!
//! Keeps any number of clients converged on one authoritative board.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON envelopes   ┌──────────────────────────────┐
//! │ BoardClient │ ◄────────────────► │ SyncServer                   │
//! │ (per user)  │     WebSocket      │  Hub: StateEngine            │
//! └─────────────┘                    │       SessionRegistry        │
//!                                    │       BroadcastGroup         │
//!                                    └──────────────────────────────┘
//! ```
//!
//! A connection goes through identity extraction, receives an `INITIALIZE`
//! snapshot, and from then on every accepted `ADD_POINT` (or engine tick)
//! is broadcast as one `UPDATE_STATE` frame to every open session.
//!
//! ## Modules
//!
//! - [`identity`]: token extraction from the upgrade request, display colour
//! - [`protocol`]: `{type, data}` envelopes
//! - [`registry`]: open sessions, which are also the broadcast audience
//! - [`gateway`]: routes mutations into the engine
//! - [`broadcast`]: encode-once fan-out over the registry with bounded per-session buffering
//! - [`server`]: connection lifecycle and the shared hub
//! - [`client`]: headless client

pub mod broadcast;
pub mod client;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, Outbox, Subscriber};
pub use client::BoardClient;
pub use error::{IdentityError, MutationError, ProtocolError, SessionError, SyncError};
pub use gateway::GatewayOutcome;
pub use identity::{extract_identity, Identity};
pub use protocol::{ClientMessage, Envelope, InitializeData, MessageType, ServerMessage};
pub use registry::{ClientSession, LifecycleState, SessionRegistry};
pub use server::{Dispatch, Hub, OpenedSession, ServerConfig, ServerStats, SyncServer};
