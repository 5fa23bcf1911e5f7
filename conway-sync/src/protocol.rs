//! JSON envelope protocol.
//!
//! Every frame is a text frame holding one envelope:
//! ```text
//! { "type": "<MESSAGE_TYPE>", "data": <any JSON> }
//! ```
//!
//! | Type           | Direction        | `data`                              |
//! |----------------|------------------|-------------------------------------|
//! | `INITIALIZE`   | server → client  | `{ state, settings, user }`         |
//! | `UPDATE_STATE` | server → all     | board state                         |
//! | `ADD_POINT`    | client → server  | engine-defined payload, e.g. `{x,y}` |
//!
//! Inbound envelopes with any other `type` decode fine and are ignored by the
//! gateway, so newer clients can talk to older servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::identity::Identity;

/// Message types known to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Snapshot + identity, sent once to a newly connected client
    Initialize,
    /// Full board state after every accepted change
    UpdateState,
    /// Client-proposed mutation
    AddPoint,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "INITIALIZE",
            Self::UpdateState => "UPDATE_STATE",
            Self::AddPoint => "ADD_POINT",
        }
    }

    /// Look up a wire name. Unknown names yield `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "INITIALIZE" => Some(Self::Initialize),
            "UPDATE_STATE" => Some(Self::UpdateState),
            "ADD_POINT" => Some(Self::AddPoint),
            _ => None,
        }
    }
}

/// The untyped wire unit. `type` is kept as a string so unknown types survive decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
        }
    }

    /// The recognized message type, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.kind)
    }

    /// Parse a raw text frame. Both `type` and `data` must be present.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Payload of `INITIALIZE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeData {
    pub state: Value,
    pub settings: Value,
    pub user: Identity,
}

/// Messages the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Initialize(InitializeData),
    UpdateState(Value),
}

impl ServerMessage {
    pub fn initialize(state: Value, settings: Value, user: Identity) -> Self {
        Self::Initialize(InitializeData {
            state,
            settings,
            user,
        })
    }

    pub fn update_state(state: Value) -> Self {
        Self::UpdateState(state)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Initialize(_) => MessageType::Initialize,
            Self::UpdateState(_) => MessageType::UpdateState,
        }
    }

    /// Serialize to the text frame body.
    ///
    /// Only fails for values serde_json cannot represent, which `Value`
    /// payloads never are.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Messages the server acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AddPoint(Value),
}

impl ClientMessage {
    /// Interpret an envelope. Unrecognized or server-only types yield `None`.
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        match envelope.message_type()? {
            MessageType::AddPoint => Some(Self::AddPoint(envelope.data)),
            MessageType::Initialize | MessageType::UpdateState => None,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Self::AddPoint(data) => Envelope::new(MessageType::AddPoint, data),
        }
    }
}
