//! Routes decoded client envelopes into the state engine.
//!
//! Only `ADD_POINT` reaches the engine. Anything else is dropped without
//! complaint. The payload is handed over exactly as received; checking its
//! shape is the engine's job.

use conway_core::{MutationError, StateEngine};
use serde_json::Value;

use crate::protocol::{ClientMessage, Envelope};

/// What happened to one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    /// The engine accepted the mutation; carries the new state.
    Applied(Value),
    /// Not a mutation type; carries the envelope's `type`.
    Ignored(String),
    /// The engine refused the payload; its state is unchanged.
    Rejected(MutationError),
}

impl GatewayOutcome {
    /// The post-mutation state, if this outcome should be broadcast.
    pub fn applied_state(&self) -> Option<&Value> {
        match self {
            Self::Applied(state) => Some(state),
            Self::Ignored(_) | Self::Rejected(_) => None,
        }
    }
}

/// Forward one envelope to the engine.
pub fn submit<E: StateEngine>(engine: &mut E, envelope: Envelope) -> GatewayOutcome {
    let kind = envelope.kind.clone();
    match ClientMessage::from_envelope(envelope) {
        Some(ClientMessage::AddPoint(payload)) => match engine.apply_update(&payload) {
            Ok(state) => GatewayOutcome::Applied(state),
            Err(e) => {
                log::warn!("Mutation rejected by engine: {e}");
                GatewayOutcome::Rejected(e)
            }
        },
        None => {
            log::debug!("Ignoring message of type {kind:?}");
            GatewayOutcome::Ignored(kind)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    /// Records payloads; rejects anything carrying `"reject": true`.
    #[derive(Default)]
    struct RecordingEngine {
        applied: Vec<Value>,
    }

    impl StateEngine for RecordingEngine {
        fn state(&self) -> Value {
            json!({ "applied": self.applied.len() })
        }

        fn settings(&self) -> Value {
            Value::Null
        }

        fn apply_update(&mut self, payload: &Value) -> Result<Value, MutationError> {
            if payload.get("reject") == Some(&Value::Bool(true)) {
                return Err(MutationError::InvalidPayload("rejected".into()));
            }
            self.applied.push(payload.clone());
            Ok(self.state())
        }
    }

    #[test]
    fn test_add_point_is_applied() {
        let mut engine = RecordingEngine::default();
        let env = Envelope::new(MessageType::AddPoint, json!({ "x": 2, "y": 3 }));

        let outcome = submit(&mut engine, env);
        assert_eq!(outcome, GatewayOutcome::Applied(json!({ "applied": 1 })));
        assert_eq!(outcome.applied_state(), Some(&json!({ "applied": 1 })));
    }

    #[test]
    fn test_payload_forwarded_unchanged() {
        let mut engine = RecordingEngine::default();
        let payload = json!({ "x": 2, "y": 3, "extra": ["kept", { "as": "is" }] });
        submit(&mut engine, Envelope::new(MessageType::AddPoint, payload.clone()));
        assert_eq!(engine.applied, vec![payload]);
    }

    #[test]
    fn test_unknown_type_ignored() {
        let mut engine = RecordingEngine::default();
        let env = Envelope {
            kind: "REMOVE_POINT".into(),
            data: json!({ "x": 0, "y": 0 }),
        };
        let outcome = submit(&mut engine, env);
        assert_eq!(outcome, GatewayOutcome::Ignored("REMOVE_POINT".into()));
        assert_eq!(outcome.applied_state(), None);
        assert!(engine.applied.is_empty());
    }

    #[test]
    fn test_server_types_from_client_ignored() {
        let mut engine = RecordingEngine::default();
        let env = Envelope::new(MessageType::UpdateState, json!({}));
        assert!(matches!(submit(&mut engine, env), GatewayOutcome::Ignored(_)));
        assert!(engine.applied.is_empty());
    }

    #[test]
    fn test_engine_rejection_reported() {
        let mut engine = RecordingEngine::default();
        let env = Envelope::new(MessageType::AddPoint, json!({ "reject": true }));
        let outcome = submit(&mut engine, env);
        assert!(matches!(outcome, GatewayOutcome::Rejected(MutationError::InvalidPayload(_))));
        assert_eq!(engine.state(), json!({ "applied": 0 }));
    }
}
