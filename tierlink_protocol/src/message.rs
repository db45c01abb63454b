// Frames exchanged between a client and any relay tier.
//
// Two enums define the full frame vocabulary:
// - `ClientMessage`: client to relay (only operations).
// - `ServerMessage`: relay to client (operation responses and events).
//
// Operation arguments, response payloads, and event payloads are positional
// `Params` keyed by the constants in `codes::keys`. The frames themselves are
// serialized as JSON and length-prefixed by `framing.rs`.

use serde::{Deserialize, Serialize};

use crate::codes::{EventCode, OperationCode, return_code};
use crate::types::ActorId;
use crate::value::{Params, ParamsExt, Value};

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Operation(OperationRequest),
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Correlated answer to an operation, matched by code.
    Response(OperationResponse),
    /// Unsolicited notification.
    Event(EventData),
}

/// An operation request: code plus positional arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub code: OperationCode,
    pub params: Params,
}

impl OperationRequest {
    pub fn new(code: OperationCode) -> Self {
        Self {
            code,
            params: Params::new(),
        }
    }

    /// Builder-style insert of one positional argument.
    pub fn with(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.params.insert(key, value.into());
        self
    }

    /// Insert only when `value` is `Some`.
    pub fn with_opt(mut self, key: u8, value: Option<impl Into<Value>>) -> Self {
        if let Some(value) = value {
            self.params.insert(key, value.into());
        }
        self
    }
}

/// The backend's answer to an `OperationRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub code: OperationCode,
    /// Zero on success; see `codes::return_code`.
    pub return_code: i16,
    pub debug_message: Option<String>,
    pub params: Params,
}

impl OperationResponse {
    pub fn ok(code: OperationCode, params: Params) -> Self {
        Self {
            code,
            return_code: return_code::OK,
            debug_message: None,
            params,
        }
    }

    pub fn error(code: OperationCode, return_code: i16, message: impl Into<String>) -> Self {
        Self {
            code,
            return_code,
            debug_message: Some(message.into()),
            params: Params::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == return_code::OK
    }
}

static NULL: Value = Value::Null;

/// An event delivered to room members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub code: EventCode,
    pub params: Params,
}

impl EventData {
    /// The actor that caused the event, if the backend attached one.
    pub fn sender(&self) -> Option<ActorId> {
        self.params.actor(crate::codes::keys::ACTOR_NR)
    }

    /// The event payload (`keys::DATA`), `Null` when absent.
    pub fn data(&self) -> &Value {
        self.params.get(&crate::codes::keys::DATA).unwrap_or(&NULL)
    }
}
