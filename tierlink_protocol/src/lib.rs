// tierlink_protocol — wire vocabulary for the tiered relay client.
//
// This crate defines the frames, codes, dynamic values, and framing used
// between a realtime client (`tierlink_client`) and the three relay tiers it
// talks to (name, master, game). It is shared by the client and by the
// loopback backend in `multiplayer_tests`, and has no client logic.
//
// Module overview:
// - `types.rs`:    Id newtypes (`ActorId`, `ViewId`) and `ServerTier`.
// - `codes.rs`:    Operation and event codes, positional parameter keys,
//                  return codes, caching directives, receiver groups, and
//                  well-known property names.
// - `value.rs`:    The dynamic `Value` type, `Params` / `Properties` maps,
//                  and the `ParamsExt` typed accessors.
// - `message.rs`:  `ClientMessage` / `ServerMessage` and the operation,
//                  response, and event frames they carry.
// - `framing.rs`:  4-byte big-endian length prefix plus JSON payload over any
//                  `Read`/`Write` stream.
//
// Design decisions:
// - **Positional fields.** Every frame carries a `u8`-keyed map rather than
//   named struct fields, so one decoder shape serves every operation and
//   optional arguments cost nothing when absent.
// - **JSON payloads.** Same serde_json path as the rest of the workspace;
//   the framing layer is format-agnostic if a binary codec is needed later.
// - **No async runtime.** Framing works on `std::io` streams, usable from the
//   blocking reader threads of the TCP transport.

pub mod codes;
pub mod framing;
pub mod message;
pub mod types;
pub mod value;

pub use codes::{
    CachingOption, EventCode, OperationCode, ReceiverGroup, join_mode, keys, props, return_code,
};
pub use framing::{MAX_FRAME_SIZE, read_frame, recv_json, send_json, write_frame};
pub use message::{ClientMessage, EventData, OperationRequest, OperationResponse, ServerMessage};
pub use types::{ActorId, MAX_VIEW_IDS, ServerTier, ViewId};
pub use value::{Params, ParamsExt, Properties, Value};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn join_response_survives_the_wire() {
        let mut params = Params::new();
        params.insert(keys::ACTOR_NR, Value::from(ActorId(2)));
        params.insert(
            keys::ACTOR_LIST,
            Value::Array(vec![Value::from(1), Value::from(2)]),
        );
        let mut room_props = Properties::new();
        room_props.insert(props::IS_OPEN.into(), Value::Bool(true));
        params.insert(keys::ROOM_PROPERTIES, Value::Map(room_props));
        let msg = ServerMessage::Response(OperationResponse::ok(OperationCode::JoinGame, params));

        let mut wire = Vec::new();
        send_json(&mut wire, &msg).unwrap();
        let back: ServerMessage = recv_json(&mut Cursor::new(wire)).unwrap();

        let ServerMessage::Response(resp) = back else {
            panic!("expected a response");
        };
        assert!(resp.is_ok());
        assert_eq!(resp.params.actor(keys::ACTOR_NR), Some(ActorId(2)));
        assert_eq!(resp.params.array(keys::ACTOR_LIST).map(<[Value]>::len), Some(2));
        assert_eq!(
            resp.params
                .map(keys::ROOM_PROPERTIES)
                .and_then(|p| p.get(props::IS_OPEN)),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn custom_event_codes_keep_their_number() {
        let event = EventData {
            code: EventCode::Custom(42),
            params: Params::from([(keys::ACTOR_NR, Value::from(3)), (keys::DATA, Value::from("hi"))]),
        };
        let json = serde_json::to_vec(&ServerMessage::Event(event.clone())).unwrap();
        let back: ServerMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, ServerMessage::Event(event));
    }

    #[test]
    fn event_accessors_default_sensibly() {
        let event = EventData {
            code: EventCode::Leave,
            params: Params::new(),
        };
        assert_eq!(event.sender(), None);
        assert!(event.data().is_null());
    }

    #[test]
    fn error_responses_are_not_ok() {
        let resp = OperationResponse::error(
            OperationCode::JoinRandomGame,
            return_code::NO_RANDOM_MATCH_FOUND,
            "no match",
        );
        assert!(!resp.is_ok());
        assert_eq!(resp.debug_message.as_deref(), Some("no match"));
    }
}
