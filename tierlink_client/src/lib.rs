// tierlink_client — realtime client for a tiered relay backend.
//
// The backend is split into three tiers reached one at a time: a name tier
// (discovery, region choice, first authentication), a master tier
// (matchmaking and lobbies), and a game tier (the room itself, which relays
// events between participants). This crate drives that hop sequence, keeps a
// local mirror of the room, and replicates object state and remote calls on
// top of the game tier's event relay. It never runs game logic; the host
// application supplies objects through `ObjectHost` and reacts to
// `Notification`s.
//
// Module overview:
// - `state.rs`:       Connection state machine as a pure transition table.
// - `peer.rs`:        `Peer`, the session object. Owns the transport, state,
//                     room, views, and notification bus; `service()` is the
//                     per-tick entry point. Further `impl Peer` blocks live
//                     in `responses.rs`, `events.rs`, `replication.rs`,
//                     `objects.rs`, and `ownership.rs`.
// - `operations.rs`:  Builders for every outgoing operation frame.
// - `room.rs`:        Room, roster, properties, and master election.
// - `view.rs`:        Replicated views and the view-id registry.
// - `rpc.rs`:         Per-view method tables with signature matching, RPC
//                     frames, and the shortcut table.
// - `sync.rs`:        Sync modes, tolerant comparison, delta compression,
//                     and the batch codec.
// - `lifecycle.rs`:   `ObjectHost` boundary and the instantiation payload.
// - `callbacks.rs`:   `Notification`s and the queued `EventBus`.
// - `transport.rs`:   `Transport` trait and the in-memory implementation.
// - `tcp.rs`:         `TcpTransport` with a reader thread per session.
// - `config.rs`:      `ClientConfig` (serde, JSON file friendly).
// - `error.rs`:       `ClientError`, backend return codes, dispatch faults.
//
// Everything runs on the thread that calls `Peer::service`; only the TCP
// reader thread runs elsewhere, and it talks to the peer through a channel.

pub mod callbacks;
pub mod config;
pub mod error;
mod events;
pub mod lifecycle;
pub mod objects;
pub mod operations;
mod ownership;
pub mod peer;
mod replication;
mod responses;
pub mod room;
pub mod rpc;
pub mod state;
pub mod sync;
pub mod tcp;
pub mod transport;
pub mod view;

pub use callbacks::{EventBus, FriendInfo, Listener, Notification, NotificationKind, Region};
pub use config::ClientConfig;
pub use error::{ClientError, DisconnectCause, DispatchFault, Result, ServerError};
pub use lifecycle::{InstantiateRequest, NullHost, ObjectHandle, ObjectHost, SpawnedObject, ViewSetup};
pub use objects::Spawn;
pub use operations::{RaiseEventOptions, RoomOptions};
pub use peer::Peer;
pub use room::{Player, Room};
pub use rpc::{ArgKind, MessageInfo, ParamSpec, RpcTable, RpcTarget};
pub use state::ClientState;
pub use sync::{Precision, SyncMode};
pub use tcp::TcpTransport;
pub use transport::{Delivery, MemoryRemote, MemoryTransport, StatusCode, Transport, WireAction};
pub use view::{Observed, OwnershipPolicy, View, ViewRegistry};
