// The client session.
//
// `Peer` owns everything one relay session needs: the transport, the
// connection state, cached tier addresses and the reconnection secret, the
// pending room entry, the room and roster, the view registry, and the
// notification bus. It is driven from one thread by calling `service()` once
// per tick:
//
//   1. drain the transport (`poll`), dispatching each status change,
//      operation response, and event in arrival order, and flushing queued
//      notifications to listeners after each one;
//   2. run the synchronization pass for views this client controls;
//   3. flush remaining notifications.
//
// Nothing blocks. Every request is "send now, resolve on a later response or
// event". Connection-state changes go through `apply(Input)`, which consults
// the pure table in `state.rs` and executes the returned effects here.
//
// The dispatch halves live in sibling modules as further `impl Peer` blocks:
// `responses.rs` (operation responses), `events.rs` (room events),
// `replication.rs` (RPC and sync), `objects.rs` (instantiate/destroy), and
// `ownership.rs`.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use log::{debug, error, info, warn};
use tierlink_protocol::{
    ActorId, ClientMessage, EventCode, OperationCode, OperationRequest, Properties,
    ServerMessage, ServerTier, Value, ViewId, join_mode, props,
};

use crate::callbacks::{EventBus, Listener, Notification, NotificationKind, Region};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result, ServerError};
use crate::lifecycle::{NullHost, ObjectHost};
use crate::operations::{self, EnterRoomParams, EntryKind, RaiseEventOptions, RoomOptions};
use crate::responses::entry_failed;
use crate::room::Room;
use crate::state::{self, ClientState, Context, Effect, Input};
use crate::sync::Precision;
use crate::transport::{Delivery, StatusCode, Transport, TransportEvent};
use crate::view::{View, ViewRegistry};

/// A create/join waiting to be (re)issued on the game tier.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PendingEntry {
    pub kind: EntryKind,
    pub params: EnterRoomParams,
    /// Already sent on the current game-tier session.
    pub issued: bool,
}

pub struct Peer<T: Transport> {
    pub(crate) config: ClientConfig,
    pub(crate) precision: Precision,
    pub(crate) transport: T,
    pub(crate) state: ClientState,
    pub(crate) tier: ServerTier,
    pub(crate) bus: EventBus,
    pub(crate) host: Box<dyn ObjectHost>,

    // Connection sequencing
    pub(crate) secret: Option<String>,
    pub(crate) did_authenticate: bool,
    pub(crate) initial_connect: bool,
    pub(crate) retries_left: u32,
    pub(crate) retry_tier: Option<ServerTier>,
    pub(crate) name_server_address: String,
    pub(crate) master_address: Option<String>,
    pub(crate) game_address: Option<String>,
    pub(crate) region: Option<String>,
    pub(crate) regions: Vec<Region>,
    pub(crate) deferred: VecDeque<Input>,

    // Room
    pub(crate) pending: Option<PendingEntry>,
    pub(crate) last_room: Option<String>,
    pub(crate) room: Option<Room>,
    pub(crate) local_actor: ActorId,
    pub(crate) local_properties: Properties,
    pub(crate) friend_query: Vec<String>,

    // Objects
    pub(crate) views: ViewRegistry,
    pub(crate) level_prefix: i16,
    pub(crate) receive_groups: BTreeSet<u8>,
    pub(crate) blocked_send_groups: BTreeSet<u8>,
    started: Instant,
}

impl<T: Transport> Peer<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        let mut local_properties = Properties::new();
        if !config.nick_name.is_empty() {
            local_properties.insert(props::NICK_NAME.into(), Value::from(config.nick_name.as_str()));
        }
        Self {
            precision: Precision::from(&config),
            transport,
            state: ClientState::PeerCreated,
            tier: ServerTier::NameServer,
            bus: EventBus::new(),
            host: Box::new(NullHost::default()),
            secret: None,
            did_authenticate: false,
            initial_connect: false,
            retries_left: config.max_reconnect_attempts,
            retry_tier: None,
            name_server_address: config.name_server_address.clone(),
            master_address: config.master_server_address.clone(),
            game_address: None,
            region: config.region.clone(),
            regions: Vec::new(),
            deferred: VecDeque::new(),
            pending: None,
            last_room: None,
            room: None,
            local_actor: ActorId::NONE,
            local_properties,
            friend_query: Vec::new(),
            views: ViewRegistry::new(),
            level_prefix: config.level_prefix,
            receive_groups: BTreeSet::new(),
            blocked_send_groups: BTreeSet::new(),
            started: Instant::now(),
            config,
        }
    }

    /// Replace the default `NullHost`.
    pub fn with_host(mut self, host: impl ObjectHost + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn tier(&self) -> ServerTier {
        self.tier
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_actor(&self) -> ActorId {
        self.local_actor
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn in_room(&self) -> bool {
        self.state == ClientState::Joined && self.room.is_some()
    }

    pub fn is_master_client(&self) -> bool {
        self.room.as_ref().is_some_and(Room::local_is_master)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Restore a secret persisted by the host, for `reconnect_to_master`.
    pub fn set_secret(&mut self, secret: Option<String>) {
        self.secret = secret;
    }

    pub fn master_address(&self) -> Option<&str> {
        self.master_address.as_deref()
    }

    pub fn game_address(&self) -> Option<&str> {
        self.game_address.as_deref()
    }

    pub fn level_prefix(&self) -> i16 {
        self.level_prefix
    }

    /// Views created after this call carry `prefix`; inbound RPCs and state
    /// for views with a different positive prefix are dropped.
    pub fn set_level_prefix(&mut self, prefix: i16) {
        self.level_prefix = prefix;
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.views.get(id)
    }

    pub fn view_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.views.get_mut(id)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn subscribe(&mut self, listener: impl Listener + 'static) {
        self.bus.subscribe(listener);
    }

    pub fn subscribe_to(&mut self, kinds: &[NotificationKind], listener: impl Listener + 'static) {
        self.bus.subscribe_to(kinds, listener);
    }

    /// Milliseconds since this peer was created; attached to RPCs, sync
    /// batches, and instantiations.
    pub fn server_timestamp(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Run one network update: dispatch everything received, then send
    /// state for the views this client controls.
    pub fn service(&mut self) {
        self.dispatch_incoming();
        self.send_view_updates();
        self.bus.flush();
    }

    /// Dispatch everything the transport delivered since the last call.
    /// Returns the number of transport items handled.
    pub fn dispatch_incoming(&mut self) -> usize {
        let events = self.transport.poll();
        let count = events.len();
        for event in events {
            match event {
                TransportEvent::Status(status) => self.on_status(status),
                TransportEvent::Message(ServerMessage::Response(response)) => {
                    self.on_response(response)
                }
                TransportEvent::Message(ServerMessage::Event(event)) => self.on_event(event),
            }
            self.drain_deferred();
            self.bus.flush();
        }
        self.drain_deferred();
        self.bus.flush();
        count
    }

    fn drain_deferred(&mut self) {
        while let Some(input) = self.deferred.pop_front() {
            self.apply(input);
        }
    }

    fn on_status(&mut self, status: StatusCode) {
        match status {
            StatusCode::Connected => info!("connected to {:?}", self.tier),
            StatusCode::EncryptionEstablished => debug!("encryption established"),
            StatusCode::EncryptionFailedToEstablish => {
                warn!("encryption failed on {:?}; continuing without it", self.tier)
            }
            StatusCode::Disconnected => debug!("transport to {:?} closed", self.tier),
            fault => warn!("transport fault on {:?}: {fault:?}", self.tier),
        }
        self.apply(Input::Status(status));
        if status == StatusCode::Connected {
            self.initial_connect = false;
        }
    }

    // -----------------------------------------------------------------------
    // State machine plumbing
    // -----------------------------------------------------------------------

    fn context(&self) -> Context {
        Context {
            tier: self.tier,
            secure: self.transport.is_secure(),
            has_secret: self.secret.is_some(),
            region_set: self.region.is_some(),
            did_authenticate: self.did_authenticate,
            auto_join_lobby: self.config.auto_join_lobby,
            initial_connect: self.initial_connect,
            retries_left: self.retries_left,
            retry_tier: self.retry_tier,
        }
    }

    pub(crate) fn apply(&mut self, input: Input) {
        debug!("{:?} <- {input:?}", self.state);
        let transition = state::step(self.state, &self.context(), input);
        self.set_state(transition.next);
        for effect in transition.effects {
            self.execute(effect);
        }
    }

    fn set_state(&mut self, next: ClientState) {
        if next == self.state {
            return;
        }
        debug!("state {:?} -> {next:?}", self.state);
        let from = self.state;
        self.state = next;
        self.bus.emit(Notification::StateChanged { from, to: next });
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport(tier) => self.open_transport(tier),
            Effect::CloseTransport => self.transport.close(),
            Effect::EstablishEncryption => {
                if let Err(e) = self.transport.establish_encryption() {
                    warn!("cannot start key exchange: {e}");
                    self.deferred
                        .push_back(Input::Status(StatusCode::EncryptionFailedToEstablish));
                }
            }
            Effect::Authenticate => self.send_authenticate(),
            Effect::RequestRegions => {
                let op = operations::get_regions(&self.config.app_id);
                self.send_logged(op);
            }
            Effect::JoinLobby => {
                let op = operations::join_lobby(self.config.lobby_name.as_deref());
                self.send_logged(op);
            }
            Effect::ReissueRoomEntry => self.reissue_room_entry(),
            Effect::AbandonRoomEntry => self.abandon_room_entry(
                ServerError::OperationNotAllowed,
                "connection closed before the room was entered",
            ),
            Effect::InvalidateSecret => {
                if self.secret.take().is_some() {
                    debug!("reconnection secret invalidated");
                }
            }
            Effect::ScheduleRetry(tier) => {
                self.retries_left = self.retries_left.saturating_sub(1);
                self.retry_tier = Some(tier);
                info!(
                    "retrying {tier:?} after disconnect ({} attempt(s) left)",
                    self.retries_left
                );
            }
            Effect::CancelRetry => {
                if let Some(tier) = self.retry_tier.take() {
                    info!("retry of {tier:?} cancelled by disconnect");
                }
            }
            Effect::ResetRetries => self.retries_left = self.config.max_reconnect_attempts,
            Effect::LeftGameServer => self.left_game_server(),
            Effect::Notify(notification) => self.bus.emit(notification),
        }
    }

    fn open_transport(&mut self, tier: ServerTier) {
        self.tier = tier;
        self.retry_tier = None;
        self.did_authenticate = false;
        if tier == ServerTier::GameServer
            && let Some(pending) = self.pending.as_mut()
        {
            pending.issued = false;
        }
        let address = match tier {
            ServerTier::NameServer => Some(self.name_server_address.clone()),
            ServerTier::MasterServer => self.master_address.clone(),
            ServerTier::GameServer => self.game_address.clone(),
        };
        let opened = match address {
            Some(address) => {
                debug!("opening {tier:?} at {address}");
                self.transport.open(&address).map_err(ClientError::from)
            }
            None => Err(ClientError::MissingAddress(tier_name(tier))),
        };
        if let Err(e) = opened {
            error!("cannot connect to {tier:?}: {e}");
            // Nothing was opened, so no transport will report the close.
            self.deferred
                .push_back(Input::Status(StatusCode::ExceptionOnConnect));
            self.deferred.push_back(Input::Status(StatusCode::Disconnected));
        }
    }

    fn send_authenticate(&mut self) {
        let on_name_tier = self.tier == ServerTier::NameServer;
        let op = operations::authenticate(
            &self.config.app_id,
            &self.config.app_version,
            self.config.user_id.as_deref(),
            &self.config.nick_name,
            self.region.as_deref().filter(|_| on_name_tier),
            self.secret.as_deref().filter(|_| !on_name_tier),
        );
        self.did_authenticate = true;
        self.send_logged(op);
    }

    fn reissue_room_entry(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            warn!("authenticated on the game tier with no room entry pending");
            return;
        };
        if pending.issued {
            debug!("{:?} already sent on this session", pending.kind);
            return;
        }
        pending.issued = true;
        let op = operations::enter_room(
            pending.kind,
            &pending.params,
            ServerTier::GameServer,
            &self.local_properties,
        );
        self.send_logged(op);
    }

    /// Drop the create/join in flight, if any, and report it as failed.
    pub(crate) fn abandon_room_entry(&mut self, err: ServerError, reason: &str) {
        if let Some(pending) = self.pending.take() {
            warn!("{:?} abandoned: {reason}", pending.kind);
            self.bus.emit(entry_failed(pending.kind, err, reason.to_owned()));
        }
    }

    /// Tear down room state after the game-tier session ended.
    fn left_game_server(&mut self) {
        if let Some(room) = self.room.take() {
            info!("left room {}", room.name);
            if room.auto_cleanup {
                self.destroy_all_instantiated();
            }
            for view in self.views.iter_mut() {
                view.state = Default::default();
            }
            self.bus.emit(Notification::LeftRoom);
        }
        self.local_actor = ActorId::NONE;
        self.receive_groups.clear();
    }

    pub(crate) fn send_op(&mut self, op: OperationRequest) -> Result<()> {
        debug!("-> {:?} on {:?}", op.code, self.tier);
        self.transport
            .send(&ClientMessage::Operation(op), Delivery::Reliable)?;
        Ok(())
    }

    fn send_logged(&mut self, op: OperationRequest) {
        let code = op.code;
        if let Err(e) = self.send_op(op) {
            error!("failed to send {code:?}: {e}");
        }
    }

    /// Raise an event in the current room.
    pub(crate) fn send_event(
        &mut self,
        code: EventCode,
        data: Value,
        options: &RaiseEventOptions,
        delivery: Delivery,
    ) -> Result<()> {
        if self.room.is_none() {
            return Err(ClientError::NotInRoom);
        }
        let op = operations::raise_event(code, data, options);
        self.transport.send(&ClientMessage::Operation(op), delivery)?;
        Ok(())
    }

    fn require(&self, op: OperationCode, allowed: bool) -> Result<()> {
        if self.state.is_disconnecting() {
            return Err(ClientError::Busy);
        }
        if !allowed {
            return Err(ClientError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn require_room(&self) -> Result<&Room> {
        match self.room.as_ref() {
            Some(room) if self.state == ClientState::Joined => Ok(room),
            _ => Err(ClientError::NotInRoom),
        }
    }

    // -----------------------------------------------------------------------
    // Connection API
    // -----------------------------------------------------------------------

    /// Connect as configured: through the name tier (and region choice) or
    /// straight to the master tier.
    pub fn connect_using_settings(&mut self) -> Result<()> {
        self.config.validate()?;
        if self.config.use_name_server {
            let address = self.config.name_server_address.clone();
            self.connect(&address, ServerTier::NameServer)
        } else {
            let address = self
                .config
                .master_server_address
                .clone()
                .ok_or(ClientError::MissingAddress("master tier"))?;
            self.connect(&address, ServerTier::MasterServer)
        }
    }

    /// Open a session with `tier` at `address`. Fails with `Busy` while a
    /// disconnect is still in flight.
    pub fn connect(&mut self, address: &str, tier: ServerTier) -> Result<()> {
        if self.state.is_disconnecting() {
            return Err(ClientError::Busy);
        }
        if !matches!(self.state, ClientState::PeerCreated | ClientState::Disconnected) {
            return Err(ClientError::InvalidState {
                op: OperationCode::Authenticate,
                state: self.state,
            });
        }
        match tier {
            ServerTier::NameServer => self.name_server_address = address.to_owned(),
            ServerTier::MasterServer => self.master_address = Some(address.to_owned()),
            ServerTier::GameServer => self.game_address = Some(address.to_owned()),
        }
        self.initial_connect = true;
        self.retries_left = self.config.max_reconnect_attempts;
        self.retry_tier = None;
        self.apply(Input::Connect(tier));
        Ok(())
    }

    /// Choose a region after `RegionListReceived`.
    pub fn select_region(&mut self, code: &str) -> Result<()> {
        self.require(
            OperationCode::Authenticate,
            self.state == ClientState::ConnectedToNameServer,
        )?;
        self.region = Some(code.to_owned());
        self.apply(Input::RegionSelected);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.apply(Input::DisconnectRequested);
    }

    /// Reconnect to the last master tier, replaying the cached secret.
    pub fn reconnect_to_master(&mut self) -> Result<()> {
        let address = self
            .master_address
            .clone()
            .ok_or(ClientError::MissingAddress("master tier"))?;
        self.connect(&address, ServerTier::MasterServer)
    }

    /// Reconnect to the last game tier and rejoin the last room.
    pub fn reconnect_and_rejoin(&mut self) -> Result<()> {
        let address = self
            .game_address
            .clone()
            .ok_or(ClientError::MissingAddress("game tier"))?;
        let room = self.last_room.clone().ok_or(ClientError::NotInRoom)?;
        if self.state.is_disconnecting() {
            return Err(ClientError::Busy);
        }
        let previous = self.pending.replace(PendingEntry {
            kind: EntryKind::Join,
            params: EnterRoomParams {
                room_name: Some(room),
                join_mode: join_mode::REJOIN,
                ..Default::default()
            },
            issued: false,
        });
        let connected = self.connect(&address, ServerTier::GameServer);
        if connected.is_err() {
            self.pending = previous;
        }
        connected
    }

    // -----------------------------------------------------------------------
    // Lobby and matchmaking
    // -----------------------------------------------------------------------

    pub fn join_lobby(&mut self) -> Result<()> {
        self.require(OperationCode::JoinLobby, self.state.is_on_master())?;
        self.send_op(operations::join_lobby(self.config.lobby_name.as_deref()))
    }

    pub fn leave_lobby(&mut self) -> Result<()> {
        self.require(
            OperationCode::LeaveLobby,
            self.state == ClientState::JoinedLobby,
        )?;
        self.send_op(operations::leave_lobby())
    }

    /// Create a room. `None` lets the backend pick the name.
    pub fn create_room(&mut self, name: Option<&str>, options: RoomOptions) -> Result<()> {
        self.enter_room(
            EntryKind::Create,
            EnterRoomParams {
                room_name: name.map(str::to_owned),
                options,
                ..Default::default()
            },
        )
    }

    pub fn join_room(&mut self, name: &str) -> Result<()> {
        self.enter_room(
            EntryKind::Join,
            EnterRoomParams {
                room_name: Some(name.to_owned()),
                ..Default::default()
            },
        )
    }

    pub fn join_or_create_room(&mut self, name: &str, options: RoomOptions) -> Result<()> {
        self.enter_room(
            EntryKind::Join,
            EnterRoomParams {
                room_name: Some(name.to_owned()),
                options,
                join_mode: join_mode::CREATE_IF_NOT_EXISTS,
                ..Default::default()
            },
        )
    }

    /// Return to a room this user is still an inactive member of.
    pub fn rejoin_room(&mut self, name: &str) -> Result<()> {
        self.enter_room(
            EntryKind::Join,
            EnterRoomParams {
                room_name: Some(name.to_owned()),
                join_mode: join_mode::REJOIN,
                ..Default::default()
            },
        )
    }

    /// Join any open room whose properties include `expected` (and whose
    /// player limit equals `max_players`, unless 0).
    pub fn join_random_room(&mut self, expected: Properties, max_players: u8) -> Result<()> {
        self.enter_room(
            EntryKind::JoinRandom,
            EnterRoomParams {
                expected_properties: expected,
                expected_max_players: max_players,
                ..Default::default()
            },
        )
    }

    fn enter_room(&mut self, kind: EntryKind, mut params: EnterRoomParams) -> Result<()> {
        self.require(
            kind.code(),
            self.state.is_on_master() && self.pending.is_none(),
        )?;
        if params.lobby.is_none() {
            params.lobby = self.config.lobby_name.clone();
        }
        let op = operations::enter_room(
            kind,
            &params,
            ServerTier::MasterServer,
            &self.local_properties,
        );
        self.send_op(op)?;
        self.pending = Some(PendingEntry {
            kind,
            params,
            issued: false,
        });
        Ok(())
    }

    /// Leave the room and return to the master tier. With `will_come_back`
    /// the backend keeps this player as inactive (if the room allows it).
    pub fn leave_room(&mut self, will_come_back: bool) -> Result<()> {
        self.require(OperationCode::Leave, self.state == ClientState::Joined)?;
        self.send_op(operations::leave(will_come_back))?;
        self.apply(Input::LeaveRequested);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    /// Set room properties. With `expected`, the backend applies them only if
    /// the current values match, and confirms through a change event.
    pub fn set_room_properties(
        &mut self,
        properties: Properties,
        expected: Option<Properties>,
    ) -> Result<()> {
        self.require_room()?;
        self.send_op(operations::set_properties(
            ActorId(0),
            &properties,
            expected.as_ref(),
        ))?;
        if expected.is_none() {
            self.apply_room_properties(&properties);
        }
        Ok(())
    }

    /// Set properties of a room member. Outside a room this only updates the
    /// local player's properties, which are sent on the next room entry.
    pub fn set_player_properties(
        &mut self,
        actor: ActorId,
        properties: Properties,
        expected: Option<Properties>,
    ) -> Result<()> {
        if self.room.is_none() {
            if actor != self.local_actor && actor != ActorId::NONE {
                return Err(ClientError::NotInRoom);
            }
            for (key, value) in properties {
                if value.is_null() {
                    self.local_properties.remove(&key);
                } else {
                    self.local_properties.insert(key, value);
                }
            }
            return Ok(());
        }
        let room = self.require_room()?;
        if !room.contains(actor) {
            return Err(ClientError::UnknownActor(actor));
        }
        self.send_op(operations::set_properties(actor, &properties, expected.as_ref()))?;
        if expected.is_none() {
            self.apply_player_properties(actor, &properties);
        }
        Ok(())
    }

    pub fn get_properties(&mut self) -> Result<()> {
        self.require_room()?;
        self.send_op(operations::get_properties())
    }

    pub(crate) fn apply_room_properties(&mut self, changed: &Properties) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(change) = room.merge_properties(changed)
            && change.previous.is_assigned()
        {
            self.bus.emit(Notification::MasterSwitched {
                previous: change.previous,
                current: change.current,
            });
        }
        self.bus
            .emit(Notification::RoomPropertiesChanged(changed.clone()));
    }

    pub(crate) fn apply_player_properties(&mut self, actor: ActorId, changed: &Properties) {
        if actor == self.local_actor {
            for (key, value) in changed {
                if value.is_null() {
                    self.local_properties.remove(key);
                } else {
                    self.local_properties.insert(key.clone(), value.clone());
                }
            }
        }
        let Some(player) = self.room.as_mut().and_then(|r| r.player_mut(actor)) else {
            debug!("properties for unknown actor {actor:?}");
            return;
        };
        player.merge_properties(changed);
        self.bus.emit(Notification::PlayerPropertiesChanged {
            actor,
            changed: changed.clone(),
        });
    }

    // -----------------------------------------------------------------------
    // Events, groups, master client, misc operations
    // -----------------------------------------------------------------------

    /// Raise an application event in the current room.
    pub fn raise_event(
        &mut self,
        code: u8,
        data: Value,
        options: &RaiseEventOptions,
        delivery: Delivery,
    ) -> Result<()> {
        self.require_room()?;
        self.send_event(EventCode::Custom(code), data, options, delivery)
    }

    /// Change interest-group subscriptions. `Some(&[])` means all groups.
    /// Views in groups this client left are no longer updated on receipt.
    pub fn set_interest_groups(&mut self, remove: Option<&[u8]>, add: Option<&[u8]>) -> Result<()> {
        self.require_room()?;
        self.send_op(operations::change_groups(remove, add))?;
        match remove {
            Some([]) => self.receive_groups.clear(),
            Some(groups) => {
                for group in groups {
                    self.receive_groups.remove(group);
                }
            }
            None => {}
        }
        match add {
            Some([]) => self.receive_groups.extend(1..=u8::MAX),
            Some(groups) => self.receive_groups.extend(groups.iter().copied()),
            None => {}
        }
        Ok(())
    }

    /// Block or unblock sending of sync updates and RPCs for one group.
    pub fn set_send_group_enabled(&mut self, group: u8, enabled: bool) {
        if enabled {
            self.blocked_send_groups.remove(&group);
        } else {
            self.blocked_send_groups.insert(group);
        }
    }

    /// Hand the master role to another member. Only the master may do this.
    pub fn set_master_client(&mut self, actor: ActorId) -> Result<()> {
        let room = self.require_room()?;
        if !room.local_is_master() {
            return Err(ClientError::NotMasterClient);
        }
        if !room.contains(actor) {
            return Err(ClientError::UnknownActor(actor));
        }
        if room.server_side_master {
            let current = room.master_client_id;
            let key = props::MASTER_CLIENT_ID.to_string();
            return self.set_room_properties(
                Properties::from([(key.clone(), Value::from(actor))]),
                Some(Properties::from([(key, Value::from(current))])),
            );
        }
        let data = Value::Table([(1, Value::from(actor))].into());
        self.send_event(
            EventCode::AssignMaster,
            data,
            &RaiseEventOptions::default(),
            Delivery::Reliable,
        )?;
        self.switch_master(actor);
        Ok(())
    }

    pub(crate) fn switch_master(&mut self, actor: ActorId) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(change) = room.set_master(actor) {
            self.bus.emit(Notification::MasterSwitched {
                previous: change.previous,
                current: change.current,
            });
        }
    }

    /// Ask `actor` to leave the room. Only the master may do this.
    pub fn close_connection(&mut self, actor: ActorId) -> Result<()> {
        let room = self.require_room()?;
        if !room.local_is_master() {
            return Err(ClientError::NotMasterClient);
        }
        let options = RaiseEventOptions {
            target_actors: vec![actor],
            ..Default::default()
        };
        self.send_event(
            EventCode::CloseConnection,
            Value::Null,
            &options,
            Delivery::Reliable,
        )
    }

    /// Ask the master tier which of `user_ids` are online and where.
    pub fn find_friends(&mut self, user_ids: Vec<String>) -> Result<()> {
        self.require(OperationCode::FindFriends, self.state.is_on_master())?;
        self.send_op(operations::find_friends(&user_ids))?;
        self.friend_query = user_ids;
        Ok(())
    }

    /// Call a backend web hook. Answered by `WebRpcResponse`.
    pub fn web_rpc(&mut self, path: &str, parameters: Value) -> Result<()> {
        self.require(
            OperationCode::WebRpc,
            self.state.is_on_master() || self.state == ClientState::Joined,
        )?;
        self.send_op(operations::web_rpc(path, parameters))
    }
}

fn tier_name(tier: ServerTier) -> &'static str {
    match tier {
        ServerTier::NameServer => "name tier",
        ServerTier::MasterServer => "master tier",
        ServerTier::GameServer => "game tier",
    }
}


#[cfg(test)]
mod tests {
    use tierlink_protocol::{OperationResponse, Params, ParamsExt, keys, return_code};

    use super::testing::{drain_notifications, joined_peer, recorder};
    use super::*;
    use crate::error::DisconnectCause;
    use crate::transport::{MemoryRemote, MemoryTransport, WireAction};

    fn ok(code: OperationCode, params: Params) -> OperationResponse {
        OperationResponse::ok(code, params)
    }

    fn fresh(config: ClientConfig) -> (Peer<MemoryTransport>, MemoryRemote) {
        let (transport, remote) = MemoryTransport::pair();
        (Peer::new(config, transport), remote)
    }

    fn config() -> ClientConfig {
        ClientConfig {
            app_id: "demo".into(),
            name_server_address: "name:1".into(),
            region: Some("eu".into()),
            ..Default::default()
        }
    }

    #[test]
    fn name_tier_hands_over_to_the_master_and_lobby() {
        let (mut peer, remote) = fresh(config());
        peer.connect_using_settings().unwrap();
        assert_eq!(peer.state(), ClientState::ConnectingToNameServer);
        assert_eq!(remote.drain(), vec![WireAction::Opened("name:1".into())]);

        remote.push_status(StatusCode::Connected);
        peer.service();
        assert_eq!(remote.drain(), vec![WireAction::EncryptionRequested]);

        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToNameServer);
        let auth = remote.sent_operations();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].params.string(keys::REGION), Some("eu"));

        remote.push_response(ok(
            OperationCode::Authenticate,
            Params::from([(keys::ADDRESS, Value::from("master:1"))]),
        ));
        peer.service();
        // Close and reopen happen across two polls.
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectingToMasterServer);
        assert_eq!(peer.master_address(), Some("master:1"));
        assert_eq!(
            remote.drain(),
            vec![WireAction::Closed, WireAction::Opened("master:1".into())]
        );

        remote.push_status(StatusCode::Connected);
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        assert_eq!(peer.state(), ClientState::Authenticating);
        assert_eq!(remote.sent_codes(), vec![OperationCode::Authenticate]);

        remote.push_response(ok(
            OperationCode::Authenticate,
            Params::from([(keys::SECRET, Value::from("s1"))]),
        ));
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToMaster);
        assert_eq!(peer.secret(), Some("s1"));
        assert_eq!(remote.sent_codes(), vec![OperationCode::JoinLobby]);

        remote.push_response(ok(OperationCode::JoinLobby, Params::new()));
        peer.service();
        assert_eq!(peer.state(), ClientState::JoinedLobby);
    }

    #[test]
    fn without_a_region_the_name_tier_waits_for_a_choice() {
        let (mut peer, remote) = fresh(ClientConfig {
            region: None,
            ..config()
        });
        let seen = recorder(&mut peer);
        peer.connect_using_settings().unwrap();
        remote.push_status(StatusCode::Connected);
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        assert_eq!(remote.sent_codes(), vec![OperationCode::GetRegions]);

        remote.push_response(ok(
            OperationCode::GetRegions,
            Params::from([
                (keys::REGION_CODES, Value::Array(vec![Value::from("eu"), Value::from("us")])),
                (
                    keys::REGION_ADDRESSES,
                    Value::Array(vec![Value::from("eu:1"), Value::from("us:1")]),
                ),
            ]),
        ));
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToNameServer);
        assert_eq!(peer.regions().len(), 2);
        assert!(matches!(
            seen.borrow().as_slice(),
            [Notification::RegionListReceived(regions)] if regions.len() == 2
        ));

        peer.select_region("us").unwrap();
        let auth = remote.sent_operations();
        assert_eq!(auth[0].code, OperationCode::Authenticate);
        assert_eq!(auth[0].params.string(keys::REGION), Some("us"));
    }

    #[test]
    fn connect_is_refused_while_disconnecting() {
        let (mut peer, _remote) = fresh(config());
        peer.state = ClientState::DisconnectingFromMasterServer;
        match peer.connect("name:1", ServerTier::NameServer) {
            Err(ClientError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        peer.state = ClientState::JoinedLobby;
        match peer.connect("name:1", ServerTier::NameServer) {
            Err(ClientError::InvalidState { state, .. }) => {
                assert_eq!(state, ClientState::JoinedLobby)
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn unreachable_tier_exhausts_retries_then_fails() {
        let (mut peer, remote) = fresh(config());
        drop(remote);
        let seen = recorder(&mut peer);
        peer.connect_using_settings().unwrap();
        peer.service();
        assert_eq!(peer.state(), ClientState::Disconnected);
        assert_eq!(
            *seen.borrow(),
            vec![
                Notification::FailedToConnect(DisconnectCause::ExceptionOnConnect),
                Notification::Disconnected,
            ]
        );
    }

    #[test]
    fn timeout_while_authenticating_retries_the_same_tier() {
        let (mut peer, remote) = fresh(ClientConfig {
            use_name_server: false,
            master_server_address: Some("master:1".into()),
            ..config()
        });
        peer.connect_using_settings().unwrap();
        remote.push_status(StatusCode::Connected);
        peer.service();
        assert_eq!(peer.state(), ClientState::Authenticating);

        remote.push_status(StatusCode::TimeoutDisconnect);
        peer.service();
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectingToMasterServer);
        let opened: Vec<_> = remote
            .drain()
            .into_iter()
            .filter(|a| matches!(a, WireAction::Opened(_)))
            .collect();
        assert_eq!(opened.len(), 2);
    }

    #[test]
    fn room_entry_is_reissued_once_on_the_game_tier() {
        let (mut peer, remote) = fresh(ClientConfig {
            use_name_server: false,
            master_server_address: Some("master:1".into()),
            auto_join_lobby: false,
            ..config()
        });
        peer.connect_using_settings().unwrap();
        remote.push_status(StatusCode::Connected);
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        remote.push_response(ok(
            OperationCode::Authenticate,
            Params::from([(keys::SECRET, Value::from("s1"))]),
        ));
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToMaster);
        remote.drain();

        peer.create_room(Some("R1"), RoomOptions::default()).unwrap();
        match peer.create_room(Some("R2"), RoomOptions::default()) {
            Err(ClientError::InvalidState { .. }) => {}
            other => panic!("expected InvalidState for a second entry, got {other:?}"),
        }
        remote.push_response(ok(
            OperationCode::CreateGame,
            Params::from([
                (keys::ADDRESS, Value::from("game:1")),
                (keys::ROOM_NAME, Value::from("R1")),
            ]),
        ));
        peer.service();
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectingToGameServer);

        // The cached secret lets authenticate skip the key exchange.
        remote.push_status(StatusCode::Connected);
        peer.service();
        remote.drain();
        remote.push_response(ok(OperationCode::Authenticate, Params::new()));
        remote.push_response(ok(OperationCode::Authenticate, Params::new()));
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        let creates: Vec<_> = remote
            .sent_operations()
            .into_iter()
            .filter(|op| op.code == OperationCode::CreateGame)
            .collect();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].params.string(keys::ROOM_NAME), Some("R1"));
        assert!(creates[0].params.contains_key(&keys::ROOM_PROPERTIES));

        remote.push_response(ok(
            OperationCode::CreateGame,
            Params::from([
                (keys::ACTOR_NR, Value::from(1)),
                (keys::ACTOR_LIST, Value::Array(vec![Value::from(1)])),
            ]),
        ));
        peer.service();
        assert_eq!(peer.state(), ClientState::Joined);
        let room = peer.room().unwrap();
        assert_eq!(room.name, "R1");
        assert_eq!(room.player_count(), 1);
        assert_eq!(room.master_client_id, ActorId(1));
        assert!(peer.is_master_client());
    }

    #[test]
    fn game_tier_refusal_returns_to_the_master() {
        let (mut peer, remote) = fresh(config());
        peer.tier = ServerTier::GameServer;
        peer.state = ClientState::Joining;
        peer.master_address = Some("master:1".into());
        peer.transport.open("game:1").unwrap();
        peer.pending = Some(PendingEntry {
            kind: EntryKind::Join,
            params: EnterRoomParams {
                room_name: Some("gone".into()),
                ..Default::default()
            },
            issued: true,
        });
        remote.drain();
        let seen = recorder(&mut peer);

        remote.push_response(OperationResponse::error(
            OperationCode::JoinGame,
            return_code::GAME_DOES_NOT_EXIST,
            "no such room",
        ));
        peer.dispatch_incoming();
        assert!(peer.pending.is_none());
        match seen.borrow().as_slice() {
            [Notification::JoinRoomFailed(err, _)] => {
                assert_eq!(*err, ServerError::GameDoesNotExist)
            }
            other => panic!("expected JoinRoomFailed, got {other:?}"),
        }
        peer.dispatch_incoming();
        assert_eq!(peer.state(), ClientState::ConnectingToMasterServer);
        assert_eq!(
            remote.drain(),
            vec![WireAction::Closed, WireAction::Opened("master:1".into())]
        );
    }

    /// A peer authenticated on the master tier (secret "s1"), lobby not
    /// joined. The remote's action log is empty.
    fn master_peer() -> (Peer<MemoryTransport>, MemoryRemote) {
        let (mut peer, remote) = fresh(ClientConfig {
            use_name_server: false,
            master_server_address: Some("master:1".into()),
            auto_join_lobby: false,
            ..config()
        });
        peer.connect_using_settings().unwrap();
        remote.push_status(StatusCode::Connected);
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        remote.push_response(ok(
            OperationCode::Authenticate,
            Params::from([(keys::SECRET, Value::from("s1"))]),
        ));
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToMaster);
        remote.drain();
        (peer, remote)
    }

    #[test]
    fn disconnect_abandons_room_entry_and_allows_a_new_one() {
        let (mut peer, remote) = master_peer();
        let seen = recorder(&mut peer);
        peer.create_room(Some("R1"), RoomOptions::default()).unwrap();
        peer.disconnect();
        peer.service();
        assert_eq!(peer.state(), ClientState::Disconnected);
        assert!(peer.pending.is_none());
        assert!(matches!(
            seen.borrow().as_slice(),
            [
                Notification::CreateRoomFailed(ServerError::OperationNotAllowed, _),
                Notification::Disconnected
            ]
        ));

        peer.reconnect_to_master().unwrap();
        remote.push_status(StatusCode::Connected);
        remote.push_status(StatusCode::EncryptionEstablished);
        peer.service();
        remote.push_response(ok(OperationCode::Authenticate, Params::new()));
        peer.service();
        assert_eq!(peer.state(), ClientState::ConnectedToMaster);
        remote.drain();

        peer.create_room(Some("R2"), RoomOptions::default()).unwrap();
        let ops = remote.sent_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].params.string(keys::ROOM_NAME), Some("R2"));
    }

    #[test]
    fn fatal_fault_abandons_room_entry() {
        let (mut peer, remote) = master_peer();
        let seen = recorder(&mut peer);
        peer.join_room("lost").unwrap();
        remote.push_status(StatusCode::DisconnectByServerLogic);
        peer.service();
        peer.service();
        assert_eq!(peer.state(), ClientState::Disconnected);
        assert!(peer.pending.is_none());
        assert!(
            seen.borrow()
                .iter()
                .any(|n| matches!(n, Notification::JoinRoomFailed(..)))
        );
    }

    #[test]
    fn disconnect_cancels_a_scheduled_retry() {
        let (mut peer, remote) = fresh(ClientConfig {
            use_name_server: false,
            master_server_address: Some("master:1".into()),
            max_reconnect_attempts: 2,
            ..config()
        });
        peer.connect_using_settings().unwrap();
        remote.push_status(StatusCode::Connected);
        peer.service();
        remote.push_status(StatusCode::TimeoutDisconnect);
        peer.service();
        assert_eq!(peer.state(), ClientState::Disconnecting);
        assert_eq!(peer.retry_tier, Some(ServerTier::MasterServer));

        peer.disconnect();
        peer.service();
        peer.service();
        assert_eq!(peer.state(), ClientState::Disconnected);
        let opened = remote
            .drain()
            .into_iter()
            .filter(|a| matches!(a, WireAction::Opened(_)))
            .count();
        assert_eq!(opened, 1);
    }

    #[test]
    fn placement_without_an_address_reports_the_entry_failed() {
        let (mut peer, remote) = master_peer();
        let seen = recorder(&mut peer);
        peer.join_room("somewhere").unwrap();
        remote.push_response(ok(
            OperationCode::JoinGame,
            Params::from([(keys::ROOM_NAME, Value::from("somewhere"))]),
        ));
        peer.service();
        assert!(peer.pending.is_none());
        assert_eq!(peer.state(), ClientState::ConnectedToMaster);
        assert!(matches!(
            seen.borrow().as_slice(),
            [Notification::JoinRoomFailed(ServerError::InvalidOperation, _)]
        ));
    }

    #[test]
    fn master_hands_over_by_assign_event() {
        let (mut peer, remote) = joined_peer(1, &[2, 3]);
        peer.set_master_client(ActorId(2)).unwrap();
        let ops = remote.sent_operations();
        assert_eq!(ops[0].params.int(keys::EVENT_CODE), Some(208));
        assert_eq!(peer.room().unwrap().master_client_id, ActorId(2));
        assert!(matches!(
            drain_notifications(&mut peer).as_slice(),
            [Notification::MasterSwitched { .. }]
        ));

        match peer.set_master_client(ActorId(3)) {
            Err(ClientError::NotMasterClient) => {}
            other => panic!("expected NotMasterClient, got {other:?}"),
        }
    }

    #[test]
    fn properties_set_before_joining_are_kept_locally() {
        let (mut peer, _remote) = fresh(config());
        let mut props = Properties::new();
        props.insert("team".into(), Value::from("red"));
        peer.set_player_properties(ActorId::NONE, props, None).unwrap();
        assert_eq!(peer.local_properties.get("team"), Some(&Value::from("red")));
    }

    #[test]
    fn leaving_clears_the_room_and_reports_it_once() {
        let (mut peer, remote) = joined_peer(1, &[2]);
        peer.master_address = Some("master:1".into());
        peer.leave_room(false).unwrap();
        assert_eq!(peer.state(), ClientState::Leaving);
        assert_eq!(remote.sent_codes(), vec![OperationCode::Leave]);

        remote.push_response(ok(OperationCode::Leave, Params::new()));
        peer.service();
        peer.service();
        assert!(peer.room().is_none());
        assert_eq!(peer.local_actor(), ActorId::NONE);
        assert_eq!(peer.state(), ClientState::ConnectingToMasterServer);
        let left = drain_notifications(&mut peer);
        assert!(left.is_empty(), "flushed during service: {left:?}");
    }
}
