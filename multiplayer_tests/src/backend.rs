// Loopback relay backend: all three tiers in one synchronous object.
//
// `LoopbackBackend` sits on the far end of any number of `MemoryTransport`s
// (through their `MemoryRemote` handles) and answers them the way a hosted
// deployment would, minus the network. Which tier a connection is talking to
// is decided by the address the client opened (`NAME_ADDRESS`,
// `MASTER_ADDRESS`, `GAME_ADDRESS`); clients hop between tiers on the same
// transport exactly as they would over TCP.
//
// Implemented behavior:
// - Name tier: region list, authenticate (answers with the master address).
// - Master tier: authenticate (issues a secret), lobby join/leave, room
//   placement for create/join/join-random, friend lookup, web rpc echo.
// - Game tier: room creation and entry (with rejoin of inactive members),
//   leave, properties with compare-and-set, interest groups, and raise-event
//   relaying with receiver groups, target actors, interest groups, and the
//   per-room event cache replayed to every joiner.
//
// The backend keeps its own master-client id with the same rule the client
// uses (lowest remaining actor, overridden by assign-master events and the
// `#master` property) so `ReceiverGroup::MasterClient` routes correctly.
//
// `pump()` processes everything queued so far and returns how many client
// actions it handled; the test world alternates client ticks and pumps.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace, warn};
use tierlink_client::transport::{MemoryRemote, StatusCode, WireAction};
use tierlink_protocol::{
    ActorId, CachingOption, ClientMessage, EventCode, EventData, OperationCode, OperationRequest,
    OperationResponse, Params, ParamsExt, Properties, ReceiverGroup, ServerTier, Value, join_mode,
    keys, props, return_code,
};

pub const NAME_ADDRESS: &str = "name.loopback:5058";
pub const MASTER_ADDRESS: &str = "master.loopback:5055";
pub const GAME_ADDRESS: &str = "game.loopback:5056";

/// Regions offered by the name tier; all of them point at the one master.
pub const REGIONS: [&str; 2] = ["eu", "us"];

/// Index of a connection in the backend.
pub type ConnId = usize;

struct Connection {
    remote: MemoryRemote,
    tier: Option<ServerTier>,
    user_id: String,
    room: Option<String>,
    actor: ActorId,
}

struct Member {
    conn: ConnId,
    user_id: String,
    properties: Properties,
    inactive: bool,
    groups: BTreeSet<u8>,
}

struct CachedEvent {
    code: EventCode,
    sender: ActorId,
    data: Value,
    /// Survives the sender leaving.
    global: bool,
}

struct HostedRoom {
    properties: Properties,
    members: BTreeMap<ActorId, Member>,
    next_actor: i32,
    master: ActorId,
    cleanup: bool,
    cache: Vec<CachedEvent>,
}

impl HostedRoom {
    fn new(properties: Properties, cleanup: bool) -> Self {
        Self {
            properties,
            members: BTreeMap::new(),
            next_actor: 1,
            master: ActorId::NONE,
            cleanup,
            cache: Vec::new(),
        }
    }

    fn active_count(&self) -> usize {
        self.members.values().filter(|m| !m.inactive).count()
    }

    fn is_open(&self) -> bool {
        self.properties.get(props::IS_OPEN).and_then(Value::as_bool) != Some(false)
    }

    fn is_full(&self) -> bool {
        let max = self
            .properties
            .get(props::MAX_PLAYERS)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        max > 0 && i64::try_from(self.active_count()).unwrap_or(i64::MAX) >= max
    }

    fn actor_list(&self) -> Value {
        Value::Array(self.members.keys().map(|a| Value::from(*a)).collect())
    }

    /// Player properties keyed by the actor number as a string.
    fn player_properties(&self) -> Properties {
        self.members
            .iter()
            .map(|(actor, m)| (actor.0.to_string(), Value::Map(m.properties.clone())))
            .collect()
    }

    fn elect_master(&mut self) {
        if !self.members.contains_key(&self.master) {
            self.master = self.members.keys().next().copied().unwrap_or(ActorId::NONE);
        }
    }
}

/// A snapshot of one hosted room, for assertions.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomSummary {
    pub actors: Vec<ActorId>,
    pub inactive: Vec<ActorId>,
    pub master: ActorId,
    pub cached_events: usize,
    pub properties: Properties,
}

#[derive(Default)]
pub struct LoopbackBackend {
    conns: Vec<Connection>,
    rooms: BTreeMap<String, HostedRoom>,
    next_room: u32,
    next_secret: u64,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the far end of a transport. `user_id` stands in for the
    /// authenticated identity (used by rejoin and friend lookup).
    pub fn attach(&mut self, remote: MemoryRemote, user_id: &str) -> ConnId {
        self.conns.push(Connection {
            remote,
            tier: None,
            user_id: user_id.to_owned(),
            room: None,
            actor: ActorId::NONE,
        });
        self.conns.len() - 1
    }

    pub fn room(&self, name: &str) -> Option<RoomSummary> {
        let room = self.rooms.get(name)?;
        Some(RoomSummary {
            actors: room.members.keys().copied().collect(),
            inactive: room
                .members
                .iter()
                .filter(|(_, m)| m.inactive)
                .map(|(a, _)| *a)
                .collect(),
            master: room.master,
            cached_events: room.cache.len(),
            properties: room.properties.clone(),
        })
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Handle every action the clients queued. Returns how many there were.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        for conn in 0..self.conns.len() {
            for action in self.conns[conn].remote.drain() {
                handled += 1;
                self.on_action(conn, action);
            }
        }
        handled
    }

    fn on_action(&mut self, conn: ConnId, action: WireAction) {
        match action {
            WireAction::Opened(address) => {
                let tier = match address.as_str() {
                    NAME_ADDRESS => Some(ServerTier::NameServer),
                    MASTER_ADDRESS => Some(ServerTier::MasterServer),
                    GAME_ADDRESS => Some(ServerTier::GameServer),
                    _ => None,
                };
                let c = &mut self.conns[conn];
                match tier {
                    Some(tier) => {
                        trace!("conn {conn} opened {tier:?}");
                        c.tier = Some(tier);
                        c.remote.push_status(StatusCode::Connected);
                    }
                    None => {
                        warn!("conn {conn} opened unknown address {address}");
                        c.remote.push_status(StatusCode::ExceptionOnConnect);
                    }
                }
            }
            WireAction::EncryptionRequested => {
                self.conns[conn]
                    .remote
                    .push_status(StatusCode::EncryptionEstablished);
            }
            WireAction::Closed => {
                if self.conns[conn].tier == Some(ServerTier::GameServer) {
                    self.depart(conn, false);
                }
                self.conns[conn].tier = None;
            }
            WireAction::Sent {
                message: ClientMessage::Operation(op),
                ..
            } => self.on_operation(conn, op),
        }
    }

    fn respond(&self, conn: ConnId, response: OperationResponse) {
        self.conns[conn].remote.push_response(response);
    }

    fn on_operation(&mut self, conn: ConnId, op: OperationRequest) {
        let tier = self.conns[conn].tier;
        trace!("conn {conn} {:?} on {tier:?}", op.code);
        match (tier, op.code) {
            (Some(tier), OperationCode::Authenticate) => self.authenticate(conn, tier, &op),
            (Some(ServerTier::NameServer), OperationCode::GetRegions) => {
                let codes = REGIONS.iter().map(|r| Value::from(*r)).collect();
                let addresses = REGIONS.iter().map(|_| Value::from(MASTER_ADDRESS)).collect();
                self.respond(
                    conn,
                    OperationResponse::ok(
                        op.code,
                        Params::from([
                            (keys::REGION_CODES, Value::Array(codes)),
                            (keys::REGION_ADDRESSES, Value::Array(addresses)),
                        ]),
                    ),
                );
            }
            (
                Some(ServerTier::MasterServer),
                OperationCode::JoinLobby | OperationCode::LeaveLobby,
            ) => self.respond(conn, OperationResponse::ok(op.code, Params::new())),
            (
                Some(ServerTier::MasterServer),
                OperationCode::CreateGame | OperationCode::JoinGame | OperationCode::JoinRandomGame,
            ) => self.place(conn, &op),
            (Some(ServerTier::MasterServer), OperationCode::FindFriends) => {
                self.find_friends(conn, &op)
            }
            (Some(_), OperationCode::WebRpc) => {
                let params = Params::from([
                    (
                        keys::URI_PATH,
                        op.params.value(keys::URI_PATH).cloned().unwrap_or(Value::Null),
                    ),
                    (keys::WEB_RPC_RETURN_CODE, Value::from(0)),
                    (
                        keys::WEB_RPC_RETURN_DATA,
                        op.params
                            .value(keys::WEB_RPC_PARAMS)
                            .cloned()
                            .unwrap_or(Value::Null),
                    ),
                ]);
                self.respond(conn, OperationResponse::ok(op.code, params));
            }
            (
                Some(ServerTier::GameServer),
                OperationCode::CreateGame | OperationCode::JoinGame,
            ) => self.enter(conn, &op),
            (Some(ServerTier::GameServer), OperationCode::Leave) => {
                self.respond(conn, OperationResponse::ok(op.code, Params::new()));
                let coming_back = op.params.boolean(keys::IS_COMING_BACK) == Some(true);
                self.depart(conn, coming_back);
            }
            (Some(ServerTier::GameServer), OperationCode::RaiseEvent) => self.raise(conn, &op),
            (Some(ServerTier::GameServer), OperationCode::SetProperties) => {
                self.set_properties(conn, &op)
            }
            (Some(ServerTier::GameServer), OperationCode::GetProperties) => {
                self.get_properties(conn, &op)
            }
            (Some(ServerTier::GameServer), OperationCode::ChangeGroups) => {
                self.change_groups(conn, &op)
            }
            (tier, code) => {
                warn!("conn {conn}: {code:?} is not served on {tier:?}");
                self.respond(
                    conn,
                    OperationResponse::error(
                        code,
                        return_code::INVALID_OPERATION,
                        "operation not served on this tier",
                    ),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Name and master tiers
    // -----------------------------------------------------------------------

    fn authenticate(&mut self, conn: ConnId, tier: ServerTier, op: &OperationRequest) {
        if op.params.string(keys::APP_ID).is_none_or(str::is_empty) {
            self.respond(
                conn,
                OperationResponse::error(
                    op.code,
                    return_code::INVALID_AUTHENTICATION,
                    "missing app id",
                ),
            );
            return;
        }
        let params = match tier {
            ServerTier::NameServer => {
                let region = op.params.string(keys::REGION).unwrap_or_default();
                if !REGIONS.contains(&region) {
                    self.respond(
                        conn,
                        OperationResponse::error(
                            op.code,
                            return_code::INVALID_REGION,
                            format!("unknown region {region:?}"),
                        ),
                    );
                    return;
                }
                Params::from([(keys::ADDRESS, Value::from(MASTER_ADDRESS))])
            }
            ServerTier::MasterServer => {
                self.next_secret += 1;
                let secret = format!("secret-{}-{}", self.conns[conn].user_id, self.next_secret);
                Params::from([(keys::SECRET, Value::from(secret))])
            }
            ServerTier::GameServer => Params::new(),
        };
        self.respond(conn, OperationResponse::ok(op.code, params));
    }

    /// Master-tier create/join/join-random: choose a room and answer with
    /// the game tier's address.
    fn place(&mut self, conn: ConnId, op: &OperationRequest) {
        let requested = op.params.string(keys::ROOM_NAME).map(str::to_owned);
        let mode = op.params.int(keys::JOIN_MODE).unwrap_or(join_mode::DEFAULT);
        let placed = match op.code {
            OperationCode::CreateGame => match requested {
                Some(name) if self.rooms.contains_key(&name) => Err((
                    return_code::GAME_ID_ALREADY_EXISTS,
                    format!("room {name} already exists"),
                )),
                Some(name) => Ok(name),
                None => {
                    self.next_room += 1;
                    Ok(format!("room-{}", self.next_room))
                }
            },
            OperationCode::JoinGame => match requested {
                Some(name) if self.rooms.contains_key(&name) => Ok(name),
                Some(name) if mode == join_mode::CREATE_IF_NOT_EXISTS => Ok(name),
                Some(name) => Err((
                    return_code::GAME_DOES_NOT_EXIST,
                    format!("room {name} does not exist"),
                )),
                None => Err((return_code::INVALID_OPERATION, "room name required".into())),
            },
            _ => {
                let expected = op.params.map(keys::EXPECTED_VALUES);
                self.rooms
                    .iter()
                    .find(|(_, room)| {
                        room.is_open()
                            && !room.is_full()
                            && room.active_count() > 0
                            && room.properties.get(props::IS_VISIBLE).and_then(Value::as_bool)
                                != Some(false)
                            && expected.is_none_or(|e| {
                                e.iter().all(|(k, v)| room.properties.get(k) == Some(v))
                            })
                    })
                    .map(|(name, _)| name.clone())
                    .ok_or((
                        return_code::NO_RANDOM_MATCH_FOUND,
                        "no open room matches".into(),
                    ))
            }
        };
        match placed {
            Ok(name) => {
                debug!("placing conn {conn} in {name}");
                self.respond(
                    conn,
                    OperationResponse::ok(
                        op.code,
                        Params::from([
                            (keys::ADDRESS, Value::from(GAME_ADDRESS)),
                            (keys::ROOM_NAME, Value::from(name)),
                        ]),
                    ),
                );
            }
            Err((code, message)) => {
                self.respond(conn, OperationResponse::error(op.code, code, message))
            }
        }
    }

    fn find_friends(&mut self, conn: ConnId, op: &OperationRequest) {
        let ids: Vec<&str> = op
            .params
            .array(keys::FRIEND_IDS)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        let mut online = Vec::new();
        let mut rooms = Vec::new();
        for id in ids {
            let found = self
                .conns
                .iter()
                .find(|c| c.user_id == id && c.tier.is_some());
            online.push(Value::from(found.is_some()));
            rooms.push(Value::from(
                found.and_then(|c| c.room.clone()).unwrap_or_default(),
            ));
        }
        self.respond(
            conn,
            OperationResponse::ok(
                op.code,
                Params::from([
                    (keys::FRIENDS_ONLINE, Value::Array(online)),
                    (keys::FRIENDS_ROOMS, Value::Array(rooms)),
                ]),
            ),
        );
    }

    // -----------------------------------------------------------------------
    // Game tier: membership
    // -----------------------------------------------------------------------

    fn enter(&mut self, conn: ConnId, op: &OperationRequest) {
        let Some(name) = op.params.string(keys::ROOM_NAME).map(str::to_owned) else {
            self.respond(
                conn,
                OperationResponse::error(op.code, return_code::INVALID_OPERATION, "no room name"),
            );
            return;
        };
        let mode = op.params.int(keys::JOIN_MODE).unwrap_or(join_mode::DEFAULT);
        let creates = op.code == OperationCode::CreateGame
            || (mode == join_mode::CREATE_IF_NOT_EXISTS && !self.rooms.contains_key(&name));
        if creates {
            if self.rooms.get(&name).is_some_and(|r| !r.members.is_empty()) {
                self.respond(
                    conn,
                    OperationResponse::error(
                        op.code,
                        return_code::GAME_ID_ALREADY_EXISTS,
                        format!("room {name} already exists"),
                    ),
                );
                return;
            }
            let properties = op
                .params
                .map(keys::ROOM_PROPERTIES)
                .cloned()
                .unwrap_or_default();
            let cleanup = op.params.boolean(keys::CLEANUP_CACHE_ON_LEAVE).unwrap_or(true);
            info!("creating room {name}");
            self.rooms.insert(name.clone(), HostedRoom::new(properties, cleanup));
        }

        let user_id = self.conns[conn].user_id.clone();
        let Some(room) = self.rooms.get_mut(&name) else {
            self.respond(
                conn,
                OperationResponse::error(
                    op.code,
                    return_code::GAME_DOES_NOT_EXIST,
                    format!("room {name} does not exist"),
                ),
            );
            return;
        };
        let rejoining = room
            .members
            .iter()
            .find(|(_, m)| m.inactive && m.user_id == user_id)
            .map(|(a, _)| *a);
        let actor = match rejoining {
            Some(actor) => actor,
            None if mode == join_mode::REJOIN => {
                self.respond(
                    conn,
                    OperationResponse::error(
                        op.code,
                        return_code::OPERATION_NOT_ALLOWED,
                        "nothing to rejoin",
                    ),
                );
                return;
            }
            None if !room.is_open() => {
                self.respond(
                    conn,
                    OperationResponse::error(op.code, return_code::GAME_CLOSED, "room is closed"),
                );
                return;
            }
            None if room.is_full() => {
                self.respond(
                    conn,
                    OperationResponse::error(op.code, return_code::GAME_FULL, "room is full"),
                );
                return;
            }
            None => {
                let actor = ActorId(room.next_actor);
                room.next_actor += 1;
                actor
            }
        };
        let properties = op
            .params
            .map(keys::PLAYER_PROPERTIES)
            .cloned()
            .unwrap_or_default();
        match room.members.get_mut(&actor) {
            Some(member) => {
                member.inactive = false;
                member.conn = conn;
                member.properties.extend(properties);
            }
            None => {
                room.members.insert(
                    actor,
                    Member {
                        conn,
                        user_id,
                        properties,
                        inactive: false,
                        groups: BTreeSet::new(),
                    },
                );
            }
        }
        room.elect_master();
        info!("conn {conn} is {actor:?} in {name}");

        let response = Params::from([
            (keys::ACTOR_NR, Value::from(actor)),
            (keys::ACTOR_LIST, room.actor_list()),
            (keys::ROOM_NAME, Value::from(name.as_str())),
            (keys::ROOM_PROPERTIES, Value::Map(room.properties.clone())),
            (keys::PLAYER_PROPERTIES, Value::Map(room.player_properties())),
        ]);
        let join = EventData {
            code: EventCode::Join,
            params: Params::from([
                (keys::ACTOR_NR, Value::from(actor)),
                (keys::ACTOR_LIST, room.actor_list()),
                (
                    keys::PLAYER_PROPERTIES,
                    Value::Map(room.members[&actor].properties.clone()),
                ),
            ]),
        };
        let recipients = active_conns(room, None);
        let replay: Vec<EventData> = room
            .cache
            .iter()
            .map(|e| event(e.code, e.sender, e.data.clone()))
            .collect();

        let c = &mut self.conns[conn];
        c.room = Some(name);
        c.actor = actor;
        self.respond(conn, OperationResponse::ok(op.code, response));
        for target in recipients {
            self.conns[target].remote.push_event(join.clone());
        }
        for e in replay {
            self.conns[conn].remote.push_event(e);
        }
    }

    /// Remove (or deactivate) the connection's actor from its room.
    fn depart(&mut self, conn: ConnId, inactive: bool) {
        let c = &mut self.conns[conn];
        let Some(name) = c.room.take() else {
            return;
        };
        let actor = std::mem::replace(&mut c.actor, ActorId::NONE);
        let Some(room) = self.rooms.get_mut(&name) else {
            return;
        };
        if !room.members.contains_key(&actor) {
            return;
        }
        let mut params = Params::from([(keys::ACTOR_NR, Value::from(actor))]);
        if inactive {
            if let Some(member) = room.members.get_mut(&actor) {
                member.inactive = true;
            }
            params.insert(keys::IS_INACTIVE, Value::from(true));
            info!("{actor:?} is inactive in {name}");
        } else {
            room.members.remove(&actor);
            if room.cleanup {
                room.cache.retain(|e| e.global || e.sender != actor);
            }
            room.elect_master();
            if room.master.is_assigned() {
                params.insert(keys::MASTER_CLIENT_ID, Value::from(room.master));
            }
            info!("{actor:?} left {name}");
        }
        let leave = EventData {
            code: EventCode::Leave,
            params,
        };
        let recipients = active_conns(room, None);
        if room.members.is_empty() {
            info!("room {name} is empty; closing it");
            self.rooms.remove(&name);
        }
        for target in recipients {
            self.conns[target].remote.push_event(leave.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Game tier: in-room operations
    // -----------------------------------------------------------------------

    fn in_room(&mut self, conn: ConnId) -> Option<(ActorId, &mut HostedRoom)> {
        let c = &self.conns[conn];
        let name = c.room.as_ref()?;
        let actor = c.actor;
        Some((actor, self.rooms.get_mut(name)?))
    }

    fn raise(&mut self, conn: ConnId, op: &OperationRequest) {
        let Some((sender, room)) = self.in_room(conn) else {
            warn!("conn {conn} raised an event outside a room");
            return;
        };
        let Some(code) = op
            .params
            .int(keys::EVENT_CODE)
            .and_then(|c| u8::try_from(c).ok())
            .map(EventCode::from_byte)
        else {
            warn!("raise event without a code from {sender:?}");
            return;
        };
        let data = op.params.value(keys::DATA).cloned().unwrap_or(Value::Null);
        let caching = op
            .params
            .int(keys::CACHE)
            .and_then(|c| u8::try_from(c).ok())
            .map_or(CachingOption::DoNotCache, CachingOption::from_byte);
        let receivers = op
            .params
            .int(keys::RECEIVER_GROUP)
            .and_then(|c| u8::try_from(c).ok())
            .map_or(ReceiverGroup::Others, ReceiverGroup::from_byte);
        let targets: Vec<ActorId> = op
            .params
            .array(keys::TARGET_ACTORS)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_actor)
            .collect();
        let group = op
            .params
            .int(keys::INTEREST_GROUP)
            .and_then(|g| u8::try_from(g).ok())
            .unwrap_or(0);

        match caching {
            CachingOption::RemoveFromRoomCache => {
                let before = room.cache.len();
                room.cache.retain(|e| {
                    !(e.code == code
                        && (targets.is_empty() || targets.contains(&e.sender))
                        && data_matches(&e.data, &data))
                });
                debug!("purged {} cached {code:?} event(s)", before - room.cache.len());
                return;
            }
            CachingOption::RemoveFromCacheForActorsLeft => {
                let members = &room.members;
                room.cache
                    .retain(|e| e.global || members.contains_key(&e.sender));
                return;
            }
            CachingOption::AddToRoomCache | CachingOption::AddToRoomCacheGlobal => {
                room.cache.push(CachedEvent {
                    code,
                    sender,
                    data: data.clone(),
                    global: caching == CachingOption::AddToRoomCacheGlobal,
                });
            }
            CachingOption::DoNotCache => {}
        }

        // The backend follows master hand-overs so it can route to the master.
        if code == EventCode::AssignMaster
            && sender == room.master
            && let Some(actor) = data.as_table().and_then(|t| t.actor(1))
            && room.members.contains_key(&actor)
        {
            room.master = actor;
        }

        let recipients: Vec<ConnId> = room
            .members
            .iter()
            .filter(|(actor, m)| {
                let addressed = if targets.is_empty() {
                    match receivers {
                        ReceiverGroup::Others => **actor != sender,
                        ReceiverGroup::All => true,
                        ReceiverGroup::MasterClient => **actor == room.master,
                    }
                } else {
                    targets.contains(actor)
                };
                addressed && !m.inactive && (group == 0 || m.groups.contains(&group))
            })
            .map(|(_, m)| m.conn)
            .collect();
        let e = event(code, sender, data);
        for target in recipients {
            self.conns[target].remote.push_event(e.clone());
        }
    }

    fn set_properties(&mut self, conn: ConnId, op: &OperationRequest) {
        let Some((sender, room)) = self.in_room(conn) else {
            return;
        };
        let target = op.params.actor(keys::TARGET_ACTOR_NR).unwrap_or(ActorId(0));
        let changed = op.params.map(keys::PROPERTIES).cloned().unwrap_or_default();
        let expected = op.params.map(keys::EXPECTED_VALUES).cloned();
        let current = if target == ActorId(0) {
            Some(&mut room.properties)
        } else {
            room.members.get_mut(&target).map(|m| &mut m.properties)
        };
        let Some(current) = current else {
            self.respond(
                conn,
                OperationResponse::error(op.code, return_code::INVALID_OPERATION, "unknown actor"),
            );
            return;
        };
        if let Some(expected) = &expected
            && !expected
                .iter()
                .all(|(k, v)| current.get(k).unwrap_or(&Value::Null) == v)
        {
            self.respond(
                conn,
                OperationResponse::error(
                    op.code,
                    return_code::INVALID_OPERATION,
                    "expected values did not match",
                ),
            );
            return;
        }
        for (key, value) in &changed {
            if value.is_null() {
                current.remove(key);
            } else {
                current.insert(key.clone(), value.clone());
            }
        }
        if target == ActorId(0)
            && let Some(master) = changed.get(props::MASTER_CLIENT_ID).and_then(Value::as_actor)
            && room.members.contains_key(&master)
        {
            room.master = master;
        }
        // Without expected values the sender already applied the change.
        let skip = expected.is_none().then_some(sender);
        let recipients = active_conns(room, skip);
        let e = EventData {
            code: EventCode::PropertiesChanged,
            params: Params::from([
                (keys::ACTOR_NR, Value::from(sender)),
                (keys::TARGET_ACTOR_NR, Value::from(target)),
                (keys::PROPERTIES, Value::Map(changed)),
            ]),
        };
        self.respond(conn, OperationResponse::ok(op.code, Params::new()));
        for target in recipients {
            self.conns[target].remote.push_event(e.clone());
        }
    }

    fn get_properties(&mut self, conn: ConnId, op: &OperationRequest) {
        let Some((_, room)) = self.in_room(conn) else {
            return;
        };
        let params = Params::from([
            (keys::ROOM_PROPERTIES, Value::Map(room.properties.clone())),
            (keys::PLAYER_PROPERTIES, Value::Map(room.player_properties())),
        ]);
        self.respond(conn, OperationResponse::ok(op.code, params));
    }

    fn change_groups(&mut self, conn: ConnId, op: &OperationRequest) {
        let Some((actor, room)) = self.in_room(conn) else {
            return;
        };
        let Some(member) = room.members.get_mut(&actor) else {
            return;
        };
        let groups = |key: u8| -> Option<Vec<u8>> {
            op.params.array(key).map(|list| {
                list.iter()
                    .filter_map(Value::as_i64)
                    .filter_map(|g| u8::try_from(g).ok())
                    .collect()
            })
        };
        match groups(keys::GROUPS_REMOVE) {
            Some(list) if list.is_empty() => member.groups.clear(),
            Some(list) => {
                for g in list {
                    member.groups.remove(&g);
                }
            }
            None => {}
        }
        match groups(keys::GROUPS_ADD) {
            Some(list) if list.is_empty() => member.groups.extend(1..=u8::MAX),
            Some(list) => member.groups.extend(list),
            None => {}
        }
    }
}

fn event(code: EventCode, sender: ActorId, data: Value) -> EventData {
    let mut params = Params::from([(keys::ACTOR_NR, Value::from(sender))]);
    if !data.is_null() {
        params.insert(keys::DATA, data);
    }
    EventData { code, params }
}

fn active_conns(room: &HostedRoom, except: Option<ActorId>) -> Vec<ConnId> {
    room.members
        .iter()
        .filter(|(actor, m)| !m.inactive && Some(**actor) != except)
        .map(|(_, m)| m.conn)
        .collect()
}

/// A removal filter matches when every filter field is present with the
/// same value. `Null` matches everything.
fn data_matches(data: &Value, filter: &Value) -> bool {
    match (filter, data) {
        (Value::Null, _) => true,
        (Value::Table(filter), Value::Table(data)) => {
            filter.iter().all(|(k, v)| data.get(k) == Some(v))
        }
        _ => false,
    }
}
