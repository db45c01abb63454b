// Outgoing operation builders.
//
// One function per operation code, each producing an `OperationRequest`
// with positional fields from `tierlink_protocol::keys`. Room-entry builders
// take the tier they are sent to: the master tier only needs enough to place
// the client, the game tier also gets room options and the local player's
// properties.

use tierlink_protocol::{
    ActorId, CachingOption, EventCode, OperationCode, OperationRequest, Properties,
    ReceiverGroup, ServerTier, Value, join_mode, keys, props,
};

/// Options of a room this client creates.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomOptions {
    pub is_open: bool,
    pub is_visible: bool,
    /// 0 means no limit.
    pub max_players: u8,
    pub custom_properties: Properties,
    /// Milliseconds an inactive player is kept; 0 removes on disconnect.
    pub player_ttl_ms: i64,
    pub empty_room_ttl_ms: i64,
    pub cleanup_cache_on_leave: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            is_open: true,
            is_visible: true,
            max_players: 0,
            custom_properties: Properties::new(),
            player_ttl_ms: 0,
            empty_room_ttl_ms: 0,
            cleanup_cache_on_leave: true,
        }
    }
}

impl RoomOptions {
    fn to_properties(&self) -> Properties {
        let mut p = self.custom_properties.clone();
        p.insert(props::IS_OPEN.into(), Value::Bool(self.is_open));
        p.insert(props::IS_VISIBLE.into(), Value::Bool(self.is_visible));
        p.insert(props::MAX_PLAYERS.into(), Value::from(i64::from(self.max_players)));
        p.insert(
            props::CLEANUP_CACHE_ON_LEAVE.into(),
            Value::Bool(self.cleanup_cache_on_leave),
        );
        p
    }
}

/// Which room-entry operation is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Create,
    Join,
    JoinRandom,
}

impl EntryKind {
    pub fn code(self) -> OperationCode {
        match self {
            EntryKind::Create => OperationCode::CreateGame,
            EntryKind::Join => OperationCode::JoinGame,
            EntryKind::JoinRandom => OperationCode::JoinRandomGame,
        }
    }
}

/// Parameters of a create/join, kept across the master-to-game hop.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct EnterRoomParams {
    pub room_name: Option<String>,
    pub options: RoomOptions,
    /// One of `join_mode::*`.
    pub join_mode: i64,
    /// Random-join filter on room properties.
    pub expected_properties: Properties,
    /// Random-join filter; 0 matches any.
    pub expected_max_players: u8,
    pub lobby: Option<String>,
}

pub fn authenticate(
    app_id: &str,
    app_version: &str,
    user_id: Option<&str>,
    nick_name: &str,
    region: Option<&str>,
    secret: Option<&str>,
) -> OperationRequest {
    let op = OperationRequest::new(OperationCode::Authenticate)
        .with(keys::APP_ID, app_id)
        .with(keys::APP_VERSION, app_version)
        .with_opt(keys::USER_ID, user_id)
        .with_opt(keys::REGION, region);
    let op = if nick_name.is_empty() {
        op
    } else {
        op.with(keys::NICK_NAME, nick_name)
    };
    op.with_opt(keys::SECRET, secret)
}

pub fn get_regions(app_id: &str) -> OperationRequest {
    OperationRequest::new(OperationCode::GetRegions).with(keys::APP_ID, app_id)
}

pub fn join_lobby(lobby: Option<&str>) -> OperationRequest {
    OperationRequest::new(OperationCode::JoinLobby).with_opt(keys::LOBBY_NAME, lobby)
}

pub fn leave_lobby() -> OperationRequest {
    OperationRequest::new(OperationCode::LeaveLobby)
}

/// Room-entry operation for `kind`, shaped for `tier`.
pub fn enter_room(
    kind: EntryKind,
    params: &EnterRoomParams,
    tier: ServerTier,
    player_properties: &Properties,
) -> OperationRequest {
    let mut op = OperationRequest::new(kind.code())
        .with_opt(keys::ROOM_NAME, params.room_name.as_deref())
        .with_opt(keys::LOBBY_NAME, params.lobby.as_deref());
    if kind == EntryKind::JoinRandom {
        let mut expected = params.expected_properties.clone();
        if params.expected_max_players > 0 {
            expected.insert(
                props::MAX_PLAYERS.into(),
                Value::from(i64::from(params.expected_max_players)),
            );
        }
        if !expected.is_empty() {
            op = op.with(keys::EXPECTED_VALUES, Value::Map(expected));
        }
        return op;
    }
    if params.join_mode != join_mode::DEFAULT {
        op = op.with(keys::JOIN_MODE, params.join_mode);
    }
    if tier != ServerTier::GameServer {
        return op;
    }
    // The game tier creates the room, so it needs the options whenever this
    // request may create it.
    if kind == EntryKind::Create || params.join_mode == join_mode::CREATE_IF_NOT_EXISTS {
        let o = &params.options;
        op = op
            .with(keys::ROOM_PROPERTIES, Value::Map(o.to_properties()))
            .with(keys::CLEANUP_CACHE_ON_LEAVE, o.cleanup_cache_on_leave);
        if o.player_ttl_ms > 0 {
            op = op.with(keys::PLAYER_TTL, o.player_ttl_ms);
        }
        if o.empty_room_ttl_ms > 0 {
            op = op.with(keys::EMPTY_ROOM_TTL, o.empty_room_ttl_ms);
        }
    }
    if !player_properties.is_empty() {
        op = op.with(keys::PLAYER_PROPERTIES, Value::Map(player_properties.clone()));
    }
    op.with(keys::BROADCAST, true)
}

pub fn leave(will_come_back: bool) -> OperationRequest {
    let op = OperationRequest::new(OperationCode::Leave);
    if will_come_back {
        op.with(keys::IS_COMING_BACK, true)
    } else {
        op
    }
}

/// `actor` 0 targets the room.
pub fn set_properties(
    actor: ActorId,
    properties: &Properties,
    expected: Option<&Properties>,
) -> OperationRequest {
    OperationRequest::new(OperationCode::SetProperties)
        .with(keys::TARGET_ACTOR_NR, actor)
        .with(keys::PROPERTIES, Value::Map(properties.clone()))
        .with_opt(keys::EXPECTED_VALUES, expected.map(|e| Value::Map(e.clone())))
        .with(keys::BROADCAST, true)
}

pub fn get_properties() -> OperationRequest {
    OperationRequest::new(OperationCode::GetProperties)
}

/// Routing and caching of a raised event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RaiseEventOptions {
    pub caching: CachingOption,
    pub receivers: ReceiverGroup,
    /// When non-empty, overrides `receivers`. For cache removal, filters by
    /// the original senders instead.
    pub target_actors: Vec<ActorId>,
    /// 0 means no group.
    pub interest_group: u8,
}

pub fn raise_event(code: EventCode, data: Value, options: &RaiseEventOptions) -> OperationRequest {
    let mut op = OperationRequest::new(OperationCode::RaiseEvent)
        .with(keys::EVENT_CODE, i64::from(code.to_byte()));
    if !data.is_null() {
        op = op.with(keys::DATA, data);
    }
    if options.caching != CachingOption::DoNotCache {
        op = op.with(keys::CACHE, i64::from(options.caching.to_byte()));
    }
    if options.receivers != ReceiverGroup::Others {
        op = op.with(keys::RECEIVER_GROUP, i64::from(options.receivers.to_byte()));
    }
    if !options.target_actors.is_empty() {
        let actors = options.target_actors.iter().map(|a| Value::from(*a)).collect();
        op = op.with(keys::TARGET_ACTORS, Value::Array(actors));
    }
    if options.interest_group != 0 {
        op = op.with(keys::INTEREST_GROUP, i64::from(options.interest_group));
    }
    op
}

/// `Some(&[])` means all groups.
pub fn change_groups(remove: Option<&[u8]>, add: Option<&[u8]>) -> OperationRequest {
    let list = |groups: &[u8]| Value::Array(groups.iter().map(|g| Value::from(i64::from(*g))).collect());
    OperationRequest::new(OperationCode::ChangeGroups)
        .with_opt(keys::GROUPS_REMOVE, remove.map(list))
        .with_opt(keys::GROUPS_ADD, add.map(list))
}

pub fn find_friends(user_ids: &[String]) -> OperationRequest {
    let ids = user_ids.iter().map(|id| Value::from(id.as_str())).collect();
    OperationRequest::new(OperationCode::FindFriends).with(keys::FRIEND_IDS, Value::Array(ids))
}

pub fn web_rpc(path: &str, parameters: Value) -> OperationRequest {
    OperationRequest::new(OperationCode::WebRpc)
        .with(keys::URI_PATH, path)
        .with(keys::WEB_RPC_PARAMS, parameters)
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::ParamsExt;

    use super::*;

    #[test]
    fn master_tier_create_carries_only_placement_fields() {
        let params = EnterRoomParams {
            room_name: Some("R1".into()),
            ..Default::default()
        };
        let op = enter_room(EntryKind::Create, &params, ServerTier::MasterServer, &Properties::new());
        assert_eq!(op.code, OperationCode::CreateGame);
        assert_eq!(op.params.string(keys::ROOM_NAME), Some("R1"));
        assert!(!op.params.contains_key(&keys::ROOM_PROPERTIES));

        let op = enter_room(EntryKind::Create, &params, ServerTier::GameServer, &Properties::new());
        let room_props = op.params.map(keys::ROOM_PROPERTIES).unwrap();
        assert_eq!(room_props.get(props::IS_OPEN), Some(&Value::Bool(true)));
        assert_eq!(op.params.boolean(keys::BROADCAST), Some(true));
    }

    #[test]
    fn random_join_filters_on_expected_values() {
        let params = EnterRoomParams {
            expected_max_players: 4,
            ..Default::default()
        };
        let op = enter_room(EntryKind::JoinRandom, &params, ServerTier::MasterServer, &Properties::new());
        let expected = op.params.map(keys::EXPECTED_VALUES).unwrap();
        assert_eq!(expected.get(props::MAX_PLAYERS), Some(&Value::from(4)));
        assert!(!op.params.contains_key(&keys::ROOM_NAME));
    }

    #[test]
    fn defaults_are_left_off_raised_events() {
        let op = raise_event(EventCode::Custom(3), Value::from(1), &RaiseEventOptions::default());
        assert_eq!(op.params.int(keys::EVENT_CODE), Some(3));
        assert!(!op.params.contains_key(&keys::CACHE));
        assert!(!op.params.contains_key(&keys::RECEIVER_GROUP));

        let options = RaiseEventOptions {
            caching: CachingOption::AddToRoomCache,
            receivers: ReceiverGroup::All,
            target_actors: vec![ActorId(2)],
            interest_group: 5,
        };
        let op = raise_event(EventCode::Rpc, Value::Null, &options);
        assert!(!op.params.contains_key(&keys::DATA));
        assert_eq!(op.params.int(keys::INTEREST_GROUP), Some(5));
        assert_eq!(op.params.array(keys::TARGET_ACTORS), Some(&[Value::from(2)][..]));
    }

    #[test]
    fn secret_rides_on_authenticate() {
        let op = authenticate("app", "1.0", None, "", Some("eu"), Some("s3cr3t"));
        assert_eq!(op.params.string(keys::SECRET), Some("s3cr3t"));
        assert_eq!(op.params.string(keys::REGION), Some("eu"));
        assert!(!op.params.contains_key(&keys::NICK_NAME));
    }
}
