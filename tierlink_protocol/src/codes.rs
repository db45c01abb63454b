// Numeric vocabulary of the wire protocol: operation codes, event codes,
// positional parameter keys, backend return codes, caching directives, and
// well-known property names.
//
// Operations and events are addressed by code and carry their arguments as
// positional `u8`-keyed fields (see `value::Params`). The key constants below
// are shared by every operation; each builder in the client crate documents
// which subset it uses.

use serde::{Deserialize, Serialize};

/// Client-initiated request kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCode {
    Authenticate,
    GetRegions,
    JoinLobby,
    LeaveLobby,
    CreateGame,
    JoinGame,
    JoinRandomGame,
    Leave,
    RaiseEvent,
    SetProperties,
    GetProperties,
    ChangeGroups,
    FindFriends,
    WebRpc,
}

/// Event kinds. The first group is produced by the backend itself; the second
/// is raised by clients through `RaiseEvent` and relayed verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCode {
    // Backend events.
    Join,
    Leave,
    PropertiesChanged,

    // Client-raised events with fixed meaning.
    Rpc,
    SendSerialize,
    SendSerializeReliable,
    Instantiation,
    Destroy,
    DestroyPlayer,
    AssignMaster,
    OwnershipRequest,
    OwnershipTransfer,
    CloseConnection,

    /// Application-defined event, relayed without interpretation.
    Custom(u8),
}

/// Positional parameter keys.
pub mod keys {
    pub const ADDRESS: u8 = 1;
    pub const SECRET: u8 = 2;
    pub const APP_ID: u8 = 3;
    pub const APP_VERSION: u8 = 4;
    pub const USER_ID: u8 = 5;
    pub const NICK_NAME: u8 = 6;
    pub const REGION: u8 = 7;
    pub const CUSTOM_AUTH_TYPE: u8 = 8;
    pub const CUSTOM_AUTH_PARAMS: u8 = 9;
    pub const CUSTOM_AUTH_DATA: u8 = 10;
    pub const LOBBY_NAME: u8 = 11;
    pub const ROOM_NAME: u8 = 12;
    pub const ROOM_PROPERTIES: u8 = 13;
    pub const PLAYER_PROPERTIES: u8 = 14;
    /// On events: the sending actor. On join responses: the local actor.
    pub const ACTOR_NR: u8 = 15;
    pub const ACTOR_LIST: u8 = 16;
    pub const TARGET_ACTOR_NR: u8 = 17;
    pub const PROPERTIES: u8 = 18;
    pub const EXPECTED_VALUES: u8 = 19;
    pub const BROADCAST: u8 = 20;
    pub const MASTER_CLIENT_ID: u8 = 21;
    pub const IS_INACTIVE: u8 = 22;
    pub const CLEANUP_CACHE_ON_LEAVE: u8 = 23;
    pub const JOIN_MODE: u8 = 24;
    pub const MAX_PLAYERS: u8 = 25;
    pub const PLAYER_TTL: u8 = 26;
    pub const EMPTY_ROOM_TTL: u8 = 27;
    pub const IS_COMING_BACK: u8 = 28;
    pub const EVENT_CODE: u8 = 29;
    pub const DATA: u8 = 30;
    pub const CACHE: u8 = 31;
    pub const RECEIVER_GROUP: u8 = 32;
    pub const TARGET_ACTORS: u8 = 33;
    pub const INTEREST_GROUP: u8 = 34;
    pub const GROUPS_REMOVE: u8 = 35;
    pub const GROUPS_ADD: u8 = 36;
    pub const REGION_CODES: u8 = 37;
    pub const REGION_ADDRESSES: u8 = 38;
    pub const FRIEND_IDS: u8 = 39;
    pub const FRIENDS_ONLINE: u8 = 40;
    pub const FRIENDS_ROOMS: u8 = 41;
    pub const URI_PATH: u8 = 42;
    pub const WEB_RPC_PARAMS: u8 = 43;
    pub const WEB_RPC_RETURN_CODE: u8 = 44;
    pub const WEB_RPC_RETURN_DATA: u8 = 45;
    pub const SERVER_SIDE_MASTER: u8 = 46;
}

/// Values of `keys::JOIN_MODE` on `JoinGame`.
pub mod join_mode {
    pub const DEFAULT: i64 = 0;
    pub const CREATE_IF_NOT_EXISTS: i64 = 1;
    pub const REJOIN: i64 = 2;
}

/// Backend return codes on operation responses. Zero is success; negative
/// codes are generic request faults; positive codes are domain failures.
pub mod return_code {
    pub const OK: i16 = 0;
    pub const INTERNAL_SERVER_ERROR: i16 = -1;
    pub const INVALID_OPERATION: i16 = -2;
    pub const OPERATION_NOT_ALLOWED: i16 = -3;

    pub const INVALID_AUTHENTICATION: i16 = 100;
    pub const CUSTOM_AUTHENTICATION_FAILED: i16 = 101;
    pub const AUTHENTICATION_TICKET_EXPIRED: i16 = 102;
    pub const INVALID_REGION: i16 = 103;
    pub const MAX_CCU_REACHED: i16 = 104;
    pub const INVALID_SESSION: i16 = 105;
    pub const INVALID_SECURITY_TOKEN: i16 = 106;
    pub const INVALID_PROVIDER_TOKEN: i16 = 107;
    pub const INVALID_PRIVILEGE_TOKEN: i16 = 108;
    pub const SERVER_FULL: i16 = 110;
    pub const USER_BLOCKED: i16 = 111;

    pub const GAME_ID_ALREADY_EXISTS: i16 = 120;
    pub const GAME_FULL: i16 = 121;
    pub const GAME_CLOSED: i16 = 122;
    pub const GAME_DOES_NOT_EXIST: i16 = 123;
    pub const NO_RANDOM_MATCH_FOUND: i16 = 124;
}

/// Well-known property names. Custom properties must not start with `#`.
pub mod props {
    pub const IS_OPEN: &str = "#open";
    pub const IS_VISIBLE: &str = "#visible";
    pub const MAX_PLAYERS: &str = "#max_players";
    pub const MASTER_CLIENT_ID: &str = "#master";
    pub const CLEANUP_CACHE_ON_LEAVE: &str = "#cleanup";
    pub const NICK_NAME: &str = "#name";
}

/// Server-side caching directive attached to a raised event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachingOption {
    #[default]
    DoNotCache,
    /// Buffer for late joiners; purged when the sender leaves (if the room
    /// cleans up on leave).
    AddToRoomCache,
    /// Buffer for late joiners; survives the sender leaving.
    AddToRoomCacheGlobal,
    /// Purge buffered events matching code, sender filter, and data filter.
    RemoveFromRoomCache,
    /// Purge buffered events of actors that already left.
    RemoveFromCacheForActorsLeft,
}

/// Which room members receive a raised event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiverGroup {
    #[default]
    Others,
    All,
    MasterClient,
}

impl EventCode {
    /// Byte carried in `keys::EVENT_CODE`. Application codes at or above 200
    /// collide with the reserved range and decode as the reserved event.
    pub fn to_byte(self) -> u8 {
        match self {
            EventCode::Join => 255,
            EventCode::Leave => 254,
            EventCode::PropertiesChanged => 253,
            EventCode::Rpc => 200,
            EventCode::SendSerialize => 201,
            EventCode::Instantiation => 202,
            EventCode::CloseConnection => 203,
            EventCode::Destroy => 204,
            EventCode::SendSerializeReliable => 206,
            EventCode::DestroyPlayer => 207,
            EventCode::AssignMaster => 208,
            EventCode::OwnershipRequest => 209,
            EventCode::OwnershipTransfer => 210,
            EventCode::Custom(code) => code,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            255 => EventCode::Join,
            254 => EventCode::Leave,
            253 => EventCode::PropertiesChanged,
            200 => EventCode::Rpc,
            201 => EventCode::SendSerialize,
            202 => EventCode::Instantiation,
            203 => EventCode::CloseConnection,
            204 => EventCode::Destroy,
            206 => EventCode::SendSerializeReliable,
            207 => EventCode::DestroyPlayer,
            208 => EventCode::AssignMaster,
            209 => EventCode::OwnershipRequest,
            210 => EventCode::OwnershipTransfer,
            other => EventCode::Custom(other),
        }
    }
}

impl CachingOption {
    pub fn to_byte(self) -> u8 {
        match self {
            CachingOption::DoNotCache => 0,
            CachingOption::AddToRoomCache => 4,
            CachingOption::AddToRoomCacheGlobal => 5,
            CachingOption::RemoveFromRoomCache => 6,
            CachingOption::RemoveFromCacheForActorsLeft => 7,
        }
    }

    /// Unknown bytes fall back to `DoNotCache`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            4 => CachingOption::AddToRoomCache,
            5 => CachingOption::AddToRoomCacheGlobal,
            6 => CachingOption::RemoveFromRoomCache,
            7 => CachingOption::RemoveFromCacheForActorsLeft,
            _ => CachingOption::DoNotCache,
        }
    }
}

impl ReceiverGroup {
    pub fn to_byte(self) -> u8 {
        match self {
            ReceiverGroup::Others => 0,
            ReceiverGroup::All => 1,
            ReceiverGroup::MasterClient => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ReceiverGroup::All,
            2 => ReceiverGroup::MasterClient,
            _ => ReceiverGroup::Others,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_event_bytes_decode_to_named_events() {
        for code in [
            EventCode::Join,
            EventCode::Rpc,
            EventCode::SendSerializeReliable,
            EventCode::OwnershipTransfer,
        ] {
            assert_eq!(EventCode::from_byte(code.to_byte()), code);
        }
        assert_eq!(EventCode::from_byte(7), EventCode::Custom(7));
        // 205 is unused by the reserved table.
        assert_eq!(EventCode::from_byte(205), EventCode::Custom(205));
    }

    #[test]
    fn unknown_directives_use_defaults() {
        assert_eq!(CachingOption::from_byte(99), CachingOption::DoNotCache);
        assert_eq!(ReceiverGroup::from_byte(99), ReceiverGroup::Others);
    }
}
