// Error taxonomy for the relay client.
//
// Four families, matching how far each one propagates:
// - `ClientError`: returned from public `Peer` methods when a request cannot
//   even be issued (wrong state, unknown view, transport write failure).
// - `ServerError`: a nonzero backend return code on an operation response.
//   Never returned; mapped to a `Notification` and, for some codes, to
//   secret invalidation.
// - `DisconnectCause`: why a transport session ended; carried by the
//   `FailedToConnect` / `ConnectionFail` notifications.
// - `DispatchFault`: a local problem with one inbound frame (missing view,
//   stale level prefix, no RPC match). Logged and dropped by the dispatcher;
//   the session stays live.

use thiserror::Error;
use tierlink_protocol::{ActorId, OperationCode, ViewId, return_code};

use crate::state::ClientState;

/// Failures of public client calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("peer is disconnecting; try again once it reports Disconnected")]
    Busy,
    #[error("{op:?} is not allowed in state {state:?}")]
    InvalidState {
        op: OperationCode,
        state: ClientState,
    },
    #[error("not inside a room")]
    NotInRoom,
    #[error("only the master client may do this")]
    NotMasterClient,
    #[error("actor {0:?} is not in the room")]
    UnknownActor(ActorId),
    #[error("no view with id {0:?}")]
    UnknownView(ViewId),
    #[error("view {0:?} is not controlled by this client")]
    NotOwner(ViewId),
    #[error("actor {0:?} has no free view ids left")]
    ViewIdsExhausted(ActorId),
    #[error("object host refused to instantiate {template}: {reason}")]
    Instantiate { template: String, reason: String },
    #[error("no address known for the {0}")]
    MissingAddress(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Classified nonzero return code of an operation response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerError {
    InternalServerError,
    InvalidOperation,
    OperationNotAllowed,
    InvalidAuthentication,
    CustomAuthenticationFailed,
    AuthenticationTicketExpired,
    InvalidRegion,
    MaxCcuReached,
    InvalidSession,
    InvalidSecurityToken,
    InvalidProviderToken,
    InvalidPrivilegeToken,
    ServerFull,
    UserBlocked,
    GameIdAlreadyExists,
    GameFull,
    GameClosed,
    GameDoesNotExist,
    NoRandomMatchFound,
    Other(i16),
}

impl ServerError {
    /// `None` for `return_code::OK`.
    pub fn from_code(code: i16) -> Option<Self> {
        use return_code as rc;
        let err = match code {
            rc::OK => return None,
            rc::INTERNAL_SERVER_ERROR => ServerError::InternalServerError,
            rc::INVALID_OPERATION => ServerError::InvalidOperation,
            rc::OPERATION_NOT_ALLOWED => ServerError::OperationNotAllowed,
            rc::INVALID_AUTHENTICATION => ServerError::InvalidAuthentication,
            rc::CUSTOM_AUTHENTICATION_FAILED => ServerError::CustomAuthenticationFailed,
            rc::AUTHENTICATION_TICKET_EXPIRED => ServerError::AuthenticationTicketExpired,
            rc::INVALID_REGION => ServerError::InvalidRegion,
            rc::MAX_CCU_REACHED => ServerError::MaxCcuReached,
            rc::INVALID_SESSION => ServerError::InvalidSession,
            rc::INVALID_SECURITY_TOKEN => ServerError::InvalidSecurityToken,
            rc::INVALID_PROVIDER_TOKEN => ServerError::InvalidProviderToken,
            rc::INVALID_PRIVILEGE_TOKEN => ServerError::InvalidPrivilegeToken,
            rc::SERVER_FULL => ServerError::ServerFull,
            rc::USER_BLOCKED => ServerError::UserBlocked,
            rc::GAME_ID_ALREADY_EXISTS => ServerError::GameIdAlreadyExists,
            rc::GAME_FULL => ServerError::GameFull,
            rc::GAME_CLOSED => ServerError::GameClosed,
            rc::GAME_DOES_NOT_EXIST => ServerError::GameDoesNotExist,
            rc::NO_RANDOM_MATCH_FOUND => ServerError::NoRandomMatchFound,
            other => ServerError::Other(other),
        };
        Some(err)
    }

    /// Failures after which the cached reconnection secret must not be
    /// replayed.
    pub fn invalidates_secret(self) -> bool {
        matches!(
            self,
            ServerError::InvalidAuthentication
                | ServerError::AuthenticationTicketExpired
                | ServerError::InvalidSession
                | ServerError::InvalidSecurityToken
                | ServerError::InvalidProviderToken
                | ServerError::InvalidPrivilegeToken
        )
    }
}

/// Why a transport session (or the attempt to open one) ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectCause {
    ExceptionOnConnect,
    Exception,
    TimeoutDisconnect,
    DisconnectByServer,
    DisconnectByServerLogic,
    DisconnectByServerUserLimit,
    /// The backend rejected authentication.
    Authentication(ServerError),
}

/// A dropped inbound frame. Never fatal.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum DispatchFault {
    #[error("no view {0:?}; dropping (normal right after a destroy)")]
    MissingView(ViewId),
    #[error("view {view:?} has level prefix {expected}, frame carried {received}")]
    PrefixMismatch {
        view: ViewId,
        expected: i16,
        received: i16,
    },
    #[error("no method named {name:?} on view {view:?}")]
    NoMethod { view: ViewId, name: String },
    #[error("no method {name:?} on view {view:?} takes {arg_count} argument(s) of these types")]
    NoMatchingSignature {
        view: ViewId,
        name: String,
        arg_count: usize,
    },
    #[error("{count} methods named {name:?} on view {view:?} accept these arguments; should be just one")]
    Ambiguous {
        view: ViewId,
        name: String,
        count: usize,
    },
    #[error("rpc shortcut index {0} is outside the shared table")]
    UnknownShortcut(i64),
    #[error("no baseline yet for compressed update of view {0:?}; skipping")]
    MissingBaseline(ViewId),
    #[error("malformed {0}")]
    Malformed(&'static str),
}
