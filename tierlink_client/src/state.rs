// Connection state machine.
//
// The client's connection lifecycle is an explicit transition table:
// `step(state, &context, input) -> Transition { next, effects }`. `step` is a
// pure function; the peer supplies a `Context` snapshot (tier, whether a
// secret is cached, whether a region is chosen, ...) and then executes the
// returned `Effect`s in order. Inputs that have no row for the current state
// leave it unchanged with no effects.
//
// Tier hops are sequenced through the `DisconnectingFrom*` states: the peer
// closes the transport, the transport reports `Disconnected`, and the row for
// `(DisconnectingFromX, Disconnected)` opens the next tier. The backend does
// not multiplex tiers over one connection, so the client is never connected
// to two tiers at once.
//
// See also: `peer.rs` (executes effects), `responses.rs` (turns operation
// responses into `Input`s).

use tierlink_protocol::ServerTier;

use crate::callbacks::Notification;
use crate::error::{DisconnectCause, ServerError};
use crate::transport::StatusCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientState {
    PeerCreated,
    ConnectingToNameServer,
    ConnectedToNameServer,
    DisconnectingFromNameServer,
    ConnectingToMasterServer,
    Authenticating,
    ConnectedToMaster,
    JoinedLobby,
    DisconnectingFromMasterServer,
    ConnectingToGameServer,
    ConnectedToGameServer,
    Joining,
    Joined,
    Leaving,
    DisconnectingFromGameServer,
    Disconnecting,
    Disconnected,
}

impl ClientState {
    pub fn connecting_to(tier: ServerTier) -> Self {
        match tier {
            ServerTier::NameServer => ClientState::ConnectingToNameServer,
            ServerTier::MasterServer => ClientState::ConnectingToMasterServer,
            ServerTier::GameServer => ClientState::ConnectingToGameServer,
        }
    }

    pub fn is_disconnecting(self) -> bool {
        matches!(
            self,
            ClientState::Disconnecting
                | ClientState::DisconnectingFromNameServer
                | ClientState::DisconnectingFromMasterServer
                | ClientState::DisconnectingFromGameServer
        )
    }

    /// States in which the current transport session is live and its
    /// operation responses still belong to the running sequence.
    pub fn accepts_responses(self) -> bool {
        !self.is_disconnecting()
            && !matches!(
                self,
                ClientState::PeerCreated
                    | ClientState::Disconnected
                    | ClientState::ConnectingToNameServer
                    | ClientState::ConnectingToMasterServer
                    | ClientState::ConnectingToGameServer
            )
    }

    /// Still establishing a tier (connect, encryption, authenticate, join):
    /// the phase in which transient faults are retried.
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            ClientState::ConnectingToNameServer
                | ClientState::ConnectedToNameServer
                | ClientState::ConnectingToMasterServer
                | ClientState::Authenticating
                | ClientState::ConnectingToGameServer
                | ClientState::ConnectedToGameServer
                | ClientState::Joining
        )
    }

    /// Ready for matchmaking operations.
    pub fn is_on_master(self) -> bool {
        matches!(self, ClientState::ConnectedToMaster | ClientState::JoinedLobby)
    }
}

/// Everything outside `ClientState` that a transition may depend on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub tier: ServerTier,
    /// The transport is already confidential.
    pub secure: bool,
    pub has_secret: bool,
    pub region_set: bool,
    /// Authenticate was already sent on this transport session.
    pub did_authenticate: bool,
    pub auto_join_lobby: bool,
    /// Between a host-initiated `connect` and the first `Connected`.
    pub initial_connect: bool,
    pub retries_left: u32,
    /// Tier to reopen once the current transport reports `Disconnected`.
    pub retry_tier: Option<ServerTier>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Connect(ServerTier),
    Status(StatusCode),
    Authenticated,
    AuthenticationFailed { error: ServerError, message: String },
    RegionSelected,
    LobbyJoined,
    LobbyLeft,
    /// The master tier placed us in a room on a game server.
    RoomAssigned,
    RoomEntered,
    /// The game tier refused the room operation.
    RoomEntryFailed,
    LeaveRequested,
    LeaveAcknowledged,
    DisconnectRequested,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    OpenTransport(ServerTier),
    CloseTransport,
    EstablishEncryption,
    Authenticate,
    RequestRegions,
    JoinLobby,
    /// Send the stashed create/join operation to the game tier.
    ReissueRoomEntry,
    /// Drop the stashed create/join and report it as failed.
    AbandonRoomEntry,
    InvalidateSecret,
    /// Consume one retry and reopen `tier` after the pending disconnect.
    ScheduleRetry(ServerTier),
    /// Drop a scheduled retry; the pending disconnect is final.
    CancelRetry,
    ResetRetries,
    /// The game-tier session ended: clear room, roster, and runtime objects.
    LeftGameServer,
    Notify(Notification),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub next: ClientState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ClientState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

pub fn step(state: ClientState, ctx: &Context, input: Input) -> Transition {
    match input {
        Input::Connect(tier) => {
            Transition::to(ClientState::connecting_to(tier)).with(Effect::OpenTransport(tier))
        }
        Input::Status(status) => on_status(state, ctx, status),
        Input::Authenticated => on_authenticated(ctx),
        Input::AuthenticationFailed { error, message } => {
            on_authentication_failed(ctx, error, message)
        }
        Input::RegionSelected => {
            if state == ClientState::ConnectedToNameServer && !ctx.did_authenticate {
                Transition::to(state).with(Effect::Authenticate)
            } else {
                Transition::to(state)
            }
        }
        Input::LobbyJoined if state.is_on_master() => {
            Transition::to(ClientState::JoinedLobby).with(Effect::Notify(Notification::JoinedLobby))
        }
        Input::LobbyLeft if state == ClientState::JoinedLobby => {
            Transition::to(ClientState::ConnectedToMaster)
                .with(Effect::Notify(Notification::LeftLobby))
        }
        Input::RoomAssigned if ctx.tier == ServerTier::MasterServer => {
            Transition::to(ClientState::DisconnectingFromMasterServer)
                .with(Effect::CloseTransport)
        }
        Input::RoomEntered if ctx.tier == ServerTier::GameServer => {
            Transition::to(ClientState::Joined)
        }
        Input::RoomEntryFailed | Input::LeaveAcknowledged if ctx.tier == ServerTier::GameServer => {
            Transition::to(ClientState::DisconnectingFromGameServer).with(Effect::CloseTransport)
        }
        Input::LeaveRequested if state == ClientState::Joined => {
            Transition::to(ClientState::Leaving)
        }
        Input::DisconnectRequested => match state {
            ClientState::PeerCreated | ClientState::Disconnected => Transition::to(state),
            // A retry may be scheduled behind the close already in flight.
            ClientState::Disconnecting => Transition::to(state)
                .with(Effect::CancelRetry)
                .with(Effect::AbandonRoomEntry),
            _ => Transition::to(ClientState::Disconnecting)
                .with(Effect::CancelRetry)
                .with(Effect::AbandonRoomEntry)
                .with(Effect::CloseTransport),
        },
        _ => Transition::to(state),
    }
}

fn on_status(state: ClientState, ctx: &Context, status: StatusCode) -> Transition {
    match status {
        StatusCode::Connected => on_connected(state, ctx),
        StatusCode::EncryptionEstablished | StatusCode::EncryptionFailedToEstablish => {
            after_encryption(Transition::to(state), ctx, ctx.did_authenticate)
        }
        StatusCode::Disconnected => on_disconnected(state, ctx),
        fault => on_fault(state, ctx, fault),
    }
}

fn on_connected(state: ClientState, ctx: &Context) -> Transition {
    let mut has_secret = ctx.has_secret;
    let next = match ctx.tier {
        ServerTier::NameServer => state,
        ServerTier::MasterServer => ClientState::Authenticating,
        ServerTier::GameServer => ClientState::ConnectedToGameServer,
    };
    let mut t = Transition::to(next);
    if ctx.tier == ServerTier::NameServer {
        // The discovery tier always gets a fresh authenticate.
        t = t.with(Effect::InvalidateSecret);
        has_secret = false;
    }
    if ctx.secure {
        return after_encryption(t, ctx, ctx.did_authenticate);
    }
    t = t.with(Effect::EstablishEncryption);
    if has_secret && !ctx.did_authenticate {
        // A secret-bearing authenticate need not wait for the key exchange.
        t = t.with(Effect::Authenticate);
    }
    t
}

fn after_encryption(mut t: Transition, ctx: &Context, authenticated: bool) -> Transition {
    let authenticated = authenticated || t.effects.contains(&Effect::Authenticate);
    if ctx.tier == ServerTier::NameServer {
        t.next = ClientState::ConnectedToNameServer;
        if !authenticated {
            if ctx.region_set {
                t = t.with(Effect::Authenticate);
            } else {
                t = t.with(Effect::RequestRegions);
            }
        }
    } else if !authenticated {
        t = t.with(Effect::Authenticate);
    }
    t
}

fn on_disconnected(state: ClientState, ctx: &Context) -> Transition {
    let mut t = if let Some(tier) = ctx.retry_tier {
        Transition::to(ClientState::connecting_to(tier))
    } else {
        match state {
            ClientState::DisconnectingFromMasterServer => {
                Transition::to(ClientState::ConnectingToGameServer)
            }
            ClientState::DisconnectingFromNameServer | ClientState::DisconnectingFromGameServer => {
                Transition::to(ClientState::ConnectingToMasterServer)
            }
            _ => Transition::to(ClientState::Disconnected),
        }
    };
    if ctx.tier == ServerTier::GameServer {
        t = t.with(Effect::LeftGameServer);
    }
    match t.next {
        ClientState::Disconnected => t
            .with(Effect::AbandonRoomEntry)
            .with(Effect::Notify(Notification::Disconnected)),
        ClientState::ConnectingToNameServer => {
            t.with(Effect::OpenTransport(ServerTier::NameServer))
        }
        ClientState::ConnectingToMasterServer => {
            t.with(Effect::OpenTransport(ServerTier::MasterServer))
        }
        ClientState::ConnectingToGameServer => {
            t.with(Effect::OpenTransport(ServerTier::GameServer))
        }
        _ => t,
    }
}

fn on_fault(state: ClientState, ctx: &Context, status: StatusCode) -> Transition {
    if state.is_disconnecting() {
        // Our own close is already in flight; its Disconnected drives the
        // next step.
        return Transition::to(state);
    }
    let cause = match status {
        StatusCode::ExceptionOnConnect => DisconnectCause::ExceptionOnConnect,
        StatusCode::Exception => DisconnectCause::Exception,
        StatusCode::TimeoutDisconnect => DisconnectCause::TimeoutDisconnect,
        StatusCode::DisconnectByServerLogic => DisconnectCause::DisconnectByServerLogic,
        StatusCode::DisconnectByServerUserLimit => DisconnectCause::DisconnectByServerUserLimit,
        _ => DisconnectCause::DisconnectByServer,
    };
    let transient = matches!(
        status,
        StatusCode::ExceptionOnConnect
            | StatusCode::Exception
            | StatusCode::TimeoutDisconnect
            | StatusCode::DisconnectByServer
    );
    let t = Transition::to(ClientState::Disconnecting);
    if transient && state.is_establishing() && ctx.retries_left > 0 {
        return t
            .with(Effect::ScheduleRetry(ctx.tier))
            .with(Effect::CloseTransport);
    }
    let notification = if ctx.initial_connect {
        Notification::FailedToConnect(cause)
    } else {
        Notification::ConnectionFail(cause)
    };
    t.with(Effect::InvalidateSecret)
        .with(Effect::Notify(notification))
        .with(Effect::AbandonRoomEntry)
        .with(Effect::CloseTransport)
}

fn on_authenticated(ctx: &Context) -> Transition {
    match ctx.tier {
        ServerTier::NameServer => Transition::to(ClientState::DisconnectingFromNameServer)
            .with(Effect::ResetRetries)
            .with(Effect::CloseTransport),
        ServerTier::MasterServer => {
            let t = Transition::to(ClientState::ConnectedToMaster).with(Effect::ResetRetries);
            if ctx.auto_join_lobby {
                t.with(Effect::JoinLobby)
            } else {
                t.with(Effect::Notify(Notification::ConnectedToMaster))
            }
        }
        ServerTier::GameServer => Transition::to(ClientState::Joining)
            .with(Effect::ResetRetries)
            .with(Effect::ReissueRoomEntry),
    }
}

fn on_authentication_failed(ctx: &Context, error: ServerError, message: String) -> Transition {
    let t = Transition::to(ClientState::Disconnecting).with(Effect::InvalidateSecret);
    if error == ServerError::AuthenticationTicketExpired && ctx.retries_left > 0 {
        // Retry once more from scratch without the stale ticket.
        return t
            .with(Effect::ScheduleRetry(ctx.tier))
            .with(Effect::CloseTransport);
    }
    let notification = match error {
        ServerError::CustomAuthenticationFailed => Notification::CustomAuthenticationFailed(message),
        ServerError::InvalidAuthentication
        | ServerError::InvalidSession
        | ServerError::InvalidSecurityToken
        | ServerError::InvalidProviderToken
        | ServerError::InvalidPrivilegeToken => {
            Notification::FailedToConnect(DisconnectCause::Authentication(error))
        }
        _ => Notification::ConnectionFail(DisconnectCause::Authentication(error)),
    };
    t.with(Effect::Notify(notification))
        .with(Effect::AbandonRoomEntry)
        .with(Effect::CloseTransport)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tier: ServerTier) -> Context {
        Context {
            tier,
            secure: false,
            has_secret: false,
            region_set: false,
            did_authenticate: false,
            auto_join_lobby: false,
            initial_connect: false,
            retries_left: 0,
            retry_tier: None,
        }
    }

    #[test]
    fn name_tier_without_region_asks_for_regions() {
        let c = ctx(ServerTier::NameServer);
        let t = step(
            ClientState::ConnectingToNameServer,
            &c,
            Input::Status(StatusCode::Connected),
        );
        assert_eq!(t.next, ClientState::ConnectingToNameServer);
        assert_eq!(
            t.effects,
            vec![Effect::InvalidateSecret, Effect::EstablishEncryption]
        );

        let t = step(t.next, &c, Input::Status(StatusCode::EncryptionEstablished));
        assert_eq!(t.next, ClientState::ConnectedToNameServer);
        assert_eq!(t.effects, vec![Effect::RequestRegions]);
    }

    #[test]
    fn name_tier_with_region_authenticates_after_encryption() {
        let c = Context {
            region_set: true,
            ..ctx(ServerTier::NameServer)
        };
        let t = step(
            ClientState::ConnectingToNameServer,
            &c,
            Input::Status(StatusCode::EncryptionEstablished),
        );
        assert_eq!(t.next, ClientState::ConnectedToNameServer);
        assert_eq!(t.effects, vec![Effect::Authenticate]);
    }

    #[test]
    fn region_choice_triggers_authenticate_once() {
        let c = ctx(ServerTier::NameServer);
        let t = step(ClientState::ConnectedToNameServer, &c, Input::RegionSelected);
        assert_eq!(t.effects, vec![Effect::Authenticate]);

        let done = Context {
            did_authenticate: true,
            ..c
        };
        let t = step(ClientState::ConnectedToNameServer, &done, Input::RegionSelected);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn secret_skips_waiting_for_encryption_on_master() {
        let c = Context {
            has_secret: true,
            ..ctx(ServerTier::MasterServer)
        };
        let t = step(
            ClientState::ConnectingToMasterServer,
            &c,
            Input::Status(StatusCode::Connected),
        );
        assert_eq!(t.next, ClientState::Authenticating);
        assert_eq!(
            t.effects,
            vec![Effect::EstablishEncryption, Effect::Authenticate]
        );

        let after = Context {
            did_authenticate: true,
            ..c
        };
        let t = step(
            ClientState::Authenticating,
            &after,
            Input::Status(StatusCode::EncryptionEstablished),
        );
        assert!(t.effects.is_empty(), "no second authenticate");
    }

    #[test]
    fn secure_transport_authenticates_immediately() {
        let c = Context {
            secure: true,
            ..ctx(ServerTier::GameServer)
        };
        let t = step(
            ClientState::ConnectingToGameServer,
            &c,
            Input::Status(StatusCode::Connected),
        );
        assert_eq!(t.next, ClientState::ConnectedToGameServer);
        assert_eq!(t.effects, vec![Effect::Authenticate]);
    }

    #[test]
    fn hops_follow_the_disconnecting_state() {
        let c = ctx(ServerTier::NameServer);
        let t = step(
            ClientState::DisconnectingFromNameServer,
            &c,
            Input::Status(StatusCode::Disconnected),
        );
        assert_eq!(t.next, ClientState::ConnectingToMasterServer);
        assert_eq!(
            t.effects,
            vec![Effect::OpenTransport(ServerTier::MasterServer)]
        );

        let c = ctx(ServerTier::MasterServer);
        let t = step(
            ClientState::DisconnectingFromMasterServer,
            &c,
            Input::Status(StatusCode::Disconnected),
        );
        assert_eq!(t.next, ClientState::ConnectingToGameServer);

        let c = ctx(ServerTier::GameServer);
        let t = step(
            ClientState::DisconnectingFromGameServer,
            &c,
            Input::Status(StatusCode::Disconnected),
        );
        assert_eq!(t.next, ClientState::ConnectingToMasterServer);
        assert_eq!(
            t.effects,
            vec![
                Effect::LeftGameServer,
                Effect::OpenTransport(ServerTier::MasterServer)
            ]
        );
    }

    #[test]
    fn plain_disconnect_is_terminal() {
        let c = ctx(ServerTier::MasterServer);
        let t = step(
            ClientState::Disconnecting,
            &c,
            Input::Status(StatusCode::Disconnected),
        );
        assert_eq!(t.next, ClientState::Disconnected);
        assert_eq!(
            t.effects,
            vec![
                Effect::AbandonRoomEntry,
                Effect::Notify(Notification::Disconnected)
            ]
        );
    }

    #[test]
    fn transient_fault_retries_while_budget_lasts() {
        let c = Context {
            retries_left: 1,
            initial_connect: true,
            ..ctx(ServerTier::MasterServer)
        };
        let t = step(
            ClientState::ConnectingToMasterServer,
            &c,
            Input::Status(StatusCode::ExceptionOnConnect),
        );
        assert_eq!(t.next, ClientState::Disconnecting);
        assert_eq!(
            t.effects,
            vec![
                Effect::ScheduleRetry(ServerTier::MasterServer),
                Effect::CloseTransport
            ]
        );

        let retrying = Context {
            retries_left: 0,
            retry_tier: Some(ServerTier::MasterServer),
            ..c.clone()
        };
        let t = step(
            ClientState::Disconnecting,
            &retrying,
            Input::Status(StatusCode::Disconnected),
        );
        assert_eq!(t.next, ClientState::ConnectingToMasterServer);

        let exhausted = Context {
            retries_left: 0,
            ..c
        };
        let t = step(
            ClientState::ConnectingToMasterServer,
            &exhausted,
            Input::Status(StatusCode::ExceptionOnConnect),
        );
        assert!(t.effects.contains(&Effect::InvalidateSecret));
        assert!(t.effects.contains(&Effect::Notify(Notification::FailedToConnect(
            DisconnectCause::ExceptionOnConnect
        ))));
    }

    #[test]
    fn fault_after_join_is_a_connection_fail() {
        let c = Context {
            retries_left: 3,
            ..ctx(ServerTier::GameServer)
        };
        let t = step(
            ClientState::Joined,
            &c,
            Input::Status(StatusCode::TimeoutDisconnect),
        );
        assert_eq!(
            t.effects,
            vec![
                Effect::InvalidateSecret,
                Effect::Notify(Notification::ConnectionFail(
                    DisconnectCause::TimeoutDisconnect
                )),
                Effect::AbandonRoomEntry,
                Effect::CloseTransport,
            ]
        );
    }

    #[test]
    fn authentication_failures_map_to_notifications() {
        let c = ctx(ServerTier::MasterServer);
        let t = step(
            ClientState::Authenticating,
            &c,
            Input::AuthenticationFailed {
                error: ServerError::CustomAuthenticationFailed,
                message: "bad ticket".into(),
            },
        );
        assert!(t.effects.contains(&Effect::Notify(
            Notification::CustomAuthenticationFailed("bad ticket".into())
        )));

        let t = step(
            ClientState::Authenticating,
            &c,
            Input::AuthenticationFailed {
                error: ServerError::MaxCcuReached,
                message: String::new(),
            },
        );
        assert!(t.effects.contains(&Effect::Notify(Notification::ConnectionFail(
            DisconnectCause::Authentication(ServerError::MaxCcuReached)
        ))));
        assert_eq!(t.effects.last(), Some(&Effect::CloseTransport));
    }

    #[test]
    fn master_authentication_joins_lobby_or_reports() {
        let auto = Context {
            auto_join_lobby: true,
            ..ctx(ServerTier::MasterServer)
        };
        let t = step(ClientState::Authenticating, &auto, Input::Authenticated);
        assert_eq!(t.next, ClientState::ConnectedToMaster);
        assert!(t.effects.contains(&Effect::JoinLobby));

        let manual = ctx(ServerTier::MasterServer);
        let t = step(ClientState::Authenticating, &manual, Input::Authenticated);
        assert!(
            t.effects
                .contains(&Effect::Notify(Notification::ConnectedToMaster))
        );
    }

    #[test]
    fn game_authentication_reissues_room_entry() {
        let c = ctx(ServerTier::GameServer);
        let t = step(ClientState::ConnectedToGameServer, &c, Input::Authenticated);
        assert_eq!(t.next, ClientState::Joining);
        assert!(t.effects.contains(&Effect::ReissueRoomEntry));
    }

    #[test]
    fn room_inputs_are_tier_checked() {
        let master = ctx(ServerTier::MasterServer);
        let t = step(ClientState::ConnectedToMaster, &master, Input::RoomEntered);
        assert_eq!(t.next, ClientState::ConnectedToMaster);
        assert!(t.effects.is_empty());

        let t = step(ClientState::JoinedLobby, &master, Input::RoomAssigned);
        assert_eq!(t.next, ClientState::DisconnectingFromMasterServer);
    }

    #[test]
    fn faults_while_disconnecting_are_ignored() {
        let c = ctx(ServerTier::MasterServer);
        let t = step(
            ClientState::DisconnectingFromMasterServer,
            &c,
            Input::Status(StatusCode::TimeoutDisconnect),
        );
        assert_eq!(t.next, ClientState::DisconnectingFromMasterServer);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn disconnect_during_scheduled_retry_is_final() {
        let c = Context {
            retries_left: 1,
            ..ctx(ServerTier::MasterServer)
        };
        let t = step(
            ClientState::ConnectingToMasterServer,
            &c,
            Input::Status(StatusCode::TimeoutDisconnect),
        );
        assert!(
            t.effects
                .contains(&Effect::ScheduleRetry(ServerTier::MasterServer))
        );

        let t = step(ClientState::Disconnecting, &c, Input::DisconnectRequested);
        assert_eq!(t.next, ClientState::Disconnecting);
        assert_eq!(
            t.effects,
            vec![Effect::CancelRetry, Effect::AbandonRoomEntry]
        );
    }

    #[test]
    fn host_disconnect_abandons_room_entry_before_closing() {
        let c = ctx(ServerTier::MasterServer);
        let t = step(ClientState::JoinedLobby, &c, Input::DisconnectRequested);
        assert_eq!(t.next, ClientState::Disconnecting);
        assert_eq!(
            t.effects,
            vec![
                Effect::CancelRetry,
                Effect::AbandonRoomEntry,
                Effect::CloseTransport
            ]
        );

        let t = step(ClientState::Disconnected, &c, Input::DisconnectRequested);
        assert!(t.effects.is_empty());
    }
}
