// Operation-response dispatch.
//
// `Peer::on_response` is the single entry point for correlated answers. A
// response is matched by operation code and by the tier the peer is on now;
// responses that arrive while the peer is between sessions (connecting,
// disconnecting, disconnected) belong to a superseded sequence and are
// dropped.
//
// Success paths feed `Input`s into the state machine (authenticated, room
// assigned, room entered, ...) and update room state. Failure paths map the
// return code to a `ServerError`, emit the matching notification, and
// invalidate the reconnection secret where the error demands it. Nothing
// here returns an error: every failure terminates in a log line or a
// notification.

use log::{debug, error, info, warn};
use tierlink_protocol::{
    ActorId, OperationCode, OperationResponse, ParamsExt, Properties, ServerTier, Value, keys,
};

use crate::callbacks::{FriendInfo, Notification, Region};
use crate::error::ServerError;
use crate::operations::EntryKind;
use crate::peer::Peer;
use crate::room::Room;
use crate::state::Input;
use crate::transport::Transport;

impl<T: Transport> Peer<T> {
    pub(crate) fn on_response(&mut self, response: OperationResponse) {
        if !self.state.accepts_responses() {
            debug!(
                "dropping {:?} response received in {:?}",
                response.code, self.state
            );
            return;
        }
        if let Some(secret) = response.params.string(keys::SECRET) {
            self.secret = Some(secret.to_owned());
        }
        let failure = ServerError::from_code(response.return_code);
        if response.code != OperationCode::Authenticate
            && failure.is_some_and(ServerError::invalidates_secret)
        {
            self.secret = None;
        }
        match response.code {
            OperationCode::Authenticate => self.on_authenticate_response(&response, failure),
            OperationCode::GetRegions => self.on_regions_response(&response, failure),
            OperationCode::JoinLobby => match failure {
                None => self.apply(Input::LobbyJoined),
                Some(err) => error!("join lobby failed: {err:?}"),
            },
            OperationCode::LeaveLobby => match failure {
                None => self.apply(Input::LobbyLeft),
                Some(err) => error!("leave lobby failed: {err:?}"),
            },
            OperationCode::CreateGame | OperationCode::JoinGame | OperationCode::JoinRandomGame => {
                match self.tier {
                    ServerTier::MasterServer => self.on_master_entry_response(&response, failure),
                    ServerTier::GameServer => self.on_game_entry_response(&response, failure),
                    ServerTier::NameServer => {
                        warn!("{:?} response on the name tier", response.code)
                    }
                }
            }
            OperationCode::Leave => {
                if let Some(err) = failure {
                    warn!("leave answered with {err:?}; closing anyway");
                }
                self.apply(Input::LeaveAcknowledged);
            }
            OperationCode::SetProperties => {
                if let Some(err) = failure {
                    warn!(
                        "set properties refused ({err:?}): {}",
                        message_of(&response)
                    );
                }
            }
            OperationCode::GetProperties => self.on_get_properties_response(&response, failure),
            OperationCode::FindFriends => self.on_find_friends_response(&response, failure),
            OperationCode::WebRpc => self.on_web_rpc_response(&response, failure),
            OperationCode::RaiseEvent | OperationCode::ChangeGroups => {
                if let Some(err) = failure {
                    warn!("{:?} refused: {err:?}", response.code);
                }
            }
        }
    }

    fn on_authenticate_response(
        &mut self,
        response: &OperationResponse,
        failure: Option<ServerError>,
    ) {
        if let Some(error) = failure {
            error!(
                "authentication on {:?} failed with {error:?}: {}",
                self.tier,
                message_of(response)
            );
            self.apply(Input::AuthenticationFailed {
                error,
                message: message_of(response),
            });
            return;
        }
        if self.tier == ServerTier::NameServer {
            match response.params.string(keys::ADDRESS) {
                Some(address) => self.master_address = Some(address.to_owned()),
                None => {
                    error!("name tier authenticated without a master address");
                    return;
                }
            }
        }
        info!("authenticated on {:?}", self.tier);
        self.apply(Input::Authenticated);
    }

    fn on_regions_response(&mut self, response: &OperationResponse, failure: Option<ServerError>) {
        if let Some(err) = failure {
            error!("region list request failed: {err:?}");
            return;
        }
        let codes = response.params.array(keys::REGION_CODES).unwrap_or_default();
        let addresses = response
            .params
            .array(keys::REGION_ADDRESSES)
            .unwrap_or_default();
        if codes.len() != addresses.len() {
            error!(
                "malformed region list: {} codes but {} addresses",
                codes.len(),
                addresses.len()
            );
            return;
        }
        let regions: Vec<Region> = codes
            .iter()
            .zip(addresses)
            .filter_map(|(code, address)| {
                Some(Region {
                    code: code.as_str()?.to_owned(),
                    address: address.as_str()?.to_owned(),
                })
            })
            .collect();
        debug!("{} region(s) offered", regions.len());
        self.regions = regions.clone();
        self.bus.emit(Notification::RegionListReceived(regions));
    }

    /// The master tier either placed us (address of the game tier) or
    /// refused the request outright.
    fn on_master_entry_response(
        &mut self,
        response: &OperationResponse,
        failure: Option<ServerError>,
    ) {
        let Some(pending) = self.pending.as_mut() else {
            warn!("{:?} response with no room entry pending", response.code);
            return;
        };
        if let Some(err) = failure {
            let kind = pending.kind;
            self.pending = None;
            self.bus.emit(entry_failed(kind, err, message_of(response)));
            return;
        }
        let Some(address) = response.params.string(keys::ADDRESS) else {
            error!("{:?} response without a game tier address", response.code);
            self.abandon_room_entry(
                ServerError::InvalidOperation,
                "no game tier address in the response",
            );
            return;
        };
        if let Some(name) = response.params.string(keys::ROOM_NAME) {
            pending.params.room_name = Some(name.to_owned());
        }
        if pending.kind == EntryKind::JoinRandom {
            // The game tier only knows named rooms.
            pending.kind = EntryKind::Join;
            pending.params.expected_properties.clear();
            pending.params.expected_max_players = 0;
        }
        info!(
            "room {:?} is hosted at {address}",
            pending.params.room_name.as_deref().unwrap_or("?")
        );
        self.game_address = Some(address.to_owned());
        self.apply(Input::RoomAssigned);
    }

    fn on_game_entry_response(
        &mut self,
        response: &OperationResponse,
        failure: Option<ServerError>,
    ) {
        let Some(pending) = self.pending.take() else {
            warn!("{:?} response with no room entry pending", response.code);
            return;
        };
        if let Some(err) = failure {
            self.bus
                .emit(entry_failed(pending.kind, err, message_of(response)));
            self.apply(Input::RoomEntryFailed);
            return;
        }

        let params = &response.params;
        let local = params.actor(keys::ACTOR_NR).unwrap_or(ActorId::NONE);
        let name = params
            .string(keys::ROOM_NAME)
            .map(str::to_owned)
            .or(pending.params.room_name)
            .unwrap_or_default();
        let mut room = Room::new(name.clone(), local, self.config.auto_cleanup_player_objects);
        if let Some(actors) = params.array(keys::ACTOR_LIST) {
            room.seed_actors(actors.iter().filter_map(Value::as_actor));
        }
        if let Some(properties) = params.map(keys::ROOM_PROPERTIES) {
            room.merge_properties(properties);
        }
        if params.boolean(keys::SERVER_SIDE_MASTER) == Some(true) {
            room.server_side_master = true;
        }
        if let Some(player) = room.player_mut(local) {
            player.merge_properties(&self.local_properties);
        }
        if let Some(by_actor) = params.map(keys::PLAYER_PROPERTIES) {
            merge_player_properties(&mut room, by_actor);
        }
        match params.actor(keys::MASTER_CLIENT_ID) {
            Some(master) if master.is_assigned() => {
                room.set_master(master);
            }
            _ if room.server_side_master && room.master_client_id.is_assigned() => {}
            _ => {
                room.elect_master(None);
            }
        }
        info!(
            "entered room {name} as {local:?} ({} player(s), master {:?})",
            room.player_count(),
            room.master_client_id
        );

        self.local_actor = local;
        self.room = Some(room);
        self.views.reset_outgoing_baselines();
        self.last_room = Some(name);
        if pending.kind == EntryKind::Create {
            self.bus.emit(Notification::CreatedRoom);
        }
        self.bus.emit(Notification::JoinedRoom);
        self.apply(Input::RoomEntered);
    }

    fn on_get_properties_response(
        &mut self,
        response: &OperationResponse,
        failure: Option<ServerError>,
    ) {
        if let Some(err) = failure {
            warn!("get properties failed: {err:?}");
            return;
        }
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if let Some(properties) = response.params.map(keys::ROOM_PROPERTIES) {
            room.merge_properties(properties);
        }
        if let Some(by_actor) = response.params.map(keys::PLAYER_PROPERTIES) {
            merge_player_properties(room, by_actor);
        }
        self.bus.emit(Notification::PropertiesReceived);
    }

    fn on_find_friends_response(
        &mut self,
        response: &OperationResponse,
        failure: Option<ServerError>,
    ) {
        let query = std::mem::take(&mut self.friend_query);
        if let Some(err) = failure {
            warn!("find friends failed: {err:?}");
            return;
        }
        let online = response.params.array(keys::FRIENDS_ONLINE).unwrap_or_default();
        let rooms = response.params.array(keys::FRIENDS_ROOMS).unwrap_or_default();
        let friends = query
            .into_iter()
            .enumerate()
            .map(|(i, user_id)| FriendInfo {
                user_id,
                is_online: online.get(i).and_then(Value::as_bool).unwrap_or(false),
                room: rooms
                    .get(i)
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned),
            })
            .collect();
        self.bus.emit(Notification::FriendListUpdated(friends));
    }

    fn on_web_rpc_response(&mut self, response: &OperationResponse, failure: Option<ServerError>) {
        if let Some(err) = failure {
            warn!("web rpc failed: {err:?}: {}", message_of(response));
            return;
        }
        let params = &response.params;
        self.bus.emit(Notification::WebRpcResponse {
            path: params.string(keys::URI_PATH).unwrap_or_default().to_owned(),
            return_code: params.int(keys::WEB_RPC_RETURN_CODE).unwrap_or(0),
            data: params
                .value(keys::WEB_RPC_RETURN_DATA)
                .cloned()
                .unwrap_or(Value::Null),
        });
    }
}

fn message_of(response: &OperationResponse) -> String {
    response.debug_message.clone().unwrap_or_default()
}

pub(crate) fn entry_failed(kind: EntryKind, err: ServerError, message: String) -> Notification {
    match kind {
        EntryKind::Create => Notification::CreateRoomFailed(err, message),
        EntryKind::Join => Notification::JoinRoomFailed(err, message),
        EntryKind::JoinRandom => Notification::JoinRandomFailed(err, message),
    }
}

/// Player properties arrive keyed by the actor number as a string.
fn merge_player_properties(room: &mut Room, by_actor: &Properties) {
    for (key, value) in by_actor {
        let (Ok(id), Some(changed)) = (key.parse::<i32>(), value.as_map()) else {
            debug!("skipping player properties under key {key:?}");
            continue;
        };
        let actor = ActorId(id);
        room.seed_actors([actor]);
        if let Some(player) = room.player_mut(actor) {
            player.merge_properties(changed);
        }
    }
}
