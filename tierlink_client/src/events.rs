// Room-event dispatch.
//
// `Peer::on_event` routes one inbound `EventData` by code. Backend events
// (join, leave, property change) maintain the roster; client-raised events
// with fixed meaning are handed to the replication, object, and ownership
// handlers; anything else is an application event and surfaces as
// `EventReceived`.
//
// Every handler tolerates duplicates and unknown ids: a second join for a
// known actor only refreshes it, a leave for an unknown actor is logged, and
// events for views that no longer exist are dropped by the handlers they
// reach.

use log::{debug, info, warn};
use tierlink_protocol::{ActorId, EventCode, EventData, ParamsExt, Value, keys};

use crate::callbacks::Notification;
use crate::peer::Peer;
use crate::room::Player;
use crate::transport::Transport;

impl<T: Transport> Peer<T> {
    pub(crate) fn on_event(&mut self, event: EventData) {
        if self.room.is_none() {
            debug!("dropping {:?} event outside a room", event.code);
            return;
        }
        let sender = event.sender().unwrap_or(ActorId::NONE);
        match event.code {
            EventCode::Join => self.on_join_event(sender, &event),
            EventCode::Leave => self.on_leave_event(sender, &event),
            EventCode::PropertiesChanged => self.on_properties_event(&event),
            EventCode::Rpc => self.on_rpc(sender, event.data()),
            EventCode::SendSerialize | EventCode::SendSerializeReliable => {
                self.on_sync_batch(sender, event.data())
            }
            EventCode::Instantiation => self.on_instantiation(sender, event.data()),
            EventCode::Destroy => self.on_destroy(sender, event.data()),
            EventCode::DestroyPlayer => self.on_destroy_player(sender, event.data()),
            EventCode::AssignMaster => self.on_assign_master(sender, event.data()),
            EventCode::OwnershipRequest => self.on_ownership_request(sender, event.data()),
            EventCode::OwnershipTransfer => self.on_ownership_transfer(sender, event.data()),
            EventCode::CloseConnection => self.on_close_connection(sender),
            code @ EventCode::Custom(_) => {
                let data = event.data().clone();
                self.bus.emit(Notification::EventReceived {
                    code,
                    sender: event.sender(),
                    data,
                });
            }
        }
    }

    fn on_join_event(&mut self, actor: ActorId, event: &EventData) {
        let local = self.local_actor;
        let Some(room) = self.room.as_mut() else {
            return;
        };
        // Roster status before the actor list can add the newcomer.
        let known_inactive = room.player(actor).map(|p| p.is_inactive);
        if let Some(actors) = event.params.array(keys::ACTOR_LIST) {
            room.seed_actors(actors.iter().filter_map(Value::as_actor));
        }
        if actor == local || !actor.is_assigned() {
            return;
        }
        let notification = match known_inactive {
            Some(true) => {
                if let Some(player) = room.player_mut(actor) {
                    player.is_inactive = false;
                }
                Some(Notification::PlayerActivityChanged {
                    actor,
                    inactive: false,
                })
            }
            Some(false) => None,
            None => {
                room.add_player(Player::new(actor, false));
                Some(Notification::PlayerConnected(actor))
            }
        };
        if let (Some(player), Some(properties)) =
            (room.player_mut(actor), event.params.map(keys::PLAYER_PROPERTIES))
        {
            player.merge_properties(properties);
        }
        let Some(notification) = notification else {
            debug!("repeated join for active {actor:?}; properties refreshed");
            return;
        };
        info!("{actor:?} joined ({} player(s))", room.player_count());
        let change = room.elect_master(None);
        if let Some(change) = change
            && change.previous.is_assigned()
        {
            self.bus.emit(Notification::MasterSwitched {
                previous: change.previous,
                current: change.current,
            });
        }
        // The newcomer has no baseline for anything we send.
        self.views.reset_outgoing_baselines();
        self.bus.emit(notification);
    }

    fn on_leave_event(&mut self, actor: ActorId, event: &EventData) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        if !room.contains(actor) {
            debug!("leave event for unknown actor {actor:?}");
            return;
        }
        if event.params.boolean(keys::IS_INACTIVE) == Some(true) {
            if let Some(player) = room.player_mut(actor) {
                if player.is_inactive {
                    debug!("{actor:?} is already inactive");
                    return;
                }
                player.is_inactive = true;
            }
            info!("{actor:?} became inactive");
            self.bus.emit(Notification::PlayerActivityChanged {
                actor,
                inactive: true,
            });
            return;
        }
        let auto_cleanup = room.auto_cleanup;
        let change = match event.params.actor(keys::MASTER_CLIENT_ID) {
            Some(master) if master.is_assigned() => room.set_master(master),
            _ => room.elect_master(Some(actor)),
        };
        room.remove_player(actor);
        info!("{actor:?} left ({} player(s))", room.player_count());
        if auto_cleanup {
            self.cleanup_actor_objects(actor);
        }
        if let Some(change) = change
            && change.previous.is_assigned()
        {
            self.bus.emit(Notification::MasterSwitched {
                previous: change.previous,
                current: change.current,
            });
        }
        self.bus.emit(Notification::PlayerDisconnected(actor));
    }

    fn on_properties_event(&mut self, event: &EventData) {
        let Some(changed) = event.params.map(keys::PROPERTIES) else {
            warn!("property change event without properties");
            return;
        };
        match event.params.actor(keys::TARGET_ACTOR_NR) {
            Some(ActorId(0)) | None => self.apply_room_properties(changed),
            Some(actor) => self.apply_player_properties(actor, changed),
        }
    }

    /// `{ 1: actor }` from the current master.
    fn on_assign_master(&mut self, sender: ActorId, data: &Value) {
        let Some(actor) = data.as_table().and_then(|t| t.actor(1)) else {
            warn!("malformed assign-master event from {sender:?}");
            return;
        };
        let Some(room) = self.room.as_ref() else {
            return;
        };
        if !room.is_master(sender) {
            warn!(
                "{sender:?} assigned master to {actor:?} but {:?} is master",
                room.master_client_id
            );
        }
        if !room.contains(actor) {
            warn!("assign-master names unknown actor {actor:?}");
            return;
        }
        self.switch_master(actor);
    }

    fn on_close_connection(&mut self, sender: ActorId) {
        let from_master = self.room.as_ref().is_some_and(|r| r.is_master(sender));
        if !from_master {
            warn!("ignoring close-connection request from non-master {sender:?}");
            return;
        }
        info!("master {sender:?} asked us to leave");
        if let Err(e) = self.leave_room(false) {
            warn!("cannot leave after close-connection: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::{Params, Properties, ViewId};

    use super::*;
    use crate::peer::testing::{drain_notifications, joined_peer};
    use crate::view::View;

    fn backend_event(code: EventCode, actor: i32, extra: Params) -> EventData {
        let mut params = extra;
        params.insert(keys::ACTOR_NR, Value::from(actor));
        EventData { code, params }
    }

    #[test]
    fn master_leaving_elects_the_lowest_remaining_actor() {
        let (mut peer, _remote) = joined_peer(2, &[1, 3]);
        peer.switch_master(ActorId(3));
        drain_notifications(&mut peer);

        peer.on_event(backend_event(EventCode::Leave, 3, Params::new()));
        let room = peer.room().unwrap();
        assert_eq!(room.master_client_id, ActorId(1));
        assert!(!room.contains(ActorId(3)));

        let notes = drain_notifications(&mut peer);
        let switches: Vec<_> = notes
            .iter()
            .filter(|n| matches!(n, Notification::MasterSwitched { .. }))
            .collect();
        assert_eq!(
            switches,
            vec![&Notification::MasterSwitched {
                previous: ActorId(3),
                current: ActorId(1),
            }]
        );
        assert_eq!(notes.last(), Some(&Notification::PlayerDisconnected(ActorId(3))));
    }

    #[test]
    fn leave_event_naming_the_master_wins_over_election() {
        let (mut peer, _remote) = joined_peer(1, &[2, 3]);
        let extra = Params::from([(keys::MASTER_CLIENT_ID, Value::from(3))]);
        peer.on_event(backend_event(EventCode::Leave, 2, extra));
        assert_eq!(peer.room().unwrap().master_client_id, ActorId(3));
        assert!(!peer.is_master_client());
    }

    #[test]
    fn inactive_member_stays_and_reactivates_on_rejoin() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let extra = Params::from([(keys::IS_INACTIVE, Value::from(true))]);
        peer.on_event(backend_event(EventCode::Leave, 2, extra));
        let room = peer.room().unwrap();
        assert!(room.contains(ActorId(2)));
        assert!(!room.is_active(ActorId(2)));
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::PlayerActivityChanged {
                actor: ActorId(2),
                inactive: true,
            }]
        );

        peer.on_event(backend_event(EventCode::Join, 2, Params::new()));
        assert!(peer.room().unwrap().is_active(ActorId(2)));
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::PlayerActivityChanged {
                actor: ActorId(2),
                inactive: false,
            }]
        );
    }

    #[test]
    fn join_adds_the_newcomer_with_its_properties() {
        let (mut peer, _remote) = joined_peer(1, &[]);
        let mut props = Properties::new();
        props.insert("#name".into(), Value::from("bob"));
        let extra = Params::from([
            (keys::PLAYER_PROPERTIES, Value::Map(props)),
            (
                keys::ACTOR_LIST,
                Value::Array(vec![Value::from(1), Value::from(4)]),
            ),
        ]);
        peer.on_event(backend_event(EventCode::Join, 4, extra));
        let room = peer.room().unwrap();
        assert_eq!(room.player_count(), 2);
        assert_eq!(room.player(ActorId(4)).unwrap().nick_name, "bob");
        assert_eq!(room.master_client_id, ActorId(1));
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::PlayerConnected(ActorId(4))]
        );
    }

    #[test]
    fn property_event_without_target_changes_the_room() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let mut changed = Properties::new();
        changed.insert("map".into(), Value::from("forest"));
        changed.insert("#open".into(), Value::from(false));
        let extra = Params::from([
            (keys::TARGET_ACTOR_NR, Value::from(0)),
            (keys::PROPERTIES, Value::Map(changed.clone())),
        ]);
        peer.on_event(backend_event(EventCode::PropertiesChanged, 2, extra));
        let room = peer.room().unwrap();
        assert_eq!(room.properties.get("map"), Some(&Value::from("forest")));
        assert!(!room.is_open);
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::RoomPropertiesChanged(changed)]
        );
    }

    #[test]
    fn assign_master_from_unknown_actor_is_ignored() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let data = Value::Table(Params::from([(1, Value::from(9))]));
        let extra = Params::from([(keys::DATA, data)]);
        peer.on_event(backend_event(EventCode::AssignMaster, 2, extra));
        assert_eq!(peer.room().unwrap().master_client_id, ActorId(1));
    }

    #[test]
    fn close_connection_is_only_honored_from_the_master() {
        let (mut peer, remote) = joined_peer(2, &[1, 3]);
        peer.on_event(backend_event(EventCode::CloseConnection, 3, Params::new()));
        assert!(remote.sent_codes().is_empty());

        peer.on_event(backend_event(EventCode::CloseConnection, 1, Params::new()));
        assert_eq!(
            remote.sent_codes(),
            vec![tierlink_protocol::OperationCode::Leave]
        );
    }

    #[test]
    fn custom_events_surface_to_the_host() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let extra = Params::from([(keys::DATA, Value::from(7))]);
        peer.on_event(backend_event(EventCode::Custom(42), 2, extra));
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::EventReceived {
                code: EventCode::Custom(42),
                sender: Some(ActorId(2)),
                data: Value::from(7),
            }]
        );
    }

    #[test]
    fn repeated_join_only_refreshes_properties() {
        let (mut peer, _remote) = joined_peer(1, &[]);
        let join = |nick: &str| {
            let mut props = Properties::new();
            props.insert("#name".into(), Value::from(nick));
            backend_event(
                EventCode::Join,
                4,
                Params::from([
                    (keys::PLAYER_PROPERTIES, Value::Map(props)),
                    (
                        keys::ACTOR_LIST,
                        Value::Array(vec![Value::from(1), Value::from(4)]),
                    ),
                ]),
            )
        };
        peer.on_event(join("bob"));
        drain_notifications(&mut peer);
        let mut view = View::new(ViewId(1001), ActorId(1));
        view.state.last_sent = Some(vec![Value::from(1)]);
        peer.views.insert(view);

        peer.on_event(join("robert"));
        let room = peer.room().unwrap();
        assert_eq!(room.player_count(), 2);
        assert_eq!(room.player(ActorId(4)).unwrap().nick_name, "robert");
        assert!(drain_notifications(&mut peer).is_empty());
        let view = peer.view(ViewId(1001)).unwrap();
        assert!(view.sync_state().last_sent.is_some(), "baseline kept");
    }

    #[test]
    fn repeated_leave_is_ignored() {
        let (mut peer, _remote) = joined_peer(1, &[2, 3]);
        peer.on_event(backend_event(EventCode::Leave, 3, Params::new()));
        assert_eq!(
            drain_notifications(&mut peer),
            vec![Notification::PlayerDisconnected(ActorId(3))]
        );

        peer.on_event(backend_event(EventCode::Leave, 3, Params::new()));
        assert!(drain_notifications(&mut peer).is_empty());
        assert_eq!(peer.room().unwrap().player_count(), 2);

        let inactive = || {
            let extra = Params::from([(keys::IS_INACTIVE, Value::from(true))]);
            backend_event(EventCode::Leave, 2, extra)
        };
        peer.on_event(inactive());
        drain_notifications(&mut peer);
        peer.on_event(inactive());
        assert!(drain_notifications(&mut peer).is_empty());
    }
}
