// Ownership requests and transfers.
//
// Both are fire-and-forget broadcasts to every participant, the sender
// included (`ReceiverGroup::All`), so every client applies the same change
// when the relay echoes it; nobody acknowledges and the last writer wins.
// Payloads are `[view id, actor]`: for a request the actor is the owner the
// requester expects to take over from, for a transfer it is the new owner.
//
// Resolution by policy, evaluated independently on every client:
// - `Fixed`: requests are logged and ignored.
// - `Takeover`: the request succeeds if it names the current owner.
// - `Request`: the owner (or the master, when the owner is gone or
//   inactive) gets an `OwnershipRequested` notification and decides by
//   calling `transfer_ownership`.

use log::{debug, info, warn};
use tierlink_protocol::{ActorId, EventCode, ReceiverGroup, Value, ViewId};

use crate::callbacks::Notification;
use crate::error::{ClientError, Result};
use crate::operations::RaiseEventOptions;
use crate::peer::Peer;
use crate::transport::{Delivery, Transport};
use crate::view::OwnershipPolicy;

fn pair(view: ViewId, actor: ActorId) -> Value {
    Value::Array(vec![Value::from(view), Value::from(actor)])
}

fn read_pair(data: &Value) -> Option<(ViewId, ActorId)> {
    match data.as_array()? {
        [view, actor, ..] => Some((view.as_view()?, actor.as_actor()?)),
        _ => None,
    }
}

impl<T: Transport> Peer<T> {
    /// Ask for ownership of `view`. A no-op if this client already owns it.
    pub fn request_ownership(&mut self, view: ViewId) -> Result<()> {
        self.require_room()?;
        let owner = self
            .views
            .get(view)
            .ok_or(ClientError::UnknownView(view))?
            .owner;
        if owner == self.local_actor {
            debug!("already own {view:?}");
            return Ok(());
        }
        self.send_event(
            EventCode::OwnershipRequest,
            pair(view, owner),
            &broadcast(),
            Delivery::Reliable,
        )
    }

    /// Hand `view` to `new_owner`. Allowed for the current owner and the
    /// master.
    pub fn transfer_ownership(&mut self, view: ViewId, new_owner: ActorId) -> Result<()> {
        let local_is_master = self.require_room()?.local_is_master();
        let owner = self
            .views
            .get(view)
            .ok_or(ClientError::UnknownView(view))?
            .owner;
        if owner != self.local_actor && !local_is_master {
            return Err(ClientError::NotOwner(view));
        }
        self.send_event(
            EventCode::OwnershipTransfer,
            pair(view, new_owner),
            &broadcast(),
            Delivery::Reliable,
        )
    }

    pub(crate) fn on_ownership_request(&mut self, requester: ActorId, data: &Value) {
        let Some((id, expected)) = read_pair(data) else {
            warn!("malformed ownership request from {requester:?}");
            return;
        };
        let Some((owner, policy)) = self.views.get(id).map(|v| (v.owner, v.ownership)) else {
            debug!("ownership request for missing view {id:?}");
            return;
        };
        if owner == requester {
            return;
        }
        match policy {
            OwnershipPolicy::Fixed => {
                warn!("{requester:?} requested fixed-ownership view {id:?}; ignored")
            }
            OwnershipPolicy::Takeover => {
                if expected == owner {
                    self.set_owner(id, requester);
                } else {
                    debug!("takeover of {id:?} expected {expected:?} but {owner:?} owns it");
                }
            }
            OwnershipPolicy::Request => {
                let local = self.local_actor;
                let Some(room) = self.room.as_ref() else {
                    return;
                };
                let master = room.local_is_master();
                let owner_reachable = room.is_active(owner);
                let addressed = expected == local || master;
                let decides = owner == local || (master && !owner_reachable);
                if addressed && decides {
                    self.bus.emit(Notification::OwnershipRequested {
                        view: id,
                        requester,
                    });
                }
            }
        }
    }

    pub(crate) fn on_ownership_transfer(&mut self, sender: ActorId, data: &Value) {
        let Some((id, new_owner)) = read_pair(data) else {
            warn!("malformed ownership transfer from {sender:?}");
            return;
        };
        if !self.views.contains(id) {
            debug!("ownership transfer for missing view {id:?}");
            return;
        }
        self.set_owner(id, new_owner);
    }

    fn set_owner(&mut self, id: ViewId, current: ActorId) {
        let Some(view) = self.views.get_mut(id) else {
            return;
        };
        let previous = view.owner;
        if previous == current {
            return;
        }
        view.owner = current;
        view.state.reset_outgoing();
        info!("{id:?} owner {previous:?} -> {current:?}");
        self.bus.emit(Notification::OwnershipTransferred {
            view: id,
            previous,
            current,
        });
    }
}

fn broadcast() -> RaiseEventOptions {
    RaiseEventOptions {
        receivers: ReceiverGroup::All,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::{EventData, OperationCode, ParamsExt, keys};

    use super::*;
    use crate::peer::testing::{drain_notifications, joined_peer};
    use crate::view::View;

    fn event(code: EventCode, sender: i32, data: Value) -> EventData {
        EventData {
            code,
            params: [
                (keys::ACTOR_NR, Value::from(sender)),
                (keys::DATA, data),
            ]
            .into(),
        }
    }

    #[test]
    fn requesting_an_owned_view_sends_nothing() {
        let (mut peer, remote) = joined_peer(1, &[2]);
        peer.attach_view(View::new(ViewId(1001), ActorId(1)));
        peer.request_ownership(ViewId(1001)).unwrap();
        assert!(remote.sent_codes().is_empty());
        assert_eq!(peer.view(ViewId(1001)).unwrap().owner, ActorId(1));
    }

    #[test]
    fn request_is_broadcast_and_applied_on_echo() {
        let (mut peer, remote) = joined_peer(1, &[2]);
        peer.attach_view(
            View::new(ViewId(2001), ActorId(2)).with_ownership(OwnershipPolicy::Takeover),
        );
        peer.request_ownership(ViewId(2001)).unwrap();
        let ops = remote.sent_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].code, OperationCode::RaiseEvent);
        assert_eq!(ops[0].params.int(keys::RECEIVER_GROUP), Some(1));
        // Not applied until the relay echoes it.
        assert_eq!(peer.view(ViewId(2001)).unwrap().owner, ActorId(2));

        let data = ops[0].params.value(keys::DATA).cloned().unwrap();
        peer.on_event(event(EventCode::OwnershipRequest, 1, data));
        assert_eq!(peer.view(ViewId(2001)).unwrap().owner, ActorId(1));
        match drain_notifications(&mut peer).as_slice() {
            [Notification::OwnershipTransferred { previous, current, .. }] => {
                assert_eq!((*previous, *current), (ActorId(2), ActorId(1)));
            }
            other => panic!("expected one OwnershipTransferred, got {other:?}"),
        }
    }

    #[test]
    fn stale_takeover_is_ignored() {
        let (mut peer, _remote) = joined_peer(1, &[2, 3]);
        peer.attach_view(
            View::new(ViewId(2001), ActorId(3)).with_ownership(OwnershipPolicy::Takeover),
        );
        // Requester 2 still believes actor 1 owns the view.
        peer.on_event(event(EventCode::OwnershipRequest, 2, pair(ViewId(2001), ActorId(1))));
        assert_eq!(peer.view(ViewId(2001)).unwrap().owner, ActorId(3));
    }

    #[test]
    fn fixed_views_never_move_on_request() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        peer.attach_view(View::new(ViewId(1001), ActorId(1)));
        peer.on_event(event(EventCode::OwnershipRequest, 2, pair(ViewId(1001), ActorId(1))));
        assert_eq!(peer.view(ViewId(1001)).unwrap().owner, ActorId(1));
        assert!(drain_notifications(&mut peer).is_empty());
    }

    #[test]
    fn request_policy_asks_the_owner() {
        let (mut peer, _remote) = joined_peer(2, &[1]);
        peer.attach_view(
            View::new(ViewId(2001), ActorId(2)).with_ownership(OwnershipPolicy::Request),
        );
        peer.on_event(event(EventCode::OwnershipRequest, 1, pair(ViewId(2001), ActorId(2))));
        assert_eq!(peer.view(ViewId(2001)).unwrap().owner, ActorId(2));
        match drain_notifications(&mut peer).as_slice() {
            [Notification::OwnershipRequested { view, requester }] => {
                assert_eq!((*view, *requester), (ViewId(2001), ActorId(1)));
            }
            other => panic!("expected OwnershipRequested, got {other:?}"),
        }
    }

    #[test]
    fn only_owner_or_master_may_transfer() {
        let (mut peer, _remote) = joined_peer(2, &[1]);
        peer.attach_view(View::new(ViewId(1001), ActorId(1)));
        match peer.transfer_ownership(ViewId(1001), ActorId(2)) {
            Err(ClientError::NotOwner(view)) => assert_eq!(view, ViewId(1001)),
            other => panic!("expected NotOwner, got {other:?}"),
        }
    }

    #[test]
    fn transfer_event_resets_the_send_baseline() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        peer.attach_view(View::new(ViewId(1001), ActorId(1)));
        peer.views.get_mut(ViewId(1001)).unwrap().state.last_sent = Some(vec![Value::from(1)]);
        peer.on_event(event(EventCode::OwnershipTransfer, 1, pair(ViewId(1001), ActorId(2))));
        let view = peer.view(ViewId(1001)).unwrap();
        assert_eq!(view.owner, ActorId(2));
        assert_eq!(view.sync_state().last_sent, None);
    }
}
