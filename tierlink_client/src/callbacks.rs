// Typed notification bus.
//
// Every lifecycle change the host may care about is a `Notification`
// variant. Listeners subscribe either to everything or to a set of
// `NotificationKind`s; delivery is a broadcast to all interested listeners,
// in subscription order, with no listener able to stop propagation.
//
// The peer never calls listeners while it holds borrowed state: handlers
// `emit` into a queue and the peer `flush`es the queue after each dispatched
// frame (and at the end of each service call). Listeners only ever see
// `&Notification`, so they cannot re-enter the peer.

use tierlink_protocol::{ActorId, EventCode, Properties, Value, ViewId};

use crate::error::{DisconnectCause, ServerError};
use crate::state::ClientState;

/// A region offered by the name tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub code: String,
    pub address: String,
}

/// Online status of one friend, from a `FindFriends` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendInfo {
    pub user_id: String,
    pub is_online: bool,
    pub room: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    StateChanged {
        from: ClientState,
        to: ClientState,
    },
    RegionListReceived(Vec<Region>),
    ConnectedToMaster,
    JoinedLobby,
    LeftLobby,
    /// The transport could not be established or authentication was refused
    /// during the initial connect.
    FailedToConnect(DisconnectCause),
    /// An established connection was lost.
    ConnectionFail(DisconnectCause),
    CustomAuthenticationFailed(String),
    Disconnected,

    CreatedRoom,
    JoinedRoom,
    LeftRoom,
    CreateRoomFailed(ServerError, String),
    JoinRoomFailed(ServerError, String),
    JoinRandomFailed(ServerError, String),

    PlayerConnected(ActorId),
    PlayerDisconnected(ActorId),
    PlayerActivityChanged {
        actor: ActorId,
        inactive: bool,
    },
    MasterSwitched {
        previous: ActorId,
        current: ActorId,
    },
    RoomPropertiesChanged(Properties),
    PlayerPropertiesChanged {
        actor: ActorId,
        changed: Properties,
    },
    /// Result of `get_properties`.
    PropertiesReceived,

    /// A `Request`-policy view needs the host's decision; grant it with
    /// `Peer::transfer_ownership`.
    OwnershipRequested {
        view: ViewId,
        requester: ActorId,
    },
    OwnershipTransferred {
        view: ViewId,
        previous: ActorId,
        current: ActorId,
    },

    FriendListUpdated(Vec<FriendInfo>),
    WebRpcResponse {
        path: String,
        return_code: i64,
        data: Value,
    },
    /// An application-defined event.
    EventReceived {
        code: EventCode,
        sender: Option<ActorId>,
        data: Value,
    },
}

/// Discriminant of `Notification`, for filtered subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    StateChanged,
    RegionListReceived,
    ConnectedToMaster,
    JoinedLobby,
    LeftLobby,
    FailedToConnect,
    ConnectionFail,
    CustomAuthenticationFailed,
    Disconnected,
    CreatedRoom,
    JoinedRoom,
    LeftRoom,
    CreateRoomFailed,
    JoinRoomFailed,
    JoinRandomFailed,
    PlayerConnected,
    PlayerDisconnected,
    PlayerActivityChanged,
    MasterSwitched,
    RoomPropertiesChanged,
    PlayerPropertiesChanged,
    PropertiesReceived,
    OwnershipRequested,
    OwnershipTransferred,
    FriendListUpdated,
    WebRpcResponse,
    EventReceived,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        use NotificationKind as K;
        match self {
            Notification::StateChanged { .. } => K::StateChanged,
            Notification::RegionListReceived(_) => K::RegionListReceived,
            Notification::ConnectedToMaster => K::ConnectedToMaster,
            Notification::JoinedLobby => K::JoinedLobby,
            Notification::LeftLobby => K::LeftLobby,
            Notification::FailedToConnect(_) => K::FailedToConnect,
            Notification::ConnectionFail(_) => K::ConnectionFail,
            Notification::CustomAuthenticationFailed(_) => K::CustomAuthenticationFailed,
            Notification::Disconnected => K::Disconnected,
            Notification::CreatedRoom => K::CreatedRoom,
            Notification::JoinedRoom => K::JoinedRoom,
            Notification::LeftRoom => K::LeftRoom,
            Notification::CreateRoomFailed(..) => K::CreateRoomFailed,
            Notification::JoinRoomFailed(..) => K::JoinRoomFailed,
            Notification::JoinRandomFailed(..) => K::JoinRandomFailed,
            Notification::PlayerConnected(_) => K::PlayerConnected,
            Notification::PlayerDisconnected(_) => K::PlayerDisconnected,
            Notification::PlayerActivityChanged { .. } => K::PlayerActivityChanged,
            Notification::MasterSwitched { .. } => K::MasterSwitched,
            Notification::RoomPropertiesChanged(_) => K::RoomPropertiesChanged,
            Notification::PlayerPropertiesChanged { .. } => K::PlayerPropertiesChanged,
            Notification::PropertiesReceived => K::PropertiesReceived,
            Notification::OwnershipRequested { .. } => K::OwnershipRequested,
            Notification::OwnershipTransferred { .. } => K::OwnershipTransferred,
            Notification::FriendListUpdated(_) => K::FriendListUpdated,
            Notification::WebRpcResponse { .. } => K::WebRpcResponse,
            Notification::EventReceived { .. } => K::EventReceived,
        }
    }
}

/// Receiver of notifications. Implemented for any `FnMut(&Notification)`.
pub trait Listener {
    fn on_notification(&mut self, notification: &Notification);
}

impl<F: FnMut(&Notification)> Listener for F {
    fn on_notification(&mut self, notification: &Notification) {
        self(notification)
    }
}

struct Subscription {
    /// `None` means every kind.
    kinds: Option<Vec<NotificationKind>>,
    listener: Box<dyn Listener>,
}

/// Queue plus fan-out of notifications.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
    queue: Vec<Notification>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl Listener + 'static) {
        self.subscriptions.push(Subscription {
            kinds: None,
            listener: Box::new(listener),
        });
    }

    pub fn subscribe_to(&mut self, kinds: &[NotificationKind], listener: impl Listener + 'static) {
        self.subscriptions.push(Subscription {
            kinds: Some(kinds.to_vec()),
            listener: Box::new(listener),
        });
    }

    /// Queue a notification for the next `flush`.
    pub fn emit(&mut self, notification: Notification) {
        self.queue.push(notification);
    }

    /// Deliver every queued notification to every interested listener.
    /// Returns how many notifications were delivered.
    pub fn flush(&mut self) -> usize {
        let queued = std::mem::take(&mut self.queue);
        for notification in &queued {
            let kind = notification.kind();
            for sub in &mut self.subscriptions {
                let interested = sub.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind));
                if interested {
                    sub.listener.on_notification(notification);
                }
            }
        }
        queued.len()
    }

    pub fn pending(&self) -> &[Notification] {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn broadcasts_to_every_interested_listener() {
        let all = Rc::new(RefCell::new(Vec::new()));
        let masters = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();

        let sink = all.clone();
        bus.subscribe(move |n: &Notification| sink.borrow_mut().push(n.kind()));
        let sink = masters.clone();
        bus.subscribe_to(
            &[NotificationKind::MasterSwitched],
            move |n: &Notification| sink.borrow_mut().push(n.clone()),
        );

        bus.emit(Notification::JoinedRoom);
        bus.emit(Notification::MasterSwitched {
            previous: ActorId(3),
            current: ActorId(1),
        });
        assert!(all.borrow().is_empty(), "nothing delivered before flush");
        assert_eq!(bus.flush(), 2);

        assert_eq!(
            *all.borrow(),
            vec![NotificationKind::JoinedRoom, NotificationKind::MasterSwitched]
        );
        assert_eq!(masters.borrow().len(), 1);
        assert_eq!(bus.flush(), 0);
    }
}
