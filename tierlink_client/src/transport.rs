// Transport session boundary.
//
// A `Transport` is a message channel to one relay endpoint at a time. The
// peer opens it with an address, sends operations over it, and drains
// status changes and decoded server frames with `poll()` once per service
// call. Implementations never mutate client state; everything they observe is
// queued and handed over through `poll()`, which keeps all state changes on
// the thread that runs the peer.
//
// Contract every implementation honors:
// - `open` returns quickly; the outcome arrives later as `Connected` or
//   `ExceptionOnConnect`.
// - `close` is always followed by exactly one `Disconnected` on a later poll
//   (if the transport was open), which is what sequences tier hops.
// - Timeouts are detected here, not in the peer, and reported as
//   `TimeoutDisconnect`.
//
// `MemoryTransport` is an in-process implementation whose far end
// (`MemoryRemote`) is driven by tests and by the loopback backend in
// `multiplayer_tests`. The TCP implementation lives in `tcp.rs`.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};

use tierlink_protocol::{
    ClientMessage, EventData, OperationCode, OperationRequest, OperationResponse, ServerMessage,
};

/// Status transitions reported by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Connected,
    Disconnected,
    EncryptionEstablished,
    EncryptionFailedToEstablish,
    ExceptionOnConnect,
    Exception,
    TimeoutDisconnect,
    DisconnectByServer,
    DisconnectByServerLogic,
    DisconnectByServerUserLimit,
}

/// One item drained from a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Status(StatusCode),
    Message(ServerMessage),
}

/// Delivery guarantee requested for an outgoing message. Stream transports
/// deliver everything reliably and ignore the distinction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

pub trait Transport {
    /// Begin connecting to `address`.
    fn open(&mut self, address: &str) -> io::Result<()>;

    /// Tear down the current connection, if any.
    fn close(&mut self);

    /// Start the key exchange. Completion is reported as
    /// `EncryptionEstablished` or `EncryptionFailedToEstablish`.
    fn establish_encryption(&mut self) -> io::Result<()>;

    /// True if the channel is already confidential (for example, tunnelled
    /// through TLS), in which case no key exchange is needed.
    fn is_secure(&self) -> bool;

    fn send(&mut self, msg: &ClientMessage, delivery: Delivery) -> io::Result<()>;

    /// Drain everything received since the last poll, in arrival order.
    fn poll(&mut self) -> Vec<TransportEvent>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// What a `MemoryTransport` did, as seen from its far end.
#[derive(Clone, Debug, PartialEq)]
pub enum WireAction {
    Opened(String),
    Closed,
    EncryptionRequested,
    Sent {
        message: ClientMessage,
        delivery: Delivery,
    },
}

/// In-process transport. Pair with `MemoryRemote` via `MemoryTransport::pair`.
pub struct MemoryTransport {
    actions: Sender<WireAction>,
    inbox: Receiver<TransportEvent>,
    local: VecDeque<TransportEvent>,
    secure: bool,
    link: Link,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Link {
    Idle,
    Open,
    /// The remote reported a fault; `close` still owes a `Disconnected`.
    Faulted,
}

/// The far end of a `MemoryTransport`: inject events, observe actions.
pub struct MemoryRemote {
    actions: Receiver<WireAction>,
    inbox: Sender<TransportEvent>,
}

impl MemoryTransport {
    /// A plaintext transport and its remote handle.
    pub fn pair() -> (MemoryTransport, MemoryRemote) {
        Self::build(false)
    }

    /// A transport that reports itself as already secure.
    pub fn pair_secure() -> (MemoryTransport, MemoryRemote) {
        Self::build(true)
    }

    fn build(secure: bool) -> (MemoryTransport, MemoryRemote) {
        let (action_tx, action_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        (
            MemoryTransport {
                actions: action_tx,
                inbox: event_rx,
                local: VecDeque::new(),
                secure,
                link: Link::Idle,
            },
            MemoryRemote {
                actions: action_rx,
                inbox: event_tx,
            },
        )
    }

    fn record(&self, action: WireAction) -> io::Result<()> {
        self.actions
            .send(action)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory remote dropped"))
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, address: &str) -> io::Result<()> {
        self.record(WireAction::Opened(address.to_owned()))?;
        self.link = Link::Open;
        Ok(())
    }

    fn close(&mut self) {
        match self.link {
            Link::Idle => return,
            Link::Open => {
                let _ = self.record(WireAction::Closed);
            }
            Link::Faulted => {}
        }
        self.link = Link::Idle;
        self.local
            .push_back(TransportEvent::Status(StatusCode::Disconnected));
    }

    fn establish_encryption(&mut self) -> io::Result<()> {
        self.record(WireAction::EncryptionRequested)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn send(&mut self, msg: &ClientMessage, delivery: Delivery) -> io::Result<()> {
        if self.link != Link::Open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory transport is closed",
            ));
        }
        self.record(WireAction::Sent {
            message: msg.clone(),
            delivery,
        })
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events: Vec<TransportEvent> = self.inbox.try_iter().collect();
        // Status produced by our own `close` is ordered after anything the
        // remote queued before it.
        events.extend(self.local.drain(..));
        for event in &events {
            match event {
                TransportEvent::Status(StatusCode::Disconnected) => self.link = Link::Idle,
                TransportEvent::Status(
                    StatusCode::Connected
                    | StatusCode::EncryptionEstablished
                    | StatusCode::EncryptionFailedToEstablish,
                )
                | TransportEvent::Message(_) => {}
                TransportEvent::Status(_) => {
                    if self.link == Link::Open {
                        self.link = Link::Faulted;
                    }
                }
            }
        }
        events
    }
}

impl MemoryRemote {
    pub fn push_status(&self, status: StatusCode) {
        let _ = self.inbox.send(TransportEvent::Status(status));
    }

    pub fn push_message(&self, msg: ServerMessage) {
        let _ = self.inbox.send(TransportEvent::Message(msg));
    }

    pub fn push_response(&self, response: OperationResponse) {
        self.push_message(ServerMessage::Response(response));
    }

    pub fn push_event(&self, event: EventData) {
        self.push_message(ServerMessage::Event(event));
    }

    /// Everything the transport did since the last call.
    pub fn drain(&self) -> Vec<WireAction> {
        self.actions.try_iter().collect()
    }

    /// Convenience over `drain`: only the operations sent, in order.
    pub fn sent_operations(&self) -> Vec<OperationRequest> {
        self.drain()
            .into_iter()
            .filter_map(|action| match action {
                WireAction::Sent {
                    message: ClientMessage::Operation(op),
                    ..
                } => Some(op),
                _ => None,
            })
            .collect()
    }

    /// Convenience: codes of the operations sent since the last call.
    pub fn sent_codes(&self) -> Vec<OperationCode> {
        self.sent_operations().into_iter().map(|op| op.code).collect()
    }
}

#[cfg(test)]
mod tests {
    use tierlink_protocol::OperationCode;

    use super::*;

    fn op(code: OperationCode) -> ClientMessage {
        ClientMessage::Operation(OperationRequest::new(code))
    }

    #[test]
    fn send_requires_open() {
        let (mut transport, remote) = MemoryTransport::pair();
        let err = transport
            .send(&op(OperationCode::JoinLobby), Delivery::Reliable)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        transport.open("name:1").unwrap();
        transport
            .send(&op(OperationCode::JoinLobby), Delivery::Reliable)
            .unwrap();
        assert_eq!(
            remote.drain(),
            vec![
                WireAction::Opened("name:1".into()),
                WireAction::Sent {
                    message: op(OperationCode::JoinLobby),
                    delivery: Delivery::Reliable,
                },
            ]
        );
    }

    #[test]
    fn close_reports_disconnected_once() {
        let (mut transport, remote) = MemoryTransport::pair();
        transport.open("master").unwrap();
        transport.close();
        transport.close();
        assert_eq!(
            transport.poll(),
            vec![TransportEvent::Status(StatusCode::Disconnected)]
        );
        assert!(transport.poll().is_empty());
        assert_eq!(
            remote.drain(),
            vec![WireAction::Opened("master".into()), WireAction::Closed]
        );
    }

    #[test]
    fn remote_timeout_closes_the_session() {
        let (mut transport, remote) = MemoryTransport::pair();
        transport.open("game").unwrap();
        remote.push_status(StatusCode::TimeoutDisconnect);
        assert_eq!(
            transport.poll(),
            vec![TransportEvent::Status(StatusCode::TimeoutDisconnect)]
        );
        assert!(
            transport
                .send(&op(OperationCode::Leave), Delivery::Reliable)
                .is_err()
        );
        // The peer still closes after a fault and must see the disconnect.
        transport.close();
        assert_eq!(
            transport.poll(),
            vec![TransportEvent::Status(StatusCode::Disconnected)]
        );
    }
}
