// TCP transport for talking to a real relay tier.
//
// Architecture:
// - `open()` only spawns the session's background thread; it never blocks.
//   The thread connects (bounded by the disconnect timeout), hands the
//   socket back, reports `Connected`, or `ExceptionOnConnect` if the connect
//   failed, and then becomes the reader.
// - The reader calls `recv_json()` in a loop and pushes each decoded
//   `ServerMessage` into an `mpsc` channel. When the stream ends it pushes
//   one fault status (`DisconnectByServer`, `TimeoutDisconnect`, or
//   `Exception` for undecodable frames) and exits.
// - The peer's thread holds a `BufWriter<TcpStream>` for sending, installed
//   by the first `poll()` after the connect; frames are small, so the writer
//   flushes synchronously. Sending before that fails with `NotConnected`.
// - `poll()` drains the channel without blocking.
//
// Each session gets a fresh channel. `close()` shuts the socket down and
// drops the session's receiver, so a reader still draining an old socket
// can never deliver into the next session; the `Disconnected` that close
// owes is queued locally and returned by the next poll.
//
// Plain TCP has no key exchange. `establish_encryption` reports
// `EncryptionFailedToEstablish` unless the transport was built with
// `assume_secure` (the connection is tunnelled through TLS by something
// outside this process), in which case it reports success.

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tierlink_protocol::framing::{recv_json, send_json};
use tierlink_protocol::{ClientMessage, ServerMessage};

use crate::transport::{Delivery, StatusCode, Transport, TransportEvent};

/// Silence longer than this on an open session is reported as
/// `TimeoutDisconnect`.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    /// `None` until the connect completes.
    socket: Option<(TcpStream, BufWriter<TcpStream>)>,
    connected: Receiver<(TcpStream, BufWriter<TcpStream>)>,
    inbox: Receiver<TransportEvent>,
    /// Lets the transport order its own status reports among received frames.
    status: Sender<TransportEvent>,
}

/// Length-delimited JSON over TCP, one session at a time.
pub struct TcpTransport {
    session: Option<Session>,
    local: VecDeque<TransportEvent>,
    disconnect_timeout: Option<Duration>,
    assume_secure: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            session: None,
            local: VecDeque::new(),
            disconnect_timeout: Some(DEFAULT_DISCONNECT_TIMEOUT),
            assume_secure: false,
        }
    }

    /// `None` disables timeout detection.
    pub fn with_disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Treat the channel as already confidential.
    pub fn assume_secure(mut self) -> Self {
        self.assume_secure = true;
        self
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn report(&mut self, status: StatusCode) {
        match &self.session {
            Some(session) => {
                let _ = session.status.send(TransportEvent::Status(status));
            }
            None => self.local.push_back(TransportEvent::Status(status)),
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, address: &str) -> io::Result<()> {
        if self.session.is_some() {
            self.close();
        }
        let (tx, rx) = mpsc::channel();
        let (socket_tx, socket_rx) = mpsc::channel();
        let reader_tx = tx.clone();
        let peer_address = address.to_owned();
        let timeout = self.disconnect_timeout;
        thread::Builder::new()
            .name(format!("tcp-{address}"))
            .spawn(move || {
                let reader = match connect(&peer_address, timeout) {
                    Ok((reader, socket)) => {
                        // The socket must be in place before `Connected` is seen.
                        if socket_tx.send(socket).is_err() {
                            return;
                        }
                        info!("connected to {peer_address}");
                        reader
                    }
                    Err(e) => {
                        warn!("cannot connect to {peer_address}: {e}");
                        let _ = reader_tx.send(TransportEvent::Status(StatusCode::ExceptionOnConnect));
                        return;
                    }
                };
                if reader_tx
                    .send(TransportEvent::Status(StatusCode::Connected))
                    .is_ok()
                {
                    reader_loop(reader, reader_tx);
                }
                debug!("reader for {peer_address} stopped");
            })?;

        self.session = Some(Session {
            socket: None,
            connected: socket_rx,
            inbox: rx,
            status: tx,
        });
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // A connect still in flight is dropped by the thread once it finds
        // the receiver gone.
        if let Ok(socket) = session.connected.try_recv() {
            session.socket = Some(socket);
        }
        if let Some((stream, _)) = &session.socket
            && let Err(e) = stream.shutdown(Shutdown::Both)
        {
            debug!("shutdown: {e}");
        }
        // Dropping the session drops its receivers; the thread's next send
        // fails and it exits.
        drop(session);
        self.local
            .push_back(TransportEvent::Status(StatusCode::Disconnected));
    }

    fn establish_encryption(&mut self) -> io::Result<()> {
        if self.session.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tcp transport is closed",
            ));
        }
        if self.assume_secure {
            self.report(StatusCode::EncryptionEstablished);
        } else {
            warn!("plain tcp has no key exchange");
            self.report(StatusCode::EncryptionFailedToEstablish);
        }
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.assume_secure
    }

    fn send(&mut self, msg: &ClientMessage, _delivery: Delivery) -> io::Result<()> {
        let session = self.session.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "tcp transport is closed")
        })?;
        let (_, writer) = session.socket.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "tcp session still connecting")
        })?;
        send_json(writer, msg)
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events: Vec<TransportEvent> = match &mut self.session {
            Some(session) => {
                if session.socket.is_none()
                    && let Ok(socket) = session.connected.try_recv()
                {
                    session.socket = Some(socket);
                }
                session.inbox.try_iter().collect()
            }
            None => Vec::new(),
        };
        events.extend(self.local.drain(..));
        events
    }
}

/// Connect to `address` and split the stream into the reader half and the
/// (stream, writer) pair the transport keeps.
fn connect(
    address: &str,
    timeout: Option<Duration>,
) -> io::Result<(BufReader<TcpStream>, (TcpStream, BufWriter<TcpStream>))> {
    let stream = match timeout {
        Some(timeout) => connect_within(address, timeout)?,
        None => TcpStream::connect(address)?,
    };
    stream.set_nodelay(true)?;
    stream.set_read_timeout(timeout)?;
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream.try_clone()?);
    Ok((reader, (stream, writer)))
}

fn connect_within(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

/// Reader thread: decode frames until the stream fails, then report why.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<TransportEvent>) {
    loop {
        match recv_json::<_, ServerMessage>(&mut reader) {
            Ok(msg) => {
                if tx.send(TransportEvent::Message(msg)).is_err() {
                    // Transport closed this session.
                    return;
                }
            }
            Err(e) => {
                let status = fault_status(&e);
                debug!("reader stopping on {e} ({status:?})");
                let _ = tx.send(TransportEvent::Status(status));
                return;
            }
        }
    }
}

fn fault_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => StatusCode::TimeoutDisconnect,
        io::ErrorKind::InvalidData => StatusCode::Exception,
        _ => StatusCode::DisconnectByServer,
    }
}
