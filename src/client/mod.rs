//! Client role: one connection to a server, command in / event out
//!
//! A [`ChatClient`] drives the same reactor machinery as the server,
//! with a single connection in the table. Callers interact through a
//! [`ClientHandle`] (commands) and an event receiver; the client task
//! owns the socket and never blocks on the caller.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::core::connection::{apply_keep_alive, ConnectionId, ConnectionState};
use crate::core::frame::{
    Frame, MemberEntry, DEFAULT_MAX_FRAME_SIZE, MAX_FILE_CHUNK_SIZE, MAX_TEXT_SIZE,
    MAX_USERNAME_SIZE,
};
use crate::core::reactor::{Reactor, Readiness};
use crate::error::{ChatError, Result};

/// How often the client checks its registration deadline
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub server_address: String,
    /// Name to register under right after connecting; `None` defers
    /// registration to an explicit [`ClientHandle::register`] call
    pub username: Option<String>,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Window for the server to confirm (or refuse) registration
    pub handshake_timeout: Duration,
    /// Maximum size of one frame body
    pub max_frame_size: usize,
    /// Outbound queue depth, in bytes, above which file chunking pauses
    pub write_queue_limit: usize,
    /// TCP keep-alive interval
    pub keep_alive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:7878".to_string(),
            username: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_queue_limit: 256 * 1024,
            keep_alive: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given server address
    #[must_use]
    pub fn new<A: Into<String>>(server_address: A) -> Self {
        Self {
            server_address: server_address.into(),
            ..Default::default()
        }
    }

    /// Set the name to register under right after connecting
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the connect timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the registration handshake timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the TCP keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set the maximum frame size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the flow-control write queue limit, in bytes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_queue_limit(mut self, bytes: usize) -> Self {
        self.write_queue_limit = bytes;
        self
    }
}

/// Something the server told us, surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Registration accepted under this name
    Registered { name: String },
    /// Registration refused; retry with another name on the same
    /// connection
    RegistrationRefused { reason: String },
    /// Public chat message
    Public {
        origin_server: String,
        sender: String,
        text: String,
    },
    /// Private message addressed to us
    Private { sender: String, text: String },
    /// Incoming file transfer announcement
    FileOffer {
        sender: String,
        transfer_id: u32,
        filename: String,
        total_size: u64,
    },
    /// One chunk of an incoming transfer
    FileChunk {
        transfer_id: u32,
        sequence: u32,
        data: Bytes,
    },
    /// A message we sent could not be delivered
    DeliveryFailed { target: String, reason: String },
    /// Fresh snapshot of every identity in the fused network
    MembersUpdated(Vec<MemberEntry>),
    /// An identity left the network
    PeerLeft(String),
    /// Connection to the server ended
    Closed,
}

#[derive(Debug)]
enum ClientCommand {
    Register(String),
    SendPublic(String),
    SendPrivate { target: String, text: String },
    SendFile {
        target: String,
        filename: String,
        data: Bytes,
    },
    Quit,
}

#[derive(Default)]
struct SharedState {
    registered_name: Option<String>,
    members: Vec<MemberEntry>,
}

/// Cloneable handle to a running client
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    shared: Arc<RwLock<SharedState>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Request registration under `name`
    pub fn register(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_USERNAME_SIZE {
            return Err(ChatError::protocol(format!(
                "username must be 1..={} bytes",
                MAX_USERNAME_SIZE
            )));
        }
        self.send(ClientCommand::Register(name))
    }

    /// Send a public chat message
    pub fn send_public(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.len() > MAX_TEXT_SIZE {
            return Err(ChatError::protocol(format!(
                "message exceeds {} bytes",
                MAX_TEXT_SIZE
            )));
        }
        self.send(ClientCommand::SendPublic(text))
    }

    /// Send a private message to `target`
    pub fn send_private(&self, target: impl Into<String>, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text.len() > MAX_TEXT_SIZE {
            return Err(ChatError::protocol(format!(
                "message exceeds {} bytes",
                MAX_TEXT_SIZE
            )));
        }
        self.send(ClientCommand::SendPrivate {
            target: target.into(),
            text,
        })
    }

    /// Offer and stream a file to `target`. The transfer is chunked and
    /// paced against the write queue by the client task.
    pub fn send_file(
        &self,
        target: impl Into<String>,
        filename: impl Into<String>,
        data: Bytes,
    ) -> Result<()> {
        let filename = filename.into();
        if filename.len() > MAX_TEXT_SIZE {
            return Err(ChatError::protocol(format!(
                "filename exceeds {} bytes",
                MAX_TEXT_SIZE
            )));
        }
        self.send(ClientCommand::SendFile {
            target: target.into(),
            filename,
            data,
        })
    }

    /// Disconnect from the server
    pub fn quit(&self) -> Result<()> {
        self.send(ClientCommand::Quit)
    }

    /// Name we are registered under, if registration completed
    #[must_use]
    pub fn registered_name(&self) -> Option<String> {
        self.shared.read().registered_name.clone()
    }

    /// Latest member list received from the server
    #[must_use]
    pub fn members(&self) -> Vec<MemberEntry> {
        self.shared.read().members.clone()
    }

    fn send(&self, cmd: ClientCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| ChatError::channel("client task stopped"))
    }
}

/// An outbound file transfer being paced against the write queue
struct OutgoingTransfer {
    target: String,
    data: Bytes,
    offset: usize,
    sequence: u32,
}

enum Wake {
    Command(Option<ClientCommand>),
    Tick,
    Ready(ConnectionId, Readiness),
}

/// A chat client connected to one server
pub struct ChatClient {
    config: ClientConfig,
    reactor: Reactor,
    conn: ConnectionId,
    cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    shared: Arc<RwLock<SharedState>>,
    outgoing: HashMap<u32, OutgoingTransfer>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("config", &self.config)
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Connect to the configured server.
    ///
    /// Returns the client (to be driven with [`ChatClient::run`]), a
    /// handle for commands, and the event stream.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>)> {
        let addr: SocketAddr = config
            .server_address
            .parse()
            .map_err(|e| ChatError::invalid_address(format!("{}: {}", config.server_address, e)))?;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ChatError::handshake_timeout("connect timed out"))??;
        if let Some(interval) = config.keep_alive {
            apply_keep_alive(&stream, interval);
        }

        let mut reactor = Reactor::new();
        let conn = reactor.register(stream, ConnectionState::Authenticating);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RwLock::new(SharedState::default()));

        let handle = ClientHandle {
            cmd_tx,
            shared: Arc::clone(&shared),
        };
        let client = Self {
            config,
            reactor,
            conn,
            cmd_rx,
            event_tx,
            shared,
            outgoing: HashMap::new(),
        };
        Ok((client, handle, event_rx))
    }

    /// Drive the connection until it closes, the handle sends `Quit`, or
    /// the server never answers registration within the handshake window
    pub async fn run(mut self) -> Result<()> {
        if let Some(name) = self.config.username.clone() {
            self.queue(&Frame::Register { name })?;
        }

        let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                _ = tick.tick() => Wake::Tick,
                ready = self.reactor.ready() => Wake::Ready(ready.0, ready.1),
            };

            match wake {
                // Every handle dropped means nobody can command us again.
                Wake::Command(None) | Wake::Command(Some(ClientCommand::Quit)) => break,
                Wake::Command(Some(cmd)) => self.on_command(cmd)?,
                Wake::Tick => {
                    if !self
                        .reactor
                        .expired_handshakes(self.config.handshake_timeout)
                        .is_empty()
                    {
                        let _ = self.event_tx.send(ClientEvent::Closed);
                        return Err(ChatError::handshake_timeout(
                            "server did not answer registration",
                        ));
                    }
                }
                Wake::Ready(id, readiness) => {
                    if !self.on_ready(id, readiness)? {
                        break;
                    }
                }
            }
            self.top_up_transfers()?;
        }

        let _ = self.event_tx.send(ClientEvent::Closed);
        tracing::debug!("client loop finished");
        Ok(())
    }

    fn on_command(&mut self, cmd: ClientCommand) -> Result<()> {
        match cmd {
            ClientCommand::Register(name) => {
                self.queue(&Frame::Register { name })?;
            }
            ClientCommand::SendPublic(text) => {
                // Origin and sender are stamped by the server.
                self.queue(&Frame::PublicChat {
                    origin_server: String::new(),
                    sender: String::new(),
                    text,
                })?;
            }
            ClientCommand::SendPrivate { target, text } => {
                self.queue(&Frame::PrivateMessage {
                    sender: String::new(),
                    target,
                    text,
                })?;
            }
            ClientCommand::SendFile {
                target,
                filename,
                data,
            } => {
                let transfer_id = OsRng.gen::<u32>();
                self.queue(&Frame::FileOffer {
                    sender: String::new(),
                    target: target.clone(),
                    transfer_id,
                    filename,
                    total_size: data.len() as u64,
                })?;
                self.outgoing.insert(
                    transfer_id,
                    OutgoingTransfer {
                        target,
                        data,
                        offset: 0,
                        sequence: 0,
                    },
                );
            }
            ClientCommand::Quit => unreachable!("handled by the loop"),
        }
        Ok(())
    }

    /// Returns `false` when the connection is gone
    fn on_ready(&mut self, id: ConnectionId, readiness: Readiness) -> Result<bool> {
        if readiness.writable {
            let Some(conn) = self.reactor.get_mut(id) else {
                return Ok(false);
            };
            if let Err(e) = conn.pump_write() {
                tracing::debug!("write failed: {}", e);
                return Ok(false);
            }
        }

        if readiness.readable {
            let Some(conn) = self.reactor.get_mut(id) else {
                return Ok(false);
            };
            match conn.pump_read(self.config.max_frame_size) {
                Ok(outcome) => {
                    for frame in outcome.frames {
                        if !self.on_frame(frame) {
                            return Ok(false);
                        }
                    }
                    if outcome.closed {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    tracing::warn!("read failed: {}", e);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Returns `false` on a protocol violation that closes the connection
    fn on_frame(&mut self, frame: Frame) -> bool {
        let event = match frame {
            Frame::RegisterAck { assigned_name } => {
                self.shared.write().registered_name = Some(assigned_name.clone());
                if let Some(conn) = self.reactor.get_mut(self.conn) {
                    conn.set_state(ConnectionState::Established);
                }
                ClientEvent::Registered {
                    name: assigned_name,
                }
            }
            Frame::RegisterNack { reason } => {
                // Also sent mid-session when a fusion tie-break evicts
                // our identity; either way we are unregistered now.
                self.shared.write().registered_name = None;
                if let Some(conn) = self.reactor.get_mut(self.conn) {
                    conn.set_state(ConnectionState::Authenticating);
                    conn.reset_handshake_deadline();
                }
                ClientEvent::RegistrationRefused { reason }
            }
            Frame::PublicChat {
                origin_server,
                sender,
                text,
            } => ClientEvent::Public {
                origin_server,
                sender,
                text,
            },
            Frame::PrivateMessage { sender, text, .. } => ClientEvent::Private { sender, text },
            Frame::FileOffer {
                sender,
                transfer_id,
                filename,
                total_size,
                ..
            } => ClientEvent::FileOffer {
                sender,
                transfer_id,
                filename,
                total_size,
            },
            Frame::FileChunk {
                transfer_id,
                sequence,
                data,
            } => ClientEvent::FileChunk {
                transfer_id,
                sequence,
                data,
            },
            Frame::DeliveryNack { target, reason, .. } => {
                // No point streaming the rest of a file to a departed
                // target.
                self.outgoing.retain(|_, t| t.target != target);
                ClientEvent::DeliveryFailed { target, reason }
            }
            Frame::MemberListSync { members } => {
                self.shared.write().members = members.clone();
                ClientEvent::MembersUpdated(members)
            }
            Frame::DisconnectNotice { identity } => ClientEvent::PeerLeft(identity),
            other => {
                tracing::warn!("server sent illegal {} to a client", other.kind_name());
                return false;
            }
        };
        let _ = self.event_tx.send(event);
        true
    }

    /// Queue more chunks for in-flight outbound transfers, up to the
    /// write-queue limit, so one large file cannot monopolize memory.
    fn top_up_transfers(&mut self) -> Result<()> {
        let limit = self.config.write_queue_limit;
        let max = self.config.max_frame_size;
        let Some(conn) = self.reactor.get_mut(self.conn) else {
            return Ok(());
        };

        let mut finished = Vec::new();
        for (&transfer_id, transfer) in self.outgoing.iter_mut() {
            while transfer.offset < transfer.data.len() && conn.queued_bytes() < limit {
                let end =
                    (transfer.offset + MAX_FILE_CHUNK_SIZE).min(transfer.data.len());
                let chunk = transfer.data.slice(transfer.offset..end);
                conn.queue_frame(
                    &Frame::FileChunk {
                        transfer_id,
                        sequence: transfer.sequence,
                        data: chunk,
                    },
                    max,
                )?;
                transfer.offset = end;
                transfer.sequence += 1;
            }
            if transfer.offset >= transfer.data.len() {
                finished.push(transfer_id);
            }
        }
        for id in finished {
            self.outgoing.remove(&id);
        }
        Ok(())
    }

    fn queue(&mut self, frame: &Frame) -> Result<()> {
        let max = self.config.max_frame_size;
        match self.reactor.get_mut(self.conn) {
            Some(conn) => conn.queue_frame(frame, max),
            None => Err(ChatError::closed_by_peer()),
        }
    }
}
