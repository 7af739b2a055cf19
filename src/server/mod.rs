//! Server role: accepts clients, fuses with peer servers, routes messages
//!
//! One [`ChatServer`] runs one single-threaded reactor loop. Every
//! registry, transfer-table and fusion mutation happens inside that
//! loop, so the identity-uniqueness invariant needs no locking.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::core::connection::{apply_keep_alive, ConnectionId, ConnectionState};
use crate::core::frame::{
    Frame, MemberEntry, DEFAULT_MAX_FRAME_SIZE, MAX_TEXT_SIZE, MAX_USERNAME_SIZE,
};
use crate::core::reactor::{Reactor, Readiness};
use crate::error::{ChatError, Result};
use crate::fusion::FusionEngine;
use crate::registry::{ServerRecord, SessionRegistry};
use crate::router::{Router, TransferTable};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name this server goes by in the fused network
    pub server_name: String,
    /// Bind address
    pub bind_address: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum size of one frame body
    pub max_frame_size: usize,
    /// Window for a registration or fusion handshake to complete
    pub handshake_timeout: Duration,
    /// Outbound fusion connect timeout
    pub connect_timeout: Duration,
    /// Housekeeping tick (bounds the poll timeout for stalled-handshake
    /// detection)
    pub tick_interval: Duration,
    /// Per-connection outbound queue depth, in bytes, above which the
    /// sending side is paused (flow control)
    pub write_queue_limit: usize,
    /// TCP keep-alive interval
    pub keep_alive: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "server".to_string(),
            bind_address: "127.0.0.1:7878".to_string(),
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(500),
            write_queue_limit: 256 * 1024,
            keep_alive: Some(Duration::from_secs(60)),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new<S: Into<String>, A: Into<String>>(server_name: S, bind_address: A) -> Self {
        Self {
            server_name: server_name.into(),
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    /// Set maximum connections
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the maximum frame size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the handshake timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the housekeeping tick interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the flow-control write queue limit, in bytes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_queue_limit(mut self, bytes: usize) -> Self {
        self.write_queue_limit = bytes;
        self
    }

    /// Set the TCP keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }
}

/// Operator commands accepted by a running server
#[derive(Debug)]
pub enum ServerCommand {
    /// Fuse with the server listening at the given `host:port`
    RequestFusion(String),
    /// Snapshot of every live identity in the fused network
    MemberList(oneshot::Sender<Vec<MemberEntry>>),
    /// Stop the server; all connections are closed
    Shutdown,
}

/// Cloneable handle for submitting commands to a running server
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Ask the server to fuse with a peer at `addr`
    pub fn request_fusion(&self, addr: impl Into<String>) -> Result<()> {
        self.cmd_tx
            .send(ServerCommand::RequestFusion(addr.into()))
            .map_err(|_| ChatError::channel("server command channel closed"))
    }

    /// Fetch the current member list
    pub async fn member_list(&self) -> Result<Vec<MemberEntry>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::MemberList(tx))
            .map_err(|_| ChatError::channel("server command channel closed"))?;
        rx.await
            .map_err(|_| ChatError::channel("server stopped before replying"))
    }

    /// Ask the server to shut down
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(ServerCommand::Shutdown)
            .map_err(|_| ChatError::channel("server command channel closed"))
    }

    /// Whether the server loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Role a connection has negotiated. Each role defines its own legal
/// message set; a frame outside that set is a protocol violation and
/// closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionRole {
    /// Inbound connection whose first frame has not arrived yet, or a
    /// client currently (re-)authenticating
    Unclassified,
    /// Registered client session
    Client,
    /// Fusion negotiation in progress
    PeerNegotiating,
    /// Committed fused peer server
    Peer,
}

enum Wake {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Command(ServerCommand),
    DialDone(String, std::result::Result<TcpStream, String>),
    Tick,
    Ready(ConnectionId, Readiness),
}

/// A federated chat server
pub struct ChatServer {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    reactor: Reactor,
    registry: SessionRegistry,
    transfers: TransferTable,
    engine: FusionEngine,
    roles: HashMap<ConnectionId, SessionRole>,
    /// Outbound fusion dials not yet connected
    dialing: HashSet<String>,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
    dial_tx: mpsc::UnboundedSender<(String, std::result::Result<TcpStream, String>)>,
    dial_rx: mpsc::UnboundedReceiver<(String, std::result::Result<TcpStream, String>)>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ChatServer {
    /// Bind the listen socket and prepare a server
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ChatError::invalid_address(format!("{}: {}", config.bind_address, e)))?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let engine = FusionEngine::new(config.server_name.clone(), local_addr.to_string());

        Ok(Self {
            config,
            listener,
            local_addr,
            reactor: Reactor::new(),
            registry: SessionRegistry::new(),
            transfers: TransferTable::new(),
            engine,
            roles: HashMap::new(),
            dialing: HashSet::new(),
            cmd_tx,
            cmd_rx,
            dial_tx,
            dial_rx,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Actual bound address (useful with port 0)
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This server's name
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Handle for submitting commands from outside the reactor loop
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cmd_tx: self.cmd_tx.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Drive the reactor loop until shutdown.
    ///
    /// No per-connection error is process-fatal: framing and protocol
    /// errors close the offending connection and the loop keeps serving
    /// the others.
    pub async fn run(mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        tracing::info!(
            "server {:?} listening on {}",
            self.config.server_name,
            self.local_addr
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                res = self.listener.accept() => Wake::Accept(res),
                // The server holds one sender itself, so recv never
                // resolves to None.
                Some(cmd) = self.cmd_rx.recv() => Wake::Command(cmd),
                Some((addr, res)) = self.dial_rx.recv() => Wake::DialDone(addr, res),
                _ = tick.tick() => Wake::Tick,
                ready = self.reactor.ready() => Wake::Ready(ready.0, ready.1),
            };

            match wake {
                Wake::Accept(res) => self.on_accept(res),
                Wake::Command(ServerCommand::Shutdown) => break,
                Wake::Command(cmd) => self.on_command(cmd),
                Wake::DialDone(addr, res) => self.on_dial_done(addr, res),
                Wake::Tick => self.on_tick(),
                Wake::Ready(id, readiness) => self.on_ready(id, readiness),
            }

            // Deregistration and cascade cleanup run only between poll
            // iterations, never while readiness is being dispatched.
            for closed in self.reactor.sweep() {
                self.cleanup_connection(closed.id());
            }
            self.update_flow_control();
        }

        tracing::info!("server {:?} shutting down", self.config.server_name);
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    // ---- loop arms -----------------------------------------------------

    fn on_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) {
        match res {
            Ok((stream, peer_addr)) => {
                if self.reactor.len() >= self.config.max_connections {
                    tracing::warn!(
                        "connection limit reached ({}), rejecting {}",
                        self.config.max_connections,
                        peer_addr
                    );
                    drop(stream);
                    return;
                }
                if let Some(interval) = self.config.keep_alive {
                    apply_keep_alive(&stream, interval);
                }
                let id = self.reactor.register(stream, ConnectionState::Authenticating);
                self.roles.insert(id, SessionRole::Unclassified);
                tracing::debug!("{} accepted from {}", id, peer_addr);
            }
            Err(e) => tracing::error!("failed to accept connection: {}", e),
        }
    }

    fn on_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::RequestFusion(addr) => self.start_fusion(addr),
            ServerCommand::MemberList(reply) => {
                let _ = reply.send(self.registry.members());
            }
            ServerCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn on_dial_done(&mut self, addr: String, res: std::result::Result<TcpStream, String>) {
        self.dialing.remove(&addr);
        match res {
            Ok(stream) => {
                if let Some(interval) = self.config.keep_alive {
                    apply_keep_alive(&stream, interval);
                }
                let id = self.reactor.register(stream, ConnectionState::Authenticating);
                self.roles.insert(id, SessionRole::PeerNegotiating);
                self.engine.begin_outbound(id, addr.clone());

                let proposal = Frame::FusionAccept {
                    server_name: self.config.server_name.clone(),
                    server_addr: self.local_addr.to_string(),
                    members: self.registry.members(),
                };
                self.send_to(id, &proposal);
                self.engine.mark_negotiating(id);
                tracing::info!("fusion proposal sent to {} via {}", addr, id);
            }
            Err(e) => {
                // Transport failure during negotiation: retryable, the
                // operator may re-issue the fusion request.
                tracing::warn!("fusion dial to {} failed: {}", addr, e);
            }
        }
    }

    fn on_tick(&mut self) {
        for id in self.reactor.expired_handshakes(self.config.handshake_timeout) {
            tracing::warn!(
                "{}: {}",
                id,
                ChatError::handshake_timeout("registration or fusion did not complete")
            );
            self.reactor.defer_close(id);
        }
        // Pending closes waiting on a flush may have drained since.
        let flushed: Vec<ConnectionId> = self
            .reactor
            .iter()
            .filter(|c| c.flushed_for_close())
            .map(|c| c.id())
            .collect();
        for id in flushed {
            self.reactor.defer_close(id);
        }
    }

    fn on_ready(&mut self, id: ConnectionId, readiness: Readiness) {
        if readiness.writable {
            match self.reactor.get_mut(id).map(|c| (c.pump_write(), c.flushed_for_close())) {
                Some((Ok(_drained), close_now)) => {
                    if close_now {
                        self.reactor.defer_close(id);
                    }
                }
                Some((Err(e), _)) => {
                    tracing::debug!("{} write failed: {}", id, e);
                    self.reactor.defer_close(id);
                }
                None => return,
            }
        }

        if readiness.readable {
            let outcome = match self.reactor.get_mut(id) {
                Some(conn) if conn.state() != ConnectionState::Closing => {
                    conn.pump_read(self.config.max_frame_size)
                }
                _ => return,
            };
            match outcome {
                Ok(outcome) => {
                    for frame in outcome.frames {
                        // A violation mid-batch closes the connection;
                        // later frames from it must not be dispatched.
                        if matches!(
                            self.reactor.get(id).map(|c| c.state()),
                            None | Some(ConnectionState::Closing)
                        ) {
                            break;
                        }
                        self.handle_frame(id, frame);
                    }
                    if outcome.closed {
                        self.reactor.defer_close(id);
                    }
                }
                Err(e) => {
                    tracing::warn!("{} read failed: {}", id, e);
                    self.reactor.defer_close(id);
                }
            }
        }
    }

    // ---- frame dispatch ------------------------------------------------

    fn handle_frame(&mut self, id: ConnectionId, frame: Frame) {
        let role = self
            .roles
            .get(&id)
            .cloned()
            .unwrap_or(SessionRole::Unclassified);
        match role {
            SessionRole::Unclassified => match frame {
                Frame::Register { name } => self.handle_register(id, name),
                Frame::FusionAccept {
                    server_name,
                    server_addr,
                    members,
                } => {
                    self.engine.begin_inbound(id);
                    self.roles.insert(id, SessionRole::PeerNegotiating);
                    self.handle_fusion_accept(id, server_name, server_addr, members, true);
                }
                other => self.protocol_violation(id, &other, "before registration"),
            },
            SessionRole::Client => match frame {
                Frame::PublicChat { text, .. } => self.handle_client_public(id, text),
                Frame::PrivateMessage { target, text, .. } => {
                    self.handle_client_private(id, target, text)
                }
                Frame::FileOffer {
                    target,
                    transfer_id,
                    filename,
                    total_size,
                    ..
                } => self.handle_client_file_offer(id, target, transfer_id, filename, total_size),
                Frame::FileChunk {
                    transfer_id,
                    sequence,
                    data,
                } => {
                    let deliveries = Router::route_chunk(
                        &self.registry,
                        &mut self.transfers,
                        id,
                        transfer_id,
                        sequence,
                        data,
                    );
                    self.dispatch(id, deliveries);
                }
                other => self.protocol_violation(id, &other, "for a client session"),
            },
            SessionRole::PeerNegotiating => match frame {
                Frame::FusionAccept {
                    server_name,
                    server_addr,
                    members,
                } => self.handle_fusion_accept(id, server_name, server_addr, members, false),
                Frame::FusionReject { reason } => {
                    tracing::warn!("{}: fusion rejected by peer: {}", id, reason);
                    self.engine.reject(id);
                    self.reactor.defer_close(id);
                }
                other => {
                    self.engine.reject(id);
                    self.protocol_violation(id, &other, "during fusion negotiation");
                }
            },
            SessionRole::Peer => match frame {
                Frame::PublicChat {
                    origin_server,
                    sender,
                    text,
                } => {
                    let deliveries = Router::route_public(
                        &self.registry,
                        &self.config.server_name,
                        id,
                        true,
                        sender,
                        origin_server,
                        text,
                    );
                    self.dispatch(id, deliveries);
                }
                Frame::PrivateMessage {
                    sender,
                    target,
                    text,
                } => {
                    let frame = Frame::PrivateMessage {
                        sender: sender.clone(),
                        target: target.clone(),
                        text,
                    };
                    let deliveries =
                        Router::route_to_identity(&self.registry, id, &sender, &target, frame);
                    self.dispatch(id, deliveries);
                }
                Frame::FileOffer {
                    sender,
                    target,
                    transfer_id,
                    filename,
                    total_size,
                } => {
                    let frame = Frame::FileOffer {
                        sender: sender.clone(),
                        target: target.clone(),
                        transfer_id,
                        filename,
                        total_size,
                    };
                    let deliveries =
                        Router::route_to_identity(&self.registry, id, &sender, &target, frame);
                    // Recorded only when the offer actually routed, so
                    // offers to unknown targets cannot grow the table.
                    if !nacked(&deliveries) {
                        self.transfers.insert(transfer_id, &sender, &target, total_size);
                    }
                    self.dispatch(id, deliveries);
                }
                Frame::FileChunk {
                    transfer_id,
                    sequence,
                    data,
                } => {
                    let deliveries = Router::route_chunk(
                        &self.registry,
                        &mut self.transfers,
                        id,
                        transfer_id,
                        sequence,
                        data,
                    );
                    self.dispatch(id, deliveries);
                }
                Frame::DeliveryNack {
                    sender,
                    target,
                    reason,
                } => {
                    let frame = Frame::DeliveryNack {
                        sender: sender.clone(),
                        target,
                        reason,
                    };
                    let deliveries = Router::route_nack(&self.registry, &sender, frame);
                    self.dispatch(id, deliveries);
                }
                Frame::MemberListSync { members } => self.handle_peer_sync(id, members),
                Frame::DisconnectNotice { identity } => self.handle_peer_disconnect_notice(id, identity),
                Frame::FusionRequest { peer_addr } => self.start_fusion(peer_addr),
                other => self.protocol_violation(id, &other, "for a fused peer"),
            },
        }
    }

    fn handle_register(&mut self, id: ConnectionId, name: String) {
        if name.is_empty() || name.len() > MAX_USERNAME_SIZE {
            self.send_to(
                id,
                &Frame::RegisterNack {
                    reason: format!("invalid name (1..={} bytes)", MAX_USERNAME_SIZE),
                },
            );
            return;
        }

        let origin_server = self.config.server_name.clone();
        let origin_addr = self.local_addr.to_string();
        match self
            .registry
            .register_local(&name, &origin_server, &origin_addr, id)
        {
            Ok(()) => {
                tracing::info!("client {:?} registered on {}", name, id);
                if let Some(conn) = self.reactor.get_mut(id) {
                    conn.set_state(ConnectionState::Established);
                }
                self.roles.insert(id, SessionRole::Client);
                self.send_to(
                    id,
                    &Frame::RegisterAck {
                        assigned_name: name.clone(),
                    },
                );
                self.broadcast_members_to_clients();
                self.sync_local_members_to_peers();
            }
            Err(ChatError::NameCollision(_)) => {
                // Recoverable: the client may retry with another name on
                // the same connection.
                tracing::debug!("{}: name {:?} already taken", id, name);
                self.send_to(
                    id,
                    &Frame::RegisterNack {
                        reason: format!("name {:?} already taken", name),
                    },
                );
            }
            Err(e) => {
                tracing::warn!("{}: registration failed: {}", id, e);
                self.reactor.defer_close(id);
            }
        }
    }

    fn handle_client_public(&mut self, id: ConnectionId, text: String) {
        let Some(sender) = self.registry.name_of_conn(id).map(String::from) else {
            self.reactor.defer_close(id);
            return;
        };
        if text.len() > MAX_TEXT_SIZE {
            self.protocol_violation(
                id,
                &Frame::PublicChat {
                    origin_server: String::new(),
                    sender,
                    text: String::new(),
                },
                "message text over limit",
            );
            return;
        }
        // The sender identity comes from the registry, not from the
        // frame, so a client cannot speak under another name.
        let deliveries = Router::route_public(
            &self.registry,
            &self.config.server_name,
            id,
            false,
            sender,
            String::new(),
            text,
        );
        self.dispatch(id, deliveries);
    }

    fn handle_client_private(&mut self, id: ConnectionId, target: String, text: String) {
        let Some(sender) = self.registry.name_of_conn(id).map(String::from) else {
            self.reactor.defer_close(id);
            return;
        };
        if text.len() > MAX_TEXT_SIZE {
            self.protocol_violation(
                id,
                &Frame::PrivateMessage {
                    sender,
                    target,
                    text: String::new(),
                },
                "message text over limit",
            );
            return;
        }
        let frame = Frame::PrivateMessage {
            sender: sender.clone(),
            target: target.clone(),
            text,
        };
        let deliveries = Router::route_to_identity(&self.registry, id, &sender, &target, frame);
        self.dispatch(id, deliveries);
    }

    fn handle_client_file_offer(
        &mut self,
        id: ConnectionId,
        target: String,
        transfer_id: u32,
        filename: String,
        total_size: u64,
    ) {
        let Some(sender) = self.registry.name_of_conn(id).map(String::from) else {
            self.reactor.defer_close(id);
            return;
        };
        let frame = Frame::FileOffer {
            sender: sender.clone(),
            target: target.clone(),
            transfer_id,
            filename,
            total_size,
        };
        let deliveries = Router::route_to_identity(&self.registry, id, &sender, &target, frame);
        // Recorded only when the offer actually routed, so offers to
        // unknown targets cannot grow the table.
        if !nacked(&deliveries) {
            self.transfers.insert(transfer_id, &sender, &target, total_size);
        }
        self.dispatch(id, deliveries);
    }

    // ---- fusion --------------------------------------------------------

    fn start_fusion(&mut self, addr: String) {
        if addr == self.local_addr.to_string() {
            tracing::debug!("ignoring fusion request naming our own address");
            return;
        }
        if self.registry.has_server_addr(&addr)
            || self.dialing.contains(&addr)
            || self.engine.is_dialing(&addr)
        {
            tracing::debug!("fusion with {} already fused or in flight", addr);
            return;
        }

        tracing::info!("initiating fusion with {}", addr);
        self.dialing.insert(addr.clone());
        let dial_tx = self.dial_tx.clone();
        let connect_timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let res = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            };
            let _ = dial_tx.send((addr, res));
        });
    }

    fn handle_fusion_accept(
        &mut self,
        id: ConnectionId,
        peer_name: String,
        peer_addr: String,
        peer_members: Vec<MemberEntry>,
        inbound: bool,
    ) {
        let known: HashSet<String> = self.registry.servers().map(|s| s.name.clone()).collect();
        if let Err(e) = self
            .engine
            .validate_proposal(&peer_name, &peer_addr, &peer_members, &known)
        {
            self.reject_fusion(id, &e.to_string());
            return;
        }

        // Both sides reconcile their pre-merge snapshots; the split is
        // symmetric, so they converge without further negotiation.
        let local_members = self.registry.members();
        let reconciled = match FusionEngine::reconcile(&local_members, &peer_members) {
            Ok(r) => r,
            Err(e) => {
                self.reject_fusion(id, &e.to_string());
                return;
            }
        };

        if inbound {
            // Answer with our own pre-merge snapshot before mutating
            // anything, so the initiator reconciles the same two lists.
            let response = Frame::FusionAccept {
                server_name: self.config.server_name.clone(),
                server_addr: self.local_addr.to_string(),
                members: local_members,
            };
            self.send_to(id, &response);
        }

        if let Err(e) = self.registry.add_server(ServerRecord {
            name: peer_name.clone(),
            addr: peer_addr.clone(),
            conn: id,
        }) {
            self.reject_fusion(id, &e.to_string());
            return;
        }

        for evicted in &reconciled.evicted {
            self.force_rename(evicted.clone());
        }
        for entry in &reconciled.imported {
            match self.registry.register_peer_client(entry, &peer_name) {
                Ok(()) => {}
                Err(e) => tracing::warn!("skipping imported member {:?}: {}", entry.name, e),
            }
        }
        // Clients introduced by this very server may have been imported
        // earlier through another peer; they are now reachable directly.
        self.registry.rebind_origin(&peer_name);

        if let Some(conn) = self.reactor.get_mut(id) {
            conn.set_state(ConnectionState::Established);
        }
        self.roles.insert(id, SessionRole::Peer);
        self.engine.commit(id, peer_addr.clone());
        tracing::info!(
            "fusion committed with {:?} ({}), {} member(s) imported",
            peer_name,
            peer_addr,
            reconciled.imported.len()
        );

        // Heal any drift since the exchanged snapshots.
        let sync = Frame::MemberListSync {
            members: self.registry.local_members(),
        };
        self.send_to(id, &sync);

        self.broadcast_members_to_clients();

        // Transitive fusion: every pre-existing peer must also absorb the
        // newcomer, so the federation converges on a full mesh.
        let others: Vec<ConnectionId> = self
            .registry
            .servers()
            .filter(|s| s.conn != id)
            .map(|s| s.conn)
            .collect();
        for peer_conn in others {
            self.send_to(
                peer_conn,
                &Frame::FusionRequest {
                    peer_addr: peer_addr.clone(),
                },
            );
        }
    }

    fn reject_fusion(&mut self, id: ConnectionId, reason: &str) {
        tracing::warn!("{}: fusion rejected: {}", id, reason);
        self.engine.reject(id);
        self.send_to(
            id,
            &Frame::FusionReject {
                reason: reason.to_string(),
            },
        );
        if let Some(conn) = self.reactor.get_mut(id) {
            conn.set_close_after_flush();
        }
    }

    /// Evict a local identity that lost a fusion tie-break. The owning
    /// connection is sent back to the authenticating state and must
    /// re-register under another name (or disconnect).
    fn force_rename(&mut self, name: String) {
        let Some(record) = self.registry.remove(&name) else {
            return;
        };
        self.transfers.drop_involving(&name);
        tracing::info!("identity {:?} evicted by fusion tie-break", name);

        if let crate::registry::Owner::Local(conn) = record.owner {
            self.send_to(
                conn,
                &Frame::RegisterNack {
                    reason: format!("identity {:?} lost a fusion tie-break, pick a new name", name),
                },
            );
            self.roles.insert(conn, SessionRole::Unclassified);
            if let Some(c) = self.reactor.get_mut(conn) {
                c.set_state(ConnectionState::Authenticating);
                c.reset_handshake_deadline();
            }
        }

        // Prompt convergence for peers that have not yet fused with the
        // surviving side.
        let peers: Vec<ConnectionId> = self.registry.servers().map(|s| s.conn).collect();
        for peer_conn in peers {
            self.send_to(
                peer_conn,
                &Frame::DisconnectNotice {
                    identity: name.clone(),
                },
            );
        }
    }

    /// A fused peer's authoritative list of its locally owned clients
    fn handle_peer_sync(&mut self, id: ConnectionId, members: Vec<MemberEntry>) {
        let Some(peer_name) = self.registry.server_by_conn(id).map(|s| s.name.clone()) else {
            return;
        };

        let incoming: HashSet<&str> = members.iter().map(|m| m.name.as_str()).collect();
        let stale: Vec<String> = self
            .registry
            .members()
            .into_iter()
            .filter(|m| m.origin_server == peer_name && !incoming.contains(m.name.as_str()))
            .map(|m| m.name)
            .collect();
        for name in stale {
            if self.registry.remove(&name).is_some() {
                self.transfers.drop_involving(&name);
                self.notify_clients_of_departure(&name);
            }
        }

        for entry in &members {
            if entry.origin_server != peer_name {
                tracing::warn!(
                    "{}: member sync entry {:?} not owned by {:?}, ignoring",
                    id,
                    entry.name,
                    peer_name
                );
                continue;
            }
            if self.registry.lookup(&entry.name).is_none() {
                if let Err(e) = self.registry.register_peer_client(entry, &peer_name) {
                    tracing::warn!("cannot import synced member {:?}: {}", entry.name, e);
                }
            }
        }

        self.broadcast_members_to_clients();
    }

    fn handle_peer_disconnect_notice(&mut self, id: ConnectionId, identity: String) {
        let owned_here = matches!(
            self.registry.lookup(&identity).map(|r| r.owner.clone()),
            Some(crate::registry::Owner::Peer(_))
        );
        if !owned_here {
            tracing::debug!("{}: disconnect notice for unknown {:?}", id, identity);
            return;
        }
        self.registry.remove(&identity);
        self.transfers.drop_involving(&identity);
        self.notify_clients_of_departure(&identity);
    }

    // ---- delivery helpers ----------------------------------------------

    fn dispatch(&mut self, from: ConnectionId, deliveries: Vec<(ConnectionId, Frame)>) {
        let mut slow_target = false;
        for (to, frame) in deliveries {
            self.send_to(to, &frame);
            if let Some(conn) = self.reactor.get(to) {
                if conn.queued_bytes() > self.config.write_queue_limit {
                    slow_target = true;
                }
            }
        }
        // Bounded-producer rule: stop reading from the source while any
        // of its targets is above the high-water mark.
        if slow_target {
            if let Some(conn) = self.reactor.get_mut(from) {
                if !conn.is_paused() {
                    tracing::debug!("{} paused (slow delivery target)", from);
                    conn.set_paused(true);
                }
            }
        }
    }

    fn send_to(&mut self, to: ConnectionId, frame: &Frame) {
        let max = self.config.max_frame_size;
        if let Some(conn) = self.reactor.get_mut(to) {
            if let Err(e) = conn.queue_frame(frame, max) {
                tracing::warn!("{}: dropping {}: {}", to, frame.kind_name(), e);
            }
        }
    }

    fn broadcast_members_to_clients(&mut self) {
        let frame = Frame::MemberListSync {
            members: self.registry.members(),
        };
        let conns: Vec<ConnectionId> = self.registry.local_client_conns().collect();
        for conn in conns {
            self.send_to(conn, &frame);
        }
    }

    fn sync_local_members_to_peers(&mut self) {
        let frame = Frame::MemberListSync {
            members: self.registry.local_members(),
        };
        let conns: Vec<ConnectionId> = self.registry.servers().map(|s| s.conn).collect();
        for conn in conns {
            self.send_to(conn, &frame);
        }
    }

    fn notify_clients_of_departure(&mut self, identity: &str) {
        let frame = Frame::DisconnectNotice {
            identity: identity.to_string(),
        };
        let conns: Vec<ConnectionId> = self.registry.local_client_conns().collect();
        for conn in conns {
            self.send_to(conn, &frame);
        }
    }

    fn protocol_violation(&mut self, id: ConnectionId, frame: &Frame, context: &str) {
        tracing::warn!(
            "{}: {}",
            id,
            ChatError::protocol(format!("{} illegal {}", frame.kind_name(), context))
        );
        self.reactor.defer_close(id);
    }

    fn update_flow_control(&mut self) {
        let limit = self.config.write_queue_limit;
        let any_over = self.reactor.iter().any(|c| c.queued_bytes() > limit);
        if !any_over {
            for conn in self.reactor.iter_mut() {
                if conn.is_paused() {
                    tracing::debug!("{} resumed", conn.id());
                    conn.set_paused(false);
                }
            }
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Cascade cleanup after a connection left the table
    fn cleanup_connection(&mut self, id: ConnectionId) {
        let role = self.roles.remove(&id).unwrap_or(SessionRole::Unclassified);
        match role {
            SessionRole::Client => {
                if let Some(record) = self.registry.remove_by_conn(id) {
                    tracing::info!("client {:?} disconnected", record.name);
                    self.transfers.drop_involving(&record.name);
                    let notice = Frame::DisconnectNotice {
                        identity: record.name.clone(),
                    };
                    let peers: Vec<ConnectionId> =
                        self.registry.servers().map(|s| s.conn).collect();
                    for peer in peers {
                        self.send_to(peer, &notice);
                    }
                    self.notify_clients_of_departure(&record.name);
                }
            }
            SessionRole::Peer => {
                if let Some((server, removed)) = self.registry.remove_server_by_conn(id) {
                    tracing::warn!(
                        "fused peer {:?} dropped, cascading {} identit(ies)",
                        server.name,
                        removed.len()
                    );
                    // Remaining peers may know these identities only
                    // through us (partial mesh), so forward the notices.
                    let peers: Vec<ConnectionId> =
                        self.registry.servers().map(|s| s.conn).collect();
                    for name in removed {
                        self.transfers.drop_involving(&name);
                        self.notify_clients_of_departure(&name);
                        let notice = Frame::DisconnectNotice {
                            identity: name.clone(),
                        };
                        for peer in &peers {
                            self.send_to(*peer, &notice);
                        }
                    }
                    self.broadcast_members_to_clients();
                }
                self.engine.forget(id);
            }
            SessionRole::PeerNegotiating => {
                // Retryable: transport loss during negotiation leaves the
                // registries untouched.
                self.engine.forget(id);
            }
            SessionRole::Unclassified => {}
        }
    }
}

/// Whether a routing result bounced back as a delivery failure
fn nacked(deliveries: &[(ConnectionId, Frame)]) -> bool {
    deliveries
        .iter()
        .any(|(_, frame)| matches!(frame, Frame::DeliveryNack { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::new("s1", "0.0.0.0:9000")
            .with_max_connections(500)
            .with_handshake_timeout(Duration::from_secs(5))
            .with_write_queue_limit(1024);

        assert_eq!(config.server_name, "s1");
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.write_queue_limit, 1024);
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr_and_handle() {
        let server = ChatServer::bind(ServerConfig::new("s1", "127.0.0.1:0"))
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.server_name(), "s1");

        let handle = server.handle();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let err = ChatServer::bind(ServerConfig::new("s1", "not-an-address"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidAddress(_)));
    }
}
