//! Connection wrapper around one TCP socket
//!
//! A [`Connection`] owns its partial-read buffer and its ordered outbound
//! write queue. All socket I/O is non-blocking: the reactor calls
//! [`Connection::pump_read`] on read readiness and
//! [`Connection::pump_write`] on write readiness, and both stop at
//! `WouldBlock` to be resumed on the next ready event.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::core::frame::Frame;
use crate::error::{ChatError, Result};

/// How many extra buffered bytes beyond one maximum frame a single
/// read pump may accumulate before yielding back to the reactor.
const READ_PUMP_SLACK: usize = 64 * 1024;

/// Identifier of one registered connection.
///
/// Ids are assigned monotonically by the reactor, so ordering ids orders
/// connections by registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport up, registration or fusion handshake not yet complete
    Authenticating,
    /// Handshake complete; application messages are legal
    Established,
    /// Marked for removal; swept between reactor iterations
    Closing,
}

/// Result of one read pump
#[derive(Debug)]
pub struct ReadOutcome {
    /// Complete frames decoded from the buffer, in arrival order
    pub frames: Vec<Frame>,
    /// Whether the peer closed its end of the stream
    pub closed: bool,
}

/// One socket plus its pending-write queue and partial-read buffer
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    state: ConnectionState,
    read_buf: BytesMut,
    write_queue: VecDeque<Bytes>,
    /// Byte offset into the front queued frame; partially written frames
    /// are resumed here, never re-sent or reordered.
    write_cursor: usize,
    queued_bytes: usize,
    paused: bool,
    close_after_flush: bool,
    opened_at: Instant,
}

impl Connection {
    /// Wrap an accepted or dialed stream
    #[must_use]
    pub fn new(id: ConnectionId, stream: TcpStream, state: ConnectionState) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer_addr,
            state,
            read_buf: BytesMut::with_capacity(4096),
            write_queue: VecDeque::new(),
            write_cursor: 0,
            queued_bytes: 0,
            paused: false,
            close_after_flush: false,
            opened_at: Instant::now(),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if known
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transition the lifecycle state
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Mark the connection for removal. Remaining queued frames for this
    /// connection are discarded; other connections are unaffected.
    pub fn begin_close(&mut self) {
        self.state = ConnectionState::Closing;
        self.write_queue.clear();
        self.write_cursor = 0;
        self.queued_bytes = 0;
    }

    /// The underlying stream (for readiness polling)
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether any outbound bytes are pending
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Total bytes currently queued for write
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether reading from this connection is suspended (flow control)
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Suspend or resume reading from this connection
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Time since the connection was registered
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Whether a handshake deadline has passed for a connection that is
    /// not yet established
    #[must_use]
    pub fn handshake_expired(&self, timeout: Duration) -> bool {
        self.state != ConnectionState::Established
            && self.state != ConnectionState::Closing
            && self.age() > timeout
    }

    /// Close once every queued frame has been flushed.
    ///
    /// Used when a nack or reject must still reach the peer before the
    /// connection is torn down.
    pub fn set_close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    /// Whether a pending close-after-flush can proceed now
    #[must_use]
    pub fn flushed_for_close(&self) -> bool {
        self.close_after_flush && self.write_queue.is_empty()
    }

    /// Restart the handshake window, e.g. when a forced rename sends an
    /// established client back to the authenticating state.
    pub fn reset_handshake_deadline(&mut self) {
        self.opened_at = Instant::now();
    }

    /// Encode a frame and append it to the outbound queue
    pub fn queue_frame(&mut self, frame: &Frame, max_frame_size: usize) -> Result<()> {
        if self.state == ConnectionState::Closing {
            return Ok(());
        }
        let encoded = frame.encode(max_frame_size)?;
        self.queued_bytes += encoded.len();
        self.write_queue.push_back(encoded);
        Ok(())
    }

    /// Read as much as the socket offers and decode complete frames.
    ///
    /// Frames are returned in arrival order and must be dispatched in that
    /// order before the connection is pumped again, which preserves the
    /// per-connection ordering guarantee. End of stream is reported via
    /// [`ReadOutcome::closed`] after any already-buffered frames.
    pub fn pump_read(&mut self, max_frame_size: usize) -> Result<ReadOutcome> {
        let mut closed = false;
        let read_cap = max_frame_size + READ_PUMP_SLACK;

        while self.read_buf.len() < read_cap {
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ChatError::Transport(e)),
            }
        }

        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(&mut self.read_buf, max_frame_size)? {
            frames.push(frame);
        }

        Ok(ReadOutcome { frames, closed })
    }

    /// Flush as much of the queued frames as the socket accepts.
    ///
    /// Returns `true` when the queue drained completely. A partial write
    /// keeps its cursor and resumes on the next writable event.
    pub fn pump_write(&mut self) -> Result<bool> {
        while let Some(front) = self.write_queue.front() {
            match self.stream.try_write(&front[self.write_cursor..]) {
                Ok(n) => {
                    self.write_cursor += n;
                    self.queued_bytes -= n;
                    if self.write_cursor == front.len() {
                        self.write_queue.pop_front();
                        self.write_cursor = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ChatError::Transport(e)),
            }
        }
        Ok(self.write_queue.is_empty())
    }
}

/// Set TCP keep-alive on a socket; failures are logged, not fatal
pub(crate) fn apply_keep_alive(stream: &TcpStream, interval: Duration) {
    let sock = socket2::SockRef::from(stream);
    let keep_alive = socket2::TcpKeepalive::new().with_time(interval);
    if let Err(e) = sock.set_tcp_keepalive(&keep_alive) {
        tracing::warn!("failed to set keep-alive: {}", e);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("queued_bytes", &self.queued_bytes)
            .field("paused", &self.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::DEFAULT_MAX_FRAME_SIZE;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = TcpStream::connect(addr);
        let (accepted, dialed) = tokio::join!(listener.accept(), dial);
        (accepted.unwrap().0, dialed.unwrap())
    }

    #[tokio::test]
    async fn test_queue_and_flush_preserves_order() {
        let (local, mut remote) = socket_pair().await;
        let mut conn = Connection::new(ConnectionId(1), local, ConnectionState::Established);

        let first = Frame::Register {
            name: "alice".into(),
        };
        let second = Frame::PublicChat {
            origin_server: "s1".into(),
            sender: "alice".into(),
            text: "hi".into(),
        };
        conn.queue_frame(&first, DEFAULT_MAX_FRAME_SIZE).unwrap();
        conn.queue_frame(&second, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(conn.wants_write());

        // Small frames flush in one pump against a fresh socket. Await
        // writability first so tokio's readiness cache is primed, as the
        // reactor does before pumping.
        conn.stream().writable().await.unwrap();
        assert!(conn.pump_write().unwrap());
        assert_eq!(conn.queued_bytes(), 0);

        let expected = first.encode(DEFAULT_MAX_FRAME_SIZE).unwrap().len()
            + second.encode(DEFAULT_MAX_FRAME_SIZE).unwrap().len();
        let mut received = BytesMut::with_capacity(expected);
        while received.len() < expected {
            let n = remote.read_buf(&mut received).await.unwrap();
            assert!(n > 0);
        }
        let mut buf = received;
        assert_eq!(
            Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap(),
            first
        );
        assert_eq!(
            Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap(),
            second
        );
    }

    #[tokio::test]
    async fn test_pump_read_decodes_in_order_and_reports_eof() {
        let (local, remote) = socket_pair().await;
        let mut conn = Connection::new(ConnectionId(1), local, ConnectionState::Established);

        let first = Frame::Register {
            name: "alice".into(),
        };
        let second = Frame::DisconnectNotice {
            identity: "bob".into(),
        };
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        wire.extend_from_slice(&second.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());

        remote.writable().await.unwrap();
        remote.try_write(&wire).unwrap();
        drop(remote);

        // Wait for the bytes (and the FIN) to arrive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.stream().readable().await.unwrap();

        let outcome = conn.pump_read(DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(outcome.frames, vec![first, second]);
        assert!(outcome.closed);
    }

    #[tokio::test]
    async fn test_begin_close_discards_queue() {
        let (local, _remote) = socket_pair().await;
        let mut conn = Connection::new(ConnectionId(1), local, ConnectionState::Established);
        conn.queue_frame(
            &Frame::RegisterAck {
                assigned_name: "alice".into(),
            },
            DEFAULT_MAX_FRAME_SIZE,
        )
        .unwrap();

        conn.begin_close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.wants_write());
        assert_eq!(conn.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_handshake_expiry_only_before_established() {
        let (local, _remote) = socket_pair().await;
        let mut conn = Connection::new(ConnectionId(1), local, ConnectionState::Authenticating);
        assert!(conn.handshake_expired(Duration::ZERO));

        conn.set_state(ConnectionState::Established);
        assert!(!conn.handshake_expired(Duration::ZERO));
    }
}
