//! Error types for the chat fusion system

use std::io;
use thiserror::Error;

/// Result type for chat fusion operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat fusion system errors
#[derive(Debug, Error)]
pub enum ChatError {
    /// A frame could not be decoded (unknown kind tag, bad UTF-8, truncated body)
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame declared a length above the configured maximum
    #[error("Frame too large: {0} bytes (max: {1} bytes)")]
    FrameTooLarge(usize, usize),

    /// A message kind illegal for the connection's state or negotiated role
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A live identity with the same name already exists in the fused network
    #[error("Name collision: {0}")]
    NameCollision(String),

    /// Routing target unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// Socket error or end of stream
    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),

    /// A registration or fusion handshake did not complete in time
    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    /// Address parse error
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid state error (API misuse)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Channel error (command or event channel closed)
    #[error("Channel error: {0}")]
    Channel(String),
}

impl ChatError {
    /// Create a malformed-frame error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a protocol-violation error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a name-collision error
    pub fn collision<S: Into<String>>(name: S) -> Self {
        Self::NameCollision(name.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(name: S) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a handshake-timeout error
    pub fn handshake_timeout<S: Into<String>>(msg: S) -> Self {
        Self::HandshakeTimeout(msg.into())
    }

    /// Create an invalid-address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a channel error
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a transport failure from an end-of-stream condition
    pub fn closed_by_peer() -> Self {
        Self::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))
    }

    /// Whether this error must close the offending connection.
    ///
    /// Framing and protocol-role errors always close (untrusted input is
    /// never tolerated past this point); routing misses and registration
    /// collisions are reported to the sender and the connection stays open.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::NameCollision(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChatError::FrameTooLarge(2048, 1024);
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));

        let err = ChatError::protocol("fusion frame from client session");
        assert!(err.to_string().contains("Protocol violation"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ChatError::malformed("bad tag").is_connection_fatal());
        assert!(ChatError::closed_by_peer().is_connection_fatal());
        assert!(!ChatError::not_found("bob").is_connection_fatal());
        assert!(!ChatError::collision("alice").is_connection_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: ChatError = io_err.into();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
