//! Core networking: frame codec, connection, reactor

pub mod connection;
pub mod frame;
pub mod reactor;

pub use connection::{Connection, ConnectionId, ConnectionState, ReadOutcome};
pub use frame::{Frame, MemberEntry, DEFAULT_MAX_FRAME_SIZE};
pub use reactor::{Reactor, Readiness};
