//! Chat Fusion System
//!
//! A federated chat engine: independent chat servers fuse into one
//! logical network with a single flat identity namespace, without a
//! central coordinator.
//!
//! ## Features
//!
//! - Length-prefixed binary frame protocol
//! - Single-threaded reactor per server, deterministic dispatch order
//! - Coordinator-free fusion with symmetric collision resolution
//! - Public, private, and file-transfer routing across fused servers
//! - Backpressure via per-connection write queues and read pausing
//! - Configurable timeouts, keep-alive, and connection limits
//!
//! ## Example
//!
//! ```no_run
//! use chat_fusion_system::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new("alpha", "127.0.0.1:7878");
//!     let server = ChatServer::bind(config).await?;
//!
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         // Fuse with a second server once it is up.
//!         let _ = handle.request_fusion("127.0.0.1:7879");
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod core;
pub mod error;
pub mod fusion;
pub mod registry;
pub mod router;
pub mod server;

// Re-export main types
pub use client::{ChatClient, ClientConfig, ClientEvent, ClientHandle};
pub use crate::core::{
    Connection, ConnectionId, ConnectionState, Frame, MemberEntry, Reactor, Readiness,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use error::{ChatError, Result};
pub use fusion::{FusionEngine, FusionState, Reconciled};
pub use registry::{ClientRecord, Owner, ServerRecord, SessionRegistry};
pub use router::{Router, Transfer, TransferTable};
pub use server::{ChatServer, ServerCommand, ServerConfig, ServerHandle};
