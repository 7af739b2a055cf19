//! Session registry: identity ownership across the fused network
//!
//! The registry is the single serialization point for identity
//! uniqueness. All mutation happens inside message-handling callbacks
//! invoked from the reactor, so the no-duplicate-live-identity invariant
//! holds by construction without locking.

use std::collections::HashMap;

use crate::core::connection::ConnectionId;
use crate::core::frame::MemberEntry;
use crate::error::{ChatError, Result};

/// Who a client record is reachable through. Exactly one owner is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Client is connected to this process
    Local(ConnectionId),
    /// Client is reachable via the named directly-fused peer server
    Peer(String),
}

/// A live client identity
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Unique display name within the fused network
    pub name: String,
    /// Server that introduced this identity
    pub origin_server: String,
    /// Listen address of the origin server
    pub origin_addr: String,
    pub owner: Owner,
}

impl ClientRecord {
    /// Member-list entry for sync frames
    #[must_use]
    pub fn entry(&self) -> MemberEntry {
        MemberEntry::new(
            self.name.clone(),
            self.origin_server.clone(),
            self.origin_addr.clone(),
        )
    }
}

/// A directly fused peer server.
///
/// Created on successful fusion commit; destroyed when the peer
/// connection drops, cascading removal of all client identities it owns.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub name: String,
    /// Listen address of the peer, as `host:port`
    pub addr: String,
    pub conn: ConnectionId,
}

/// Identity and peer-server tables
#[derive(Debug, Default)]
pub struct SessionRegistry {
    clients: HashMap<String, ClientRecord>,
    servers: HashMap<String, ServerRecord>,
    /// Reverse index: local client connection -> identity
    by_conn: HashMap<ConnectionId, String>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client connected to this process.
    ///
    /// Fails with [`ChatError::NameCollision`] when the identity is
    /// already live anywhere in the fused network.
    pub fn register_local(
        &mut self,
        name: &str,
        origin_server: &str,
        origin_addr: &str,
        conn: ConnectionId,
    ) -> Result<()> {
        if self.clients.contains_key(name) {
            return Err(ChatError::collision(name));
        }
        self.clients.insert(
            name.to_string(),
            ClientRecord {
                name: name.to_string(),
                origin_server: origin_server.to_string(),
                origin_addr: origin_addr.to_string(),
                owner: Owner::Local(conn),
            },
        );
        self.by_conn.insert(conn, name.to_string());
        Ok(())
    }

    /// Register a client reachable through a fused peer server
    pub fn register_peer_client(&mut self, entry: &MemberEntry, via_server: &str) -> Result<()> {
        if self.clients.contains_key(&entry.name) {
            return Err(ChatError::collision(&entry.name));
        }
        self.clients.insert(
            entry.name.clone(),
            ClientRecord {
                name: entry.name.clone(),
                origin_server: entry.origin_server.clone(),
                origin_addr: entry.origin_addr.clone(),
                owner: Owner::Peer(via_server.to_string()),
            },
        );
        Ok(())
    }

    /// Look up a client identity
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ClientRecord> {
        self.clients.get(name)
    }

    /// Identity registered on a local connection, if any
    #[must_use]
    pub fn name_of_conn(&self, conn: ConnectionId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    /// Remove one identity
    pub fn remove(&mut self, name: &str) -> Option<ClientRecord> {
        let record = self.clients.remove(name)?;
        if let Owner::Local(conn) = record.owner {
            self.by_conn.remove(&conn);
        }
        Some(record)
    }

    /// Remove the identity owned by a local connection, if any
    pub fn remove_by_conn(&mut self, conn: ConnectionId) -> Option<ClientRecord> {
        let name = self.by_conn.remove(&conn)?;
        self.clients.remove(&name)
    }

    /// Remove every client owned by the named peer server. Returns the
    /// removed identities (cascade cleanup after a peer drop).
    pub fn remove_all_owned_by(&mut self, server_name: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .clients
            .values()
            .filter(|c| matches!(&c.owner, Owner::Peer(s) if s == server_name))
            .map(|c| c.name.clone())
            .collect();
        for name in &doomed {
            self.clients.remove(name);
        }
        doomed
    }

    /// Point peer-owned records introduced by `origin_server` at that
    /// server itself. Used when fusing directly with a server whose
    /// clients were previously imported through another peer.
    pub fn rebind_origin(&mut self, origin_server: &str) {
        for record in self.clients.values_mut() {
            if record.origin_server == origin_server
                && matches!(record.owner, Owner::Peer(_))
            {
                record.owner = Owner::Peer(origin_server.to_string());
            }
        }
    }

    /// Record a fused peer server
    pub fn add_server(&mut self, record: ServerRecord) -> Result<()> {
        if self.servers.contains_key(&record.name) {
            return Err(ChatError::collision(&record.name));
        }
        self.servers.insert(record.name.clone(), record);
        Ok(())
    }

    /// Look up a fused peer server by name
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.get(name)
    }

    /// The peer server attached to a connection, if any
    #[must_use]
    pub fn server_by_conn(&self, conn: ConnectionId) -> Option<&ServerRecord> {
        self.servers.values().find(|s| s.conn == conn)
    }

    /// Whether a peer with this listen address is already fused
    #[must_use]
    pub fn has_server_addr(&self, addr: &str) -> bool {
        self.servers.values().any(|s| s.addr == addr)
    }

    /// Drop the peer server attached to a connection and cascade-remove
    /// the clients it owned. Returns `(server, removed client names)`.
    pub fn remove_server_by_conn(
        &mut self,
        conn: ConnectionId,
    ) -> Option<(ServerRecord, Vec<String>)> {
        let name = self
            .servers
            .values()
            .find(|s| s.conn == conn)
            .map(|s| s.name.clone())?;
        let record = self.servers.remove(&name)?;
        let removed = self.remove_all_owned_by(&record.name);
        Some((record, removed))
    }

    /// All fused peer servers
    pub fn servers(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values()
    }

    /// All local client connections (for broadcast)
    pub fn local_client_conns(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.by_conn.keys().copied()
    }

    /// Snapshot of every live identity, as member-list entries
    #[must_use]
    pub fn members(&self) -> Vec<MemberEntry> {
        let mut members: Vec<MemberEntry> = self.clients.values().map(ClientRecord::entry).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Snapshot of identities owned by this process only
    #[must_use]
    pub fn local_members(&self) -> Vec<MemberEntry> {
        let mut members: Vec<MemberEntry> = self
            .clients
            .values()
            .filter(|c| matches!(c.owner, Owner::Local(_)))
            .map(ClientRecord::entry)
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Number of live client identities
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
