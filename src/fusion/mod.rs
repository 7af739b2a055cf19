//! Fusion protocol engine
//!
//! Negotiates merging two independent server networks into one. The
//! engine holds the per-connection negotiation state machine and the
//! pure reconciliation logic; the server loop performs all I/O.
//!
//! State machine per negotiation:
//! `Requested -> Negotiating -> Committed`, terminal alternate
//! `Rejected`. A transport failure during negotiation is retryable (the
//! operator may re-issue the request); a protocol violation rejects the
//! fusion and closes the offending connection, leaving the original
//! registries untouched.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::core::connection::ConnectionId;
use crate::core::frame::{MemberEntry, MAX_SERVER_NAME_SIZE};
use crate::error::{ChatError, Result};

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionState {
    /// Outbound dial issued, transport not yet up
    Requested,
    /// Transport up, member lists being exchanged
    Negotiating,
    /// Merge committed, peer record created
    Committed,
    /// Negotiation failed; no peer record was created
    Rejected,
}

/// One in-flight fusion negotiation
#[derive(Debug)]
pub struct Negotiation {
    pub state: FusionState,
    /// Peer listen address, when known (always known for outbound)
    pub peer_addr: Option<String>,
    /// Whether this side dialed the connection
    pub outbound: bool,
    pub started: Instant,
}

/// Result of reconciling two member lists.
///
/// `imported` is what the local side adds to its registry; `evicted`
/// names the local identities that lost their collision and must be
/// force-renamed. Both sides compute the same split independently.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub imported: Vec<MemberEntry>,
    pub evicted: Vec<String>,
}

/// Fusion negotiation table
pub struct FusionEngine {
    local_name: String,
    local_addr: String,
    negotiations: HashMap<ConnectionId, Negotiation>,
}

impl FusionEngine {
    /// Create an engine for a server identified by `local_name`,
    /// listening on `local_addr`
    #[must_use]
    pub fn new(local_name: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            local_addr: local_addr.into(),
            negotiations: HashMap::new(),
        }
    }

    /// This server's name
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// This server's listen address
    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Record an outbound negotiation for a dialed connection
    pub fn begin_outbound(&mut self, conn: ConnectionId, peer_addr: impl Into<String>) {
        self.negotiations.insert(
            conn,
            Negotiation {
                state: FusionState::Requested,
                peer_addr: Some(peer_addr.into()),
                outbound: true,
                started: Instant::now(),
            },
        );
    }

    /// Record an inbound negotiation (first frame on an unclassified
    /// connection was a fusion proposal)
    pub fn begin_inbound(&mut self, conn: ConnectionId) {
        self.negotiations.insert(
            conn,
            Negotiation {
                state: FusionState::Negotiating,
                peer_addr: None,
                outbound: false,
                started: Instant::now(),
            },
        );
    }

    /// Outbound connect completed; the proposal is being sent
    pub fn mark_negotiating(&mut self, conn: ConnectionId) {
        if let Some(n) = self.negotiations.get_mut(&conn) {
            n.state = FusionState::Negotiating;
        }
    }

    /// Borrow a negotiation
    #[must_use]
    pub fn negotiation(&self, conn: ConnectionId) -> Option<&Negotiation> {
        self.negotiations.get(&conn)
    }

    /// Whether a connection belongs to an in-flight negotiation
    #[must_use]
    pub fn is_negotiating(&self, conn: ConnectionId) -> bool {
        matches!(
            self.negotiations.get(&conn).map(|n| n.state),
            Some(FusionState::Requested | FusionState::Negotiating)
        )
    }

    /// Whether any outbound dial to this address is already in flight,
    /// so relayed fusion requests stay idempotent
    #[must_use]
    pub fn is_dialing(&self, addr: &str) -> bool {
        self.negotiations.values().any(|n| {
            n.outbound
                && matches!(n.state, FusionState::Requested | FusionState::Negotiating)
                && n.peer_addr.as_deref() == Some(addr)
        })
    }

    /// Commit the negotiation on this connection
    pub fn commit(&mut self, conn: ConnectionId, peer_addr: impl Into<String>) {
        if let Some(n) = self.negotiations.get_mut(&conn) {
            n.state = FusionState::Committed;
            n.peer_addr = Some(peer_addr.into());
        }
    }

    /// Reject and forget the negotiation on this connection
    pub fn reject(&mut self, conn: ConnectionId) {
        if let Some(n) = self.negotiations.get_mut(&conn) {
            n.state = FusionState::Rejected;
        }
        self.negotiations.remove(&conn);
    }

    /// Drop all negotiation state for a connection (transport loss or
    /// post-commit cleanup)
    pub fn forget(&mut self, conn: ConnectionId) {
        self.negotiations.remove(&conn);
    }

    /// Validate a fusion proposal before reconciling.
    ///
    /// The peer's name must be well-formed, distinct from our own and
    /// from every already-fused peer, and its member list must be
    /// internally consistent. Violations reject the fusion.
    pub fn validate_proposal(
        &self,
        peer_name: &str,
        peer_addr: &str,
        members: &[MemberEntry],
        known_servers: &HashSet<String>,
    ) -> Result<()> {
        if peer_name.is_empty() || peer_name.len() > MAX_SERVER_NAME_SIZE {
            return Err(ChatError::protocol(format!(
                "invalid peer server name ({} bytes)",
                peer_name.len()
            )));
        }
        if peer_name == self.local_name {
            return Err(ChatError::protocol("server cannot fuse with itself"));
        }
        if peer_addr == self.local_addr {
            return Err(ChatError::protocol("peer address is our own listen address"));
        }
        if known_servers.contains(peer_name) {
            return Err(ChatError::protocol(format!(
                "server name {:?} already fused",
                peer_name
            )));
        }

        let mut seen = HashSet::with_capacity(members.len());
        for entry in members {
            if entry.name.is_empty() {
                return Err(ChatError::protocol("empty identity in member list"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ChatError::protocol(format!(
                    "inconsistent member list: duplicate identity {:?}",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Split the remote member list into imports and local evictions.
    ///
    /// Collision policy: when both networks contain the same identity,
    /// the entry with the lexicographically smaller
    /// `"{name}@{origin_addr}"` key survives. The comparison is symmetric,
    /// so both negotiating sides converge on the same survivor with no
    /// coordinator round-trip. Equal keys with the same origin server are
    /// the same logical client seen through two paths and are deduped;
    /// equal keys from different servers are irreconcilable and reject
    /// the fusion.
    pub fn reconcile(
        local_members: &[MemberEntry],
        remote_members: &[MemberEntry],
    ) -> Result<Reconciled> {
        let local_by_name: HashMap<&str, &MemberEntry> = local_members
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        let mut out = Reconciled::default();
        for remote in remote_members {
            match local_by_name.get(remote.name.as_str()) {
                None => out.imported.push(remote.clone()),
                Some(local) => {
                    let local_key = local.collision_key();
                    let remote_key = remote.collision_key();
                    if local_key == remote_key {
                        if local.origin_server == remote.origin_server {
                            // Already known transitively; nothing to do.
                            continue;
                        }
                        return Err(ChatError::protocol(format!(
                            "irreconcilable collision on {:?}",
                            remote.name
                        )));
                    }
                    if remote_key < local_key {
                        // Remote survives; the local identity is evicted
                        // and its owner asked to re-register.
                        out.evicted.push(local.name.clone());
                        out.imported.push(remote.clone());
                    }
                    // Otherwise the local entry survives and the remote
                    // side evicts its copy.
                }
            }
        }
        Ok(out)
    }
}
