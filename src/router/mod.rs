//! Routing of application messages across the fused network
//!
//! Given an inbound message, the router decides which connections
//! receive which frames: local clients, a fused peer server for
//! re-forwarding, or a broadcast. It is a pure function over the
//! session registry and the transfer table, so routing rules are unit
//! testable without sockets.

use std::collections::HashMap;

use crate::core::connection::ConnectionId;
use crate::core::frame::Frame;
use crate::registry::{Owner, SessionRegistry};

/// One in-flight file transfer observed by this server
#[derive(Debug, Clone)]
pub struct Transfer {
    pub sender: String,
    pub target: String,
    pub total_size: u64,
    pub received: u64,
}

/// Maps transfer ids announced by [`Frame::FileOffer`] to their route,
/// so subsequent [`Frame::FileChunk`] frames (which carry no identities)
/// can be forwarded.
#[derive(Debug, Default)]
pub struct TransferTable {
    transfers: HashMap<u32, Transfer>,
}

impl TransferTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or re-record) a transfer from an offer
    pub fn insert(&mut self, transfer_id: u32, sender: &str, target: &str, total_size: u64) {
        self.transfers.insert(
            transfer_id,
            Transfer {
                sender: sender.to_string(),
                target: target.to_string(),
                total_size,
                received: 0,
            },
        );
    }

    /// Look up a transfer
    #[must_use]
    pub fn get(&self, transfer_id: u32) -> Option<&Transfer> {
        self.transfers.get(&transfer_id)
    }

    /// Account chunk bytes; removes and returns the transfer when it
    /// completed
    pub fn account(&mut self, transfer_id: u32, bytes: usize) -> Option<Transfer> {
        let transfer = self.transfers.get_mut(&transfer_id)?;
        transfer.received = transfer.received.saturating_add(bytes as u64);
        if transfer.received >= transfer.total_size {
            return self.transfers.remove(&transfer_id);
        }
        None
    }

    /// Drop every transfer that involves the given identity (either
    /// endpoint departed)
    pub fn drop_involving(&mut self, identity: &str) {
        self.transfers
            .retain(|_, t| t.sender != identity && t.target != identity);
    }

    /// Number of in-flight transfers
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Stateless routing rules
pub struct Router;

impl Router {
    /// Decide deliveries for a public chat message.
    ///
    /// A message from a local client is stamped with this server's name,
    /// delivered to every local client (sender included) and forwarded
    /// once to each directly fused peer. A message arriving from a peer
    /// is delivered to local clients only and never re-forwarded, so a
    /// fused mesh delivers it exactly once; the origin stamp additionally
    /// guards against echoes to the arrival server.
    #[must_use]
    pub fn route_public(
        registry: &SessionRegistry,
        local_server: &str,
        from: ConnectionId,
        from_peer: bool,
        sender: String,
        origin_server: String,
        text: String,
    ) -> Vec<(ConnectionId, Frame)> {
        let origin = if from_peer {
            origin_server
        } else {
            local_server.to_string()
        };
        let frame = Frame::PublicChat {
            origin_server: origin.clone(),
            sender,
            text,
        };

        let mut out: Vec<(ConnectionId, Frame)> = registry
            .local_client_conns()
            .map(|conn| (conn, frame.clone()))
            .collect();
        out.sort_by_key(|(conn, _)| *conn);

        if !from_peer {
            for server in registry.servers() {
                if server.conn != from {
                    out.push((server.conn, frame.clone()));
                }
            }
        }
        out
    }

    /// Decide deliveries for an identity-addressed frame (private
    /// message or file offer). An unknown target is reported back to the
    /// sender as a nack, never silently dropped.
    #[must_use]
    pub fn route_to_identity(
        registry: &SessionRegistry,
        from: ConnectionId,
        sender: &str,
        target: &str,
        frame: Frame,
    ) -> Vec<(ConnectionId, Frame)> {
        match registry.lookup(target).map(|r| r.owner.clone()) {
            Some(Owner::Local(conn)) => vec![(conn, frame)],
            Some(Owner::Peer(server_name)) => match registry.server(&server_name) {
                // Forwarded exactly once; the owning peer fans out no
                // further for identity-addressed frames.
                Some(server) => vec![(server.conn, frame)],
                None => vec![(from, Self::nack(sender, target, "owning server unreachable"))],
            },
            None => vec![(from, Self::nack(sender, target, "identity not found"))],
        }
    }

    /// Route a file chunk through the transfer table
    #[must_use]
    pub fn route_chunk(
        registry: &SessionRegistry,
        transfers: &mut TransferTable,
        from: ConnectionId,
        transfer_id: u32,
        sequence: u32,
        data: bytes::Bytes,
    ) -> Vec<(ConnectionId, Frame)> {
        let Some(transfer) = transfers.get(transfer_id).cloned() else {
            return vec![(
                from,
                Self::nack("", "", &format!("unknown transfer {}", transfer_id)),
            )];
        };

        let chunk_len = data.len();
        let frame = Frame::FileChunk {
            transfer_id,
            sequence,
            data,
        };
        let out = Self::route_to_identity(registry, from, &transfer.sender, &transfer.target, frame);
        transfers.account(transfer_id, chunk_len);
        out
    }

    /// Route a delivery nack back toward the original sender
    #[must_use]
    pub fn route_nack(
        registry: &SessionRegistry,
        sender: &str,
        frame: Frame,
    ) -> Vec<(ConnectionId, Frame)> {
        match registry.lookup(sender).map(|r| r.owner.clone()) {
            Some(Owner::Local(conn)) => vec![(conn, frame)],
            Some(Owner::Peer(server_name)) => registry
                .server(&server_name)
                .map(|s| vec![(s.conn, frame)])
                .unwrap_or_default(),
            // Sender departed too; nothing left to notify.
            None => Vec::new(),
        }
    }

    fn nack(sender: &str, target: &str, reason: &str) -> Frame {
        Frame::DeliveryNack {
            sender: sender.to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::MemberEntry;
    use crate::registry::ServerRecord;

    fn fused_registry() -> SessionRegistry {
        // Local: alice(conn 1), bob(conn 2). Peer s2 (conn 9) owns carol.
        let mut reg = SessionRegistry::new();
        reg.register_local("alice", "s1", "a:1", ConnectionId(1))
            .unwrap();
        reg.register_local("bob", "s1", "a:1", ConnectionId(2))
            .unwrap();
        reg.add_server(ServerRecord {
            name: "s2".into(),
            addr: "b:2".into(),
            conn: ConnectionId(9),
        })
        .unwrap();
        reg.register_peer_client(&MemberEntry::new("carol", "s2", "b:2"), "s2")
            .unwrap();
        reg
    }

    #[test]
    fn test_public_from_local_client_reaches_clients_and_peers_once() {
        let reg = fused_registry();
        let out = Router::route_public(
            &reg,
            "s1",
            ConnectionId(1),
            false,
            "alice".into(),
            String::new(),
            "hi".into(),
        );

        let targets: Vec<_> = out.iter().map(|(c, _)| *c).collect();
        assert_eq!(targets, vec![ConnectionId(1), ConnectionId(2), ConnectionId(9)]);

        // Origin is stamped with the local server name.
        for (_, frame) in &out {
            match frame {
                Frame::PublicChat { origin_server, .. } => assert_eq!(origin_server, "s1"),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[test]
    fn test_public_from_peer_is_never_reforwarded() {
        let reg = fused_registry();
        let out = Router::route_public(
            &reg,
            "s1",
            ConnectionId(9),
            true,
            "carol".into(),
            "s2".into(),
            "hi".into(),
        );

        let targets: Vec<_> = out.iter().map(|(c, _)| *c).collect();
        assert_eq!(targets, vec![ConnectionId(1), ConnectionId(2)]);
    }

    #[test]
    fn test_private_to_local_and_remote_targets() {
        let reg = fused_registry();

        let frame = Frame::PrivateMessage {
            sender: "alice".into(),
            target: "bob".into(),
            text: "psst".into(),
        };
        let out = Router::route_to_identity(&reg, ConnectionId(1), "alice", "bob", frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ConnectionId(2));

        let frame = Frame::PrivateMessage {
            sender: "alice".into(),
            target: "carol".into(),
            text: "psst".into(),
        };
        let out = Router::route_to_identity(&reg, ConnectionId(1), "alice", "carol", frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ConnectionId(9));
    }

    #[test]
    fn test_unknown_target_nacks_sender() {
        let reg = fused_registry();
        let frame = Frame::PrivateMessage {
            sender: "alice".into(),
            target: "ghost".into(),
            text: "hello?".into(),
        };
        let out = Router::route_to_identity(&reg, ConnectionId(1), "alice", "ghost", frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ConnectionId(1));
        assert!(matches!(
            &out[0].1,
            Frame::DeliveryNack { target, .. } if target == "ghost"
        ));
    }

    #[test]
    fn test_chunk_follows_offer_route_and_completes() {
        let reg = fused_registry();
        let mut transfers = TransferTable::new();
        transfers.insert(7, "alice", "carol", 6);

        let out = Router::route_chunk(
            &reg,
            &mut transfers,
            ConnectionId(1),
            7,
            0,
            bytes::Bytes::from_static(b"abc"),
        );
        assert_eq!(out[0].0, ConnectionId(9));
        assert_eq!(transfers.get(7).unwrap().received, 3);

        let _ = Router::route_chunk(
            &reg,
            &mut transfers,
            ConnectionId(1),
            7,
            1,
            bytes::Bytes::from_static(b"def"),
        );
        // Transfer completed and was dropped from the table.
        assert!(transfers.get(7).is_none());
    }

    #[test]
    fn test_unknown_transfer_nacks_arrival_connection() {
        let reg = fused_registry();
        let mut transfers = TransferTable::new();
        let out = Router::route_chunk(
            &reg,
            &mut transfers,
            ConnectionId(1),
            42,
            0,
            bytes::Bytes::from_static(b"x"),
        );
        assert_eq!(out[0].0, ConnectionId(1));
        assert!(matches!(&out[0].1, Frame::DeliveryNack { .. }));
    }

    #[test]
    fn test_transfer_table_drop_involving() {
        let mut transfers = TransferTable::new();
        transfers.insert(1, "alice", "carol", 10);
        transfers.insert(2, "bob", "dave", 10);
        transfers.drop_involving("carol");
        assert!(transfers.get(1).is_none());
        assert!(transfers.get(2).is_some());
    }
}
