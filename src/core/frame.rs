//! Wire frames for the chat fusion protocol
//!
//! Every logical message is one length-prefixed, kind-tagged frame:
//! a big-endian `u32` body length followed by the body, which starts
//! with a one-byte kind tag. Strings are `u32`-length-prefixed UTF-8.
//!
//! Decoding is resumable: repeated calls with a growing buffer yield the
//! same result as one call with the complete buffer. The codec keeps no
//! state between calls beyond the buffer contents themselves.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChatError, Result};

/// Default maximum size of one encoded frame body
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum size of a chat message text, in encoded bytes
pub const MAX_TEXT_SIZE: usize = 1024;

/// Maximum size of a client username, in encoded bytes
pub const MAX_USERNAME_SIZE: usize = 30;

/// Maximum size of a server name, in encoded bytes
pub const MAX_SERVER_NAME_SIZE: usize = 100;

/// Maximum size of one file chunk payload
pub const MAX_FILE_CHUNK_SIZE: usize = 3_000;

/// Frame header size (4 bytes body length)
const HEADER_SIZE: usize = 4;

mod kind {
    pub const REGISTER: u8 = 0;
    pub const REGISTER_ACK: u8 = 1;
    pub const REGISTER_NACK: u8 = 2;
    pub const PUBLIC_CHAT: u8 = 3;
    pub const PRIVATE_MESSAGE: u8 = 4;
    pub const FILE_OFFER: u8 = 5;
    pub const FILE_CHUNK: u8 = 6;
    pub const FUSION_REQUEST: u8 = 7;
    pub const FUSION_ACCEPT: u8 = 8;
    pub const FUSION_REJECT: u8 = 9;
    pub const MEMBER_LIST_SYNC: u8 = 10;
    pub const DISCONNECT_NOTICE: u8 = 11;
    pub const DELIVERY_NACK: u8 = 12;
}

/// One entry of a fused network's member list.
///
/// Client identities are namespaced by the server that introduced them so
/// that post-fusion collisions can be resolved deterministically on both
/// sides of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    /// Client identity (display name)
    pub name: String,
    /// Name of the origin server that owns this client
    pub origin_server: String,
    /// Listen address of the origin server, as `host:port`
    pub origin_addr: String,
}

impl MemberEntry {
    /// Create a new member entry
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        origin_server: impl Into<String>,
        origin_addr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            origin_server: origin_server.into(),
            origin_addr: origin_addr.into(),
        }
    }

    /// The deterministic ordering key used for collision resolution.
    ///
    /// Both sides of a fusion compute the same key independently, so no
    /// coordinator round-trip is needed for the two networks to converge.
    #[must_use]
    pub fn collision_key(&self) -> String {
        format!("{}@{}", self.name, self.origin_addr)
    }
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client asks to join under the given name
    Register { name: String },
    /// Server confirms registration
    RegisterAck { assigned_name: String },
    /// Server refuses registration (collision, invalid name, forced rename)
    RegisterNack { reason: String },
    /// Chat message broadcast to the whole fused network.
    ///
    /// `origin_server` stamps the server that first received the message
    /// from its client, so forwarding never loops.
    PublicChat {
        origin_server: String,
        sender: String,
        text: String,
    },
    /// Chat message addressed to one identity
    PrivateMessage {
        sender: String,
        target: String,
        text: String,
    },
    /// Announces an upcoming file transfer to one identity
    FileOffer {
        sender: String,
        target: String,
        transfer_id: u32,
        filename: String,
        total_size: u64,
    },
    /// One fragment of a file transfer
    FileChunk {
        transfer_id: u32,
        sequence: u32,
        data: Bytes,
    },
    /// Asks the receiving server to initiate a fusion with `peer_addr`
    FusionRequest { peer_addr: String },
    /// Fusion handshake: the sender's identity and full member list.
    ///
    /// Sent by the initiator right after connecting, and echoed back by
    /// the responder when it accepts; both sides then reconcile the two
    /// lists independently.
    FusionAccept {
        server_name: String,
        server_addr: String,
        members: Vec<MemberEntry>,
    },
    /// Fusion handshake refused
    FusionReject { reason: String },
    /// Authoritative member list of the sending side
    MemberListSync { members: Vec<MemberEntry> },
    /// A client identity left the network
    DisconnectNotice { identity: String },
    /// A routed message could not be delivered; returned to the sender
    DeliveryNack {
        sender: String,
        target: String,
        reason: String,
    },
}

impl Frame {
    /// Get the kind tag of this frame
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Register { .. } => kind::REGISTER,
            Frame::RegisterAck { .. } => kind::REGISTER_ACK,
            Frame::RegisterNack { .. } => kind::REGISTER_NACK,
            Frame::PublicChat { .. } => kind::PUBLIC_CHAT,
            Frame::PrivateMessage { .. } => kind::PRIVATE_MESSAGE,
            Frame::FileOffer { .. } => kind::FILE_OFFER,
            Frame::FileChunk { .. } => kind::FILE_CHUNK,
            Frame::FusionRequest { .. } => kind::FUSION_REQUEST,
            Frame::FusionAccept { .. } => kind::FUSION_ACCEPT,
            Frame::FusionReject { .. } => kind::FUSION_REJECT,
            Frame::MemberListSync { .. } => kind::MEMBER_LIST_SYNC,
            Frame::DisconnectNotice { .. } => kind::DISCONNECT_NOTICE,
            Frame::DeliveryNack { .. } => kind::DELIVERY_NACK,
        }
    }

    /// Human-readable frame kind, for logs
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "Register",
            Frame::RegisterAck { .. } => "RegisterAck",
            Frame::RegisterNack { .. } => "RegisterNack",
            Frame::PublicChat { .. } => "PublicChat",
            Frame::PrivateMessage { .. } => "PrivateMessage",
            Frame::FileOffer { .. } => "FileOffer",
            Frame::FileChunk { .. } => "FileChunk",
            Frame::FusionRequest { .. } => "FusionRequest",
            Frame::FusionAccept { .. } => "FusionAccept",
            Frame::FusionReject { .. } => "FusionReject",
            Frame::MemberListSync { .. } => "MemberListSync",
            Frame::DisconnectNotice { .. } => "DisconnectNotice",
            Frame::DeliveryNack { .. } => "DeliveryNack",
        }
    }

    /// Encode this frame into wire format (length-prefixed, kind-tagged)
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.kind());

        match self {
            Frame::Register { name } => put_string(&mut body, name),
            Frame::RegisterAck { assigned_name } => put_string(&mut body, assigned_name),
            Frame::RegisterNack { reason } => put_string(&mut body, reason),
            Frame::PublicChat {
                origin_server,
                sender,
                text,
            } => {
                put_string(&mut body, origin_server);
                put_string(&mut body, sender);
                put_string(&mut body, text);
            }
            Frame::PrivateMessage {
                sender,
                target,
                text,
            } => {
                put_string(&mut body, sender);
                put_string(&mut body, target);
                put_string(&mut body, text);
            }
            Frame::FileOffer {
                sender,
                target,
                transfer_id,
                filename,
                total_size,
            } => {
                put_string(&mut body, sender);
                put_string(&mut body, target);
                body.put_u32(*transfer_id);
                put_string(&mut body, filename);
                body.put_u64(*total_size);
            }
            Frame::FileChunk {
                transfer_id,
                sequence,
                data,
            } => {
                if data.len() > MAX_FILE_CHUNK_SIZE {
                    return Err(ChatError::protocol(format!(
                        "file chunk of {} bytes exceeds limit of {}",
                        data.len(),
                        MAX_FILE_CHUNK_SIZE
                    )));
                }
                body.put_u32(*transfer_id);
                body.put_u32(*sequence);
                body.put_u32(data.len() as u32);
                body.put_slice(data);
            }
            Frame::FusionRequest { peer_addr } => put_string(&mut body, peer_addr),
            Frame::FusionAccept {
                server_name,
                server_addr,
                members,
            } => {
                put_string(&mut body, server_name);
                put_string(&mut body, server_addr);
                put_member_list(&mut body, members);
            }
            Frame::FusionReject { reason } => put_string(&mut body, reason),
            Frame::MemberListSync { members } => put_member_list(&mut body, members),
            Frame::DisconnectNotice { identity } => put_string(&mut body, identity),
            Frame::DeliveryNack {
                sender,
                target,
                reason,
            } => {
                put_string(&mut body, sender);
                put_string(&mut body, target);
                put_string(&mut body, reason);
            }
        }

        if body.len() > max_frame_size {
            return Err(ChatError::FrameTooLarge(body.len(), max_frame_size));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet contain a full
    /// frame; the caller reads more bytes and calls again. On success the
    /// consumed bytes are removed from `buf`.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        let len = u32::from_be_bytes(length_bytes) as usize;

        // Checked before buffering the body, so a hostile length field
        // cannot force unbounded buffering.
        if len > max_frame_size {
            return Err(ChatError::FrameTooLarge(len, max_frame_size));
        }
        if len == 0 {
            return Err(ChatError::malformed("empty frame body"));
        }

        if buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let mut body = buf.split_to(len).freeze();

        let tag = body.get_u8();
        let frame = match tag {
            kind::REGISTER => Frame::Register {
                name: get_name(&mut body)?,
            },
            kind::REGISTER_ACK => Frame::RegisterAck {
                assigned_name: get_name(&mut body)?,
            },
            kind::REGISTER_NACK => Frame::RegisterNack {
                reason: get_text(&mut body)?,
            },
            kind::PUBLIC_CHAT => Frame::PublicChat {
                origin_server: get_server_string(&mut body)?,
                sender: get_name(&mut body)?,
                text: get_text(&mut body)?,
            },
            kind::PRIVATE_MESSAGE => Frame::PrivateMessage {
                sender: get_name(&mut body)?,
                target: get_name(&mut body)?,
                text: get_text(&mut body)?,
            },
            kind::FILE_OFFER => Frame::FileOffer {
                sender: get_name(&mut body)?,
                target: get_name(&mut body)?,
                transfer_id: get_u32(&mut body)?,
                filename: get_text(&mut body)?,
                total_size: get_u64(&mut body)?,
            },
            kind::FILE_CHUNK => {
                let transfer_id = get_u32(&mut body)?;
                let sequence = get_u32(&mut body)?;
                let data = get_bytes(&mut body)?;
                if data.len() > MAX_FILE_CHUNK_SIZE {
                    return Err(ChatError::malformed(format!(
                        "file chunk of {} bytes exceeds limit of {}",
                        data.len(),
                        MAX_FILE_CHUNK_SIZE
                    )));
                }
                Frame::FileChunk {
                    transfer_id,
                    sequence,
                    data,
                }
            }
            kind::FUSION_REQUEST => Frame::FusionRequest {
                peer_addr: get_server_string(&mut body)?,
            },
            kind::FUSION_ACCEPT => Frame::FusionAccept {
                server_name: get_server_string(&mut body)?,
                server_addr: get_server_string(&mut body)?,
                members: get_member_list(&mut body)?,
            },
            kind::FUSION_REJECT => Frame::FusionReject {
                reason: get_text(&mut body)?,
            },
            kind::MEMBER_LIST_SYNC => Frame::MemberListSync {
                members: get_member_list(&mut body)?,
            },
            kind::DISCONNECT_NOTICE => Frame::DisconnectNotice {
                identity: get_name(&mut body)?,
            },
            kind::DELIVERY_NACK => Frame::DeliveryNack {
                sender: get_name(&mut body)?,
                target: get_name(&mut body)?,
                reason: get_text(&mut body)?,
            },
            other => {
                return Err(ChatError::malformed(format!("unknown kind tag: {}", other)));
            }
        };

        if body.has_remaining() {
            return Err(ChatError::malformed(format!(
                "{} trailing bytes after {} body",
                body.remaining(),
                frame.kind_name()
            )));
        }

        Ok(Some(frame))
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_member_list(buf: &mut BytesMut, members: &[MemberEntry]) {
    buf.put_u32(members.len() as u32);
    for entry in members {
        put_string(buf, &entry.name);
        put_string(buf, &entry.origin_server);
        put_string(buf, &entry.origin_addr);
    }
}

fn get_u32(body: &mut Bytes) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(ChatError::malformed("truncated u32 field"));
    }
    Ok(body.get_u32())
}

fn get_u64(body: &mut Bytes) -> Result<u64> {
    if body.remaining() < 8 {
        return Err(ChatError::malformed("truncated u64 field"));
    }
    Ok(body.get_u64())
}

fn get_bytes(body: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(body)? as usize;
    if body.remaining() < len {
        return Err(ChatError::malformed("truncated byte field"));
    }
    Ok(body.split_to(len))
}

fn get_string(body: &mut Bytes, max_len: usize) -> Result<String> {
    let raw = get_bytes(body)?;
    if raw.len() > max_len {
        return Err(ChatError::malformed(format!(
            "string of {} bytes exceeds field limit of {}",
            raw.len(),
            max_len
        )));
    }
    String::from_utf8(raw.to_vec()).map_err(|_| ChatError::malformed("invalid UTF-8 in string"))
}

fn get_name(body: &mut Bytes) -> Result<String> {
    get_string(body, MAX_USERNAME_SIZE)
}

fn get_server_string(body: &mut Bytes) -> Result<String> {
    get_string(body, MAX_SERVER_NAME_SIZE)
}

fn get_text(body: &mut Bytes) -> Result<String> {
    get_string(body, MAX_TEXT_SIZE)
}

fn get_member_list(body: &mut Bytes) -> Result<Vec<MemberEntry>> {
    let count = get_u32(body)? as usize;
    // The count field is untrusted; the body length bound already limits
    // how many entries can actually be present.
    let mut members = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        members.push(MemberEntry {
            name: get_name(body)?,
            origin_server: get_server_string(body)?,
            origin_addr: get_server_string(body)?,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Register {
                name: "alice".into(),
            },
            Frame::RegisterAck {
                assigned_name: "alice".into(),
            },
            Frame::RegisterNack {
                reason: "name already taken".into(),
            },
            Frame::PublicChat {
                origin_server: "s1".into(),
                sender: "alice".into(),
                text: "hello everyone".into(),
            },
            Frame::PrivateMessage {
                sender: "alice".into(),
                target: "bob".into(),
                text: "psst".into(),
            },
            Frame::FileOffer {
                sender: "alice".into(),
                target: "bob".into(),
                transfer_id: 7,
                filename: "notes.txt".into(),
                total_size: 9001,
            },
            Frame::FileChunk {
                transfer_id: 7,
                sequence: 3,
                data: Bytes::from_static(b"\x00\x01\x02payload"),
            },
            Frame::FusionRequest {
                peer_addr: "127.0.0.1:7777".into(),
            },
            Frame::FusionAccept {
                server_name: "s2".into(),
                server_addr: "127.0.0.1:7777".into(),
                members: vec![
                    MemberEntry::new("bob", "s2", "127.0.0.1:7777"),
                    MemberEntry::new("carol", "s2", "127.0.0.1:7777"),
                ],
            },
            Frame::FusionReject {
                reason: "duplicate server name".into(),
            },
            Frame::MemberListSync {
                members: vec![MemberEntry::new("alice", "s1", "127.0.0.1:6666")],
            },
            Frame::DisconnectNotice {
                identity: "bob".into(),
            },
            Frame::DeliveryNack {
                sender: "alice".into(),
                target: "ghost".into(),
                reason: "not found".into(),
            },
        ]
    }

    #[test]
    fn test_round_trip_all_kinds() {
        for frame in sample_frames() {
            let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
            let mut buf = BytesMut::from(&encoded[..]);
            let decoded = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap();
            assert_eq!(frame, decoded);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_resumption_at_every_boundary() {
        let frame = Frame::PublicChat {
            origin_server: "s1".into(),
            sender: "alice".into(),
            text: "resumable decoding".into(),
        };
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        for split in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..split]);
            assert!(
                Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                    .unwrap()
                    .is_none(),
                "decode returned a frame from a {}-byte prefix",
                split
            );
            buf.extend_from_slice(&encoded[split..]);
            let decoded = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Frame::Register {
            name: "alice".into(),
        };
        let second = Frame::PublicChat {
            origin_server: "s1".into(),
            sender: "alice".into(),
            text: "hi".into(),
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.extend_from_slice(&second.encode(DEFAULT_MAX_FRAME_SIZE).unwrap());

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
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_kind_tag() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn test_oversize_length_rejected_before_body_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32(DEFAULT_MAX_FRAME_SIZE as u32 + 1);
        // Only the header is present; the length check must fire anyway.
        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::FrameTooLarge(_, _)));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let frame = Frame::Register {
            name: "alice".into(),
        };
        let encoded = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut buf = BytesMut::new();
        let body_len = (encoded.len() - HEADER_SIZE + 2) as u32;
        buf.put_u32(body_len);
        buf.put_slice(&encoded[HEADER_SIZE..]);
        buf.put_slice(b"xx");

        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_u8(kind::REGISTER);
        body.put_u32(2);
        body.put_slice(&[0xff, 0xfe]);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn test_encode_respects_max_frame_size() {
        let frame = Frame::PublicChat {
            origin_server: "s1".into(),
            sender: "alice".into(),
            text: "x".repeat(512),
        };
        let err = frame.encode(64).unwrap_err();
        assert!(matches!(err, ChatError::FrameTooLarge(_, _)));
    }

    #[test]
    fn test_over_limit_username_rejected_at_decode() {
        let mut body = BytesMut::new();
        body.put_u8(kind::REGISTER);
        let name = "x".repeat(MAX_USERNAME_SIZE + 1);
        body.put_u32(name.len() as u32);
        body.put_slice(name.as_bytes());

        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn test_oversize_file_chunk_rejected_on_encode() {
        let frame = Frame::FileChunk {
            transfer_id: 1,
            sequence: 0,
            data: Bytes::from(vec![0u8; MAX_FILE_CHUNK_SIZE + 1]),
        };
        let err = frame.encode(DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::ProtocolViolation(_)));
    }

    #[test]
    fn test_oversize_file_chunk_rejected_on_decode() {
        // Hand-built wire bytes, since encode refuses to produce them.
        let oversize = MAX_FILE_CHUNK_SIZE + 1;
        let mut body = BytesMut::new();
        body.put_u8(kind::FILE_CHUNK);
        body.put_u32(1);
        body.put_u32(0);
        body.put_u32(oversize as u32);
        body.put_slice(&vec![0u8; oversize]);

        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        let err = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn test_collision_key_is_name_at_origin() {
        let entry = MemberEntry::new("bob", "s2", "127.0.0.1:7777");
        assert_eq!(entry.collision_key(), "bob@127.0.0.1:7777");
    }
}
