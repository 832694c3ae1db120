use std::hash::Hasher;

use thiserror::Error;
use twox_hash::XxHash64;

use crate::{
    message::{Message, MessageType},
    protocol::{ProtocolVersion, needs_checksum},
};

/// `len: u32` + `type: u16`, always present, always first.
pub const FIXED_HEADER_SIZE: usize = 4 + 2;

pub(crate) const CHECKSUM_SIZE: usize = 8;

/// Policy limit on a single frame. Anything larger is treated as a
/// protocol violation before type-specific parsing starts.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed or corrupt frame")]
    BadMessage,
    #[error("{len} byte frame exceeds the frame size limit")]
    TooBig { len: usize },
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("message not encodable at the negotiated protocol")]
    ProtoNoSupport,
}

/// Checksum of every frame byte after the `cksum` field itself.
pub fn frame_checksum(body: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(body);
    hasher.finish()
}

impl Message {
    /// Exact on-wire size of the full frame at `proto`. Non-increasing in
    /// `proto` for every kind, which is what makes pre-negotiation budget
    /// reservations an upper bound.
    pub fn encoded_size(&self, proto: ProtocolVersion) -> usize {
        let cksum = if needs_checksum(self.msg_type(), proto) { CHECKSUM_SIZE } else { 0 };
        FIXED_HEADER_SIZE + cksum + self.body_size(proto)
    }

    /// Append one complete frame to `buf`. Total over well-typed messages
    /// at any supported `proto >= min_protocol()`.
    pub fn encode_into(&self, buf: &mut Vec<u8>, proto: ProtocolVersion) -> Result<(), WireError> {
        if proto < self.min_protocol() {
            return Err(WireError::ProtoNoSupport);
        }
        let start = buf.len();
        buf.extend_from_slice(&[0u8; FIXED_HEADER_SIZE]);
        buf[start + 4..start + 6].copy_from_slice(&(self.msg_type() as u16).to_le_bytes());
        let cksum_at = needs_checksum(self.msg_type(), proto).then(|| {
            let at = buf.len();
            buf.extend_from_slice(&[0u8; CHECKSUM_SIZE]);
            at
        });
        let body_start = buf.len();
        self.encode_body(buf, proto)?;
        if let Some(at) = cksum_at {
            let sum = frame_checksum(&buf[body_start..]);
            buf[at..at + CHECKSUM_SIZE].copy_from_slice(&sum.to_le_bytes());
        }
        let len = buf.len() - start;
        if len > MAX_FRAME_LEN {
            buf.truncate(start);
            return Err(WireError::TooBig { len });
        }
        buf[start..start + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Parse one complete frame whose fixed header has already been consumed
/// and length-validated. `body` is everything after the `type` field.
/// Unknown types decode to `None`; the caller skips them by length.
pub fn decode_frame(
    ty_raw: u16,
    body: &[u8],
    proto: ProtocolVersion,
) -> Result<Option<Message>, WireError> {
    let Some(ty) = MessageType::from_repr(ty_raw) else {
        return Ok(None);
    };
    let body = if needs_checksum(ty, proto) {
        if body.len() < CHECKSUM_SIZE {
            return Err(WireError::BadMessage);
        }
        let (cksum, rest) = body.split_at(CHECKSUM_SIZE);
        let expect = u64::from_le_bytes(cksum.try_into().unwrap());
        if frame_checksum(rest) != expect {
            return Err(WireError::BadMessage);
        }
        rest
    } else {
        body
    };
    Message::decode_body(ty, body, proto).map(Some)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        Ack, Append, Hello, MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED, NodeId,
        PROTO_COMPACT_STORED, ShardStatus, Status, Stored,
    };

    fn stored(rqid: u64) -> Message {
        Message::Stored(Stored {
            rqid,
            log_id: 7,
            lsn: 0xABCD_0001,
            wave: 2,
            status: Status::Ok,
            flags: 0,
            shard: 3,
        })
    }

    fn roundtrip(msg: &Message, proto: ProtocolVersion) -> Message {
        let mut buf = Vec::new();
        msg.encode_into(&mut buf, proto).unwrap();
        assert_eq!(buf.len(), msg.encoded_size(proto), "encoded_size must be exact");

        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len(), "len covers the whole frame");
        let ty = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        decode_frame(ty, &buf[FIXED_HEADER_SIZE..], proto).unwrap().unwrap()
    }

    #[test]
    fn hello_frame_layout() {
        let msg = Message::Hello(Hello {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: MAX_PROTOCOL_SUPPORTED,
            destination: None,
            cluster_name: None,
            build_info: None,
        });
        let mut buf = Vec::new();
        msg.encode_into(&mut buf, MIN_PROTOCOL_SUPPORTED).unwrap();

        // len, type, proto_min, proto_max, flags; no checksum on handshake.
        assert_eq!(buf.len(), 4 + 2 + 2 + 2 + 2);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), MessageType::Hello as u16);
        assert_eq!(u16::from_le_bytes(buf[6..8].try_into().unwrap()), MIN_PROTOCOL_SUPPORTED);
        assert_eq!(u16::from_le_bytes(buf[8..10].try_into().unwrap()), MAX_PROTOCOL_SUPPORTED);
        assert_eq!(u16::from_le_bytes(buf[10..12].try_into().unwrap()), 0);
    }

    #[test]
    fn hello_optional_fields() {
        let msg = Message::Hello(Hello {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: MAX_PROTOCOL_SUPPORTED,
            destination: Some(NodeId::new(4, 9)),
            cluster_name: Some("prod.logs".to_owned()),
            build_info: Some("strand 0.1".to_owned()),
        });
        let Message::Hello(decoded) = roundtrip(&msg, MIN_PROTOCOL_SUPPORTED) else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.destination, Some(NodeId::new(4, 9)));
        assert_eq!(decoded.cluster_name.as_deref(), Some("prod.logs"));
        assert_eq!(decoded.build_info.as_deref(), Some("strand 0.1"));
    }

    #[test]
    fn ack_roundtrip() {
        let msg = Message::Ack(Ack {
            options: 1,
            rqid: 42,
            client_idx: 17,
            proto: 4,
            status: Status::ProtoNoSupport,
        });
        let Message::Ack(decoded) = roundtrip(&msg, MIN_PROTOCOL_SUPPORTED) else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.status, Status::ProtoNoSupport);
        assert_eq!(decoded.client_idx, 17);
        assert_eq!(decoded.proto, 4);
    }

    #[test]
    fn append_carries_length_prefixed_payload() {
        let msg = Message::Append(Append {
            rqid: 1,
            log_id: 2,
            flags: 0,
            payload: Bytes::from_static(b"record body"),
            cancel: None,
        });
        let Message::Append(decoded) = roundtrip(&msg, MAX_PROTOCOL_SUPPORTED) else {
            panic!("wrong kind");
        };
        assert_eq!(&decoded.payload[..], b"record body");
    }

    #[test]
    fn stored_legacy_field_dropped_at_compact_proto() {
        let msg = stored(5);
        assert_eq!(
            msg.encoded_size(PROTO_COMPACT_STORED - 1),
            msg.encoded_size(PROTO_COMPACT_STORED) + 8
        );
        let Message::Stored(old) = roundtrip(&msg, PROTO_COMPACT_STORED - 1) else {
            panic!("wrong kind");
        };
        let Message::Stored(new) = roundtrip(&msg, PROTO_COMPACT_STORED) else {
            panic!("wrong kind");
        };
        assert_eq!(old, new);
    }

    #[test]
    fn checksum_detects_corruption() {
        let msg = stored(5);
        let mut buf = Vec::new();
        msg.encode_into(&mut buf, MAX_PROTOCOL_SUPPORTED).unwrap();

        // Flip one body byte; the frame must no longer decode.
        *buf.last_mut().unwrap() ^= 0xFF;
        let err = decode_frame(
            MessageType::Stored as u16,
            &buf[FIXED_HEADER_SIZE..],
            MAX_PROTOCOL_SUPPORTED,
        )
        .unwrap_err();
        assert_eq!(err, WireError::BadMessage);
    }

    #[test]
    fn unknown_type_is_skippable() {
        assert!(decode_frame(999, &[1, 2, 3], MAX_PROTOCOL_SUPPORTED).unwrap().is_none());
    }

    #[test]
    fn shard_status_requires_matching_counts() {
        let msg = Message::ShardStatus(ShardStatus { statuses: Bytes::from_static(&[0, 1, 2]) });
        let mut buf = Vec::new();
        msg.encode_into(&mut buf, MAX_PROTOCOL_SUPPORTED).unwrap();

        // num_shards is the first body field after the checksum. Patch it
        // and re-checksum so the mismatch itself is what trips decoding.
        let num_at = FIXED_HEADER_SIZE + CHECKSUM_SIZE;
        buf[num_at] = 9;
        let sum = frame_checksum(&buf[num_at..]);
        buf[FIXED_HEADER_SIZE..num_at].copy_from_slice(&sum.to_le_bytes());
        let body = &buf[FIXED_HEADER_SIZE..];
        assert_eq!(
            decode_frame(MessageType::ShardStatus as u16, body, MAX_PROTOCOL_SUPPORTED)
                .unwrap_err(),
            WireError::BadMessage
        );
    }

    #[test]
    fn shard_status_not_encodable_below_its_min_proto() {
        let msg = Message::ShardStatus(ShardStatus { statuses: Bytes::from_static(&[0]) });
        let mut buf = Vec::new();
        assert_eq!(
            msg.encode_into(&mut buf, MIN_PROTOCOL_SUPPORTED).unwrap_err(),
            WireError::ProtoNoSupport
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_body_is_bad() {
        let msg = stored(5);
        let mut buf = Vec::new();
        msg.encode_into(&mut buf, MIN_PROTOCOL_SUPPORTED).unwrap();
        buf.truncate(buf.len() - 1);
        assert_eq!(
            decode_frame(MessageType::Stored as u16, &buf[FIXED_HEADER_SIZE..], MIN_PROTOCOL_SUPPORTED)
                .unwrap_err(),
            WireError::BadMessage
        );
    }
}
