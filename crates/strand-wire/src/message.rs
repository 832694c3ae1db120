use std::{cell::Cell, rc::Rc};

use bytes::{Buf, Bytes};
use strum::{Display, FromRepr};

use crate::{
    codec::WireError,
    protocol::{
        MIN_PROTOCOL_SUPPORTED, PROTO_COMPACT_STORED, PROTO_SHARD_STATUS, ProtocolVersion,
    },
    status::Status,
    types::NodeId,
};

/// Wire type tag. The numbering is frozen; new kinds append.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, FromRepr)]
#[repr(u16)]
pub enum MessageType {
    Hello = 1,
    Ack = 2,
    Append = 3,
    Stored = 4,
    ShardStatus = 5,
}

impl MessageType {
    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Hello | Self::Ack)
    }
}

bitflags::bitflags! {
    /// Presence bits for HELLO's optional trailing fields. Fields are
    /// encoded in bit order.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HelloFlags: u16 {
        const DESTINATION_NODE = 1 << 0;
        const CLUSTER_NAME = 1 << 1;
        const BUILD_INFO = 1 << 2;
    }
}

/// Cancellation handle shared between a request state machine and a
/// message it has already handed to the messaging core. A cancelled
/// message is dropped at the wire stage; its on-sent still fires.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.set(true);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// First frame of the handshake, sent by the connecting side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub proto_min: ProtocolVersion,
    pub proto_max: ProtocolVersion,
    pub destination: Option<NodeId>,
    pub cluster_name: Option<String>,
    pub build_info: Option<String>,
}

impl Hello {
    #[inline]
    pub fn flags(&self) -> HelloFlags {
        let mut flags = HelloFlags::empty();
        flags.set(HelloFlags::DESTINATION_NODE, self.destination.is_some());
        flags.set(HelloFlags::CLUSTER_NAME, self.cluster_name.is_some());
        flags.set(HelloFlags::BUILD_INFO, self.build_info.is_some());
        flags
    }
}

/// Handshake reply. `status != Ok` carries the rejection reason and the
/// connection is torn down right after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub options: u8,
    pub rqid: u64,
    pub client_idx: u32,
    pub proto: ProtocolVersion,
    pub status: Status,
}

/// Client-to-node record append. The payload is opaque here.
#[derive(Clone, Debug)]
pub struct Append {
    pub rqid: u64,
    pub log_id: u64,
    pub flags: u8,
    pub payload: Bytes,
    pub cancel: Option<CancelToken>,
}

/// Node-to-client store acknowledgement, routed back to the originating
/// request by `rqid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stored {
    pub rqid: u64,
    pub log_id: u64,
    pub lsn: u64,
    pub wave: u32,
    pub status: Status,
    pub flags: u8,
    pub shard: u16,
}

/// Per-shard health vector gossiped between nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardStatus {
    pub statuses: Bytes,
}

/// The closed set of messages this core speaks. Each variant supplies its
/// type tag, minimum protocol, body codec and routing id below; that
/// table replaces per-message virtual dispatch.
#[derive(Clone, Debug)]
pub enum Message {
    Hello(Hello),
    Ack(Ack),
    Append(Append),
    Stored(Stored),
    ShardStatus(ShardStatus),
}

impl Message {
    #[inline]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Ack(_) => MessageType::Ack,
            Self::Append(_) => MessageType::Append,
            Self::Stored(_) => MessageType::Stored,
            Self::ShardStatus(_) => MessageType::ShardStatus,
        }
    }

    /// Oldest protocol version that can carry this message.
    #[inline]
    pub fn min_protocol(&self) -> ProtocolVersion {
        match self {
            Self::ShardStatus(_) => PROTO_SHARD_STATUS,
            _ => MIN_PROTOCOL_SUPPORTED,
        }
    }

    /// Request id used to route a reply to its request state machine.
    #[inline]
    pub fn rqid(&self) -> Option<u64> {
        match self {
            Self::Stored(stored) => Some(stored.rqid),
            _ => None,
        }
    }

    #[inline]
    pub fn cancelled(&self) -> bool {
        match self {
            Self::Append(append) => {
                append.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
            }
            _ => false,
        }
    }

    pub(crate) fn body_size(&self, proto: ProtocolVersion) -> usize {
        match self {
            Self::Hello(hello) => {
                let mut size = 2 + 2 + 2;
                if hello.destination.is_some() {
                    size += 16;
                }
                if let Some(name) = &hello.cluster_name {
                    size += 2 + name.len();
                }
                if let Some(info) = &hello.build_info {
                    size += 2 + info.len();
                }
                size
            }
            Self::Ack(_) => 1 + 8 + 4 + 2 + 2,
            Self::Append(append) => 8 + 8 + 1 + 4 + append.payload.len(),
            Self::Stored(_) => {
                let legacy = if proto < PROTO_COMPACT_STORED { 8 } else { 0 };
                8 + 8 + 8 + 4 + 2 + 1 + 2 + legacy
            }
            Self::ShardStatus(shard_status) => 2 + 2 + shard_status.statuses.len(),
        }
    }

    pub(crate) fn encode_body(
        &self,
        buf: &mut Vec<u8>,
        proto: ProtocolVersion,
    ) -> Result<(), WireError> {
        match self {
            Self::Hello(hello) => {
                buf.extend_from_slice(&hello.proto_min.to_le_bytes());
                buf.extend_from_slice(&hello.proto_max.to_le_bytes());
                buf.extend_from_slice(&hello.flags().bits().to_le_bytes());
                if let Some(node) = hello.destination {
                    buf.extend_from_slice(&u64::from(node.index.0).to_le_bytes());
                    buf.extend_from_slice(&u64::from(node.generation).to_le_bytes());
                }
                for field in [&hello.cluster_name, &hello.build_info].into_iter().flatten() {
                    let len = u16::try_from(field.len()).map_err(|_| WireError::BadMessage)?;
                    buf.extend_from_slice(&len.to_le_bytes());
                    buf.extend_from_slice(field.as_bytes());
                }
            }
            Self::Ack(ack) => {
                buf.push(ack.options);
                buf.extend_from_slice(&ack.rqid.to_le_bytes());
                buf.extend_from_slice(&ack.client_idx.to_le_bytes());
                buf.extend_from_slice(&ack.proto.to_le_bytes());
                buf.extend_from_slice(&ack.status.as_wire().to_le_bytes());
            }
            Self::Append(append) => {
                buf.extend_from_slice(&append.rqid.to_le_bytes());
                buf.extend_from_slice(&append.log_id.to_le_bytes());
                buf.push(append.flags);
                let len = u32::try_from(append.payload.len()).map_err(|_| WireError::BadMessage)?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(&append.payload);
            }
            Self::Stored(stored) => {
                buf.extend_from_slice(&stored.rqid.to_le_bytes());
                buf.extend_from_slice(&stored.log_id.to_le_bytes());
                buf.extend_from_slice(&stored.lsn.to_le_bytes());
                buf.extend_from_slice(&stored.wave.to_le_bytes());
                buf.extend_from_slice(&stored.status.as_wire().to_le_bytes());
                buf.push(stored.flags);
                buf.extend_from_slice(&stored.shard.to_le_bytes());
                if proto < PROTO_COMPACT_STORED {
                    buf.extend_from_slice(&0u64.to_le_bytes());
                }
            }
            Self::ShardStatus(shard_status) => {
                let num =
                    u16::try_from(shard_status.statuses.len()).map_err(|_| WireError::BadMessage)?;
                buf.extend_from_slice(&num.to_le_bytes());
                buf.extend_from_slice(&num.to_le_bytes());
                buf.extend_from_slice(&shard_status.statuses);
            }
        }
        Ok(())
    }

    pub(crate) fn decode_body(
        ty: MessageType,
        body: &[u8],
        proto: ProtocolVersion,
    ) -> Result<Self, WireError> {
        let mut rd = BodyReader(body);
        let msg = match ty {
            MessageType::Hello => {
                let proto_min = rd.u16()?;
                let proto_max = rd.u16()?;
                let flags = HelloFlags::from_bits(rd.u16()?).ok_or(WireError::BadMessage)?;
                let destination = if flags.contains(HelloFlags::DESTINATION_NODE) {
                    let index = u32::try_from(rd.u64()?).map_err(|_| WireError::BadMessage)?;
                    let generation =
                        u32::try_from(rd.u64()?).map_err(|_| WireError::BadMessage)?;
                    Some(NodeId::new(index, generation))
                } else {
                    None
                };
                let cluster_name = if flags.contains(HelloFlags::CLUSTER_NAME) {
                    Some(rd.string()?)
                } else {
                    None
                };
                let build_info =
                    if flags.contains(HelloFlags::BUILD_INFO) { Some(rd.string()?) } else { None };
                Self::Hello(Hello { proto_min, proto_max, destination, cluster_name, build_info })
            }
            MessageType::Ack => Self::Ack(Ack {
                options: rd.u8()?,
                rqid: rd.u64()?,
                client_idx: rd.u32()?,
                proto: rd.u16()?,
                status: Status::from_wire(rd.u16()?).ok_or(WireError::BadMessage)?,
            }),
            MessageType::Append => {
                let rqid = rd.u64()?;
                let log_id = rd.u64()?;
                let flags = rd.u8()?;
                let len = rd.u32()? as usize;
                let payload = rd.bytes(len)?;
                Self::Append(Append { rqid, log_id, flags, payload, cancel: None })
            }
            MessageType::Stored => {
                let stored = Stored {
                    rqid: rd.u64()?,
                    log_id: rd.u64()?,
                    lsn: rd.u64()?,
                    wave: rd.u32()?,
                    status: Status::from_wire(rd.u16()?).ok_or(WireError::BadMessage)?,
                    flags: rd.u8()?,
                    shard: rd.u16()?,
                };
                if proto < PROTO_COMPACT_STORED {
                    let _legacy_offset = rd.u64()?;
                }
                Self::Stored(stored)
            }
            MessageType::ShardStatus => {
                let num_shards = rd.u16()?;
                let len = rd.u16()? as usize;
                if len != num_shards as usize {
                    return Err(WireError::BadMessage);
                }
                Self::ShardStatus(ShardStatus { statuses: rd.bytes(len)? })
            }
        };
        rd.finish()?;
        Ok(msg)
    }
}

/// Checked little-endian reader over one frame body. Any underflow or
/// trailing garbage is a `BadMessage`.
struct BodyReader<'a>(&'a [u8]);

impl BodyReader<'_> {
    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.0.remaining() < n { Err(WireError::BadMessage) } else { Ok(()) }
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.0.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.0.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.0.get_u64_le())
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes, WireError> {
        self.need(n)?;
        Ok(self.0.copy_to_bytes(n))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::BadMessage)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.0.is_empty() { Ok(()) } else { Err(WireError::BadMessage) }
    }
}
