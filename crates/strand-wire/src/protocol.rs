use crate::message::MessageType;

pub type ProtocolVersion = u16;

/// First version carrying the per-frame checksum on non-handshake
/// messages.
pub const PROTO_CHECKSUM_IN_FRAME: ProtocolVersion = 3;

/// Oldest version we still speak. Everything below is historical.
pub const MIN_PROTOCOL_SUPPORTED: ProtocolVersion = 3;

/// STORED drops its legacy trailing offset field from this version on.
pub const PROTO_COMPACT_STORED: ProtocolVersion = 4;

/// First version that understands SHARD_STATUS.
pub const PROTO_SHARD_STATUS: ProtocolVersion = 5;

pub const MAX_PROTOCOL_SUPPORTED: ProtocolVersion = 5;

/// Whether a frame of this type carries the `cksum` field at this
/// protocol version. Handshake frames never do; they must be parseable
/// before any version is negotiated.
#[inline]
pub fn needs_checksum(ty: MessageType, proto: ProtocolVersion) -> bool {
    !ty.is_handshake() && proto >= PROTO_CHECKSUM_IN_FRAME
}
