mod codec;
mod message;
mod protocol;
mod status;
mod types;

pub use codec::{FIXED_HEADER_SIZE, MAX_FRAME_LEN, WireError, decode_frame, frame_checksum};
pub use message::{
    Ack, Append, CancelToken, Hello, HelloFlags, Message, MessageType, ShardStatus, Stored,
};
pub use protocol::{
    MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED, PROTO_CHECKSUM_IN_FRAME, PROTO_COMPACT_STORED,
    PROTO_SHARD_STATUS, ProtocolVersion, needs_checksum,
};
pub use status::Status;
pub use types::{ClientId, NodeId, NodeIndex, PeerAddr, PeerClass};
