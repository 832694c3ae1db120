use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

/// Status codes shared by the wire (ACK status field), send completions
/// and the versioned config store. Kept in one numbering space so a code
/// observed anywhere in the system means the same thing.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, FromRepr, Serialize, Deserialize, Default,
)]
#[repr(u16)]
pub enum Status {
    #[default]
    Ok = 0,
    /// Peer is not (or no longer) part of the cluster configuration.
    NotInConfig = 1,
    /// Output-buffer budget exhausted.
    NoBufs = 2,
    /// Peer cannot be handshaken, e.g. an inbound socket that never said
    /// HELLO.
    Unreachable = 3,
    /// Message requires a protocol version the peer does not speak.
    ProtoNoSupport = 4,
    InvalidCluster = 5,
    DestinationMismatch = 6,
    TimedOut = 7,
    ConnFailed = 8,
    BadMessage = 9,
    Internal = 10,
    Cancelled = 11,
    Shutdown = 12,
    /// Connect already in progress.
    Already = 13,
    /// Already connected.
    IsConn = 14,
    NotFound = 15,
    VersionMismatch = 16,
    Access = 17,
    UpToDate = 18,
    Again = 19,
    InvalidParam = 20,
    InvalidConfig = 21,
}

impl Status {
    #[inline]
    pub fn from_wire(raw: u16) -> Option<Self> {
        Self::from_repr(raw)
    }

    #[inline]
    pub fn as_wire(self) -> u16 {
        self as u16
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}
