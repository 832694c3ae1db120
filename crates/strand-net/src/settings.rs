use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_wire::{MAX_PROTOCOL_SUPPORTED, ProtocolVersion, Status};

/// Messaging-core knobs. One instance per worker, fixed at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Total output-buffer budget per worker, in MiB.
    pub outbufs_mb_max_per_thread: usize,
    /// Bytes every socket may buffer regardless of its class total, in
    /// KiB.
    pub outbuf_socket_min_kb: usize,
    /// Split the worker budget evenly between server and client peers
    /// instead of one shared pool.
    pub outbufs_limit_per_peer_type_enabled: bool,
    #[serde(with = "duration_str")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_str")]
    pub connect_throttle_initial: Duration,
    #[serde(with = "duration_str")]
    pub connect_throttle_max: Duration,
    pub include_cluster_name_on_handshake: bool,
    pub include_destination_on_handshake: bool,
    /// Complete this fraction of accepted sends with
    /// `message_error_injection_status` instead of transmitting. Test
    /// setting; `Ok` disables.
    pub message_error_injection_status: Status,
    pub message_error_injection_chance_percent: f64,
    /// Cap on the negotiated protocol, for staged rollouts.
    pub max_protocol: ProtocolVersion,
    /// Kernel SO_SNDBUF per socket, in KiB. 0 keeps the kernel default.
    pub socket_sndbuf_kb: usize,
    /// Kernel SO_RCVBUF per socket, in KiB. 0 keeps the kernel default.
    pub socket_rcvbuf_kb: usize,
    /// Advertised in HELLO when non-empty.
    pub build_info: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outbufs_mb_max_per_thread: 512,
            outbuf_socket_min_kb: 256,
            outbufs_limit_per_peer_type_enabled: true,
            handshake_timeout: Duration::from_secs(1),
            connect_throttle_initial: Duration::from_millis(1),
            connect_throttle_max: Duration::from_secs(10),
            include_cluster_name_on_handshake: false,
            include_destination_on_handshake: false,
            message_error_injection_status: Status::Ok,
            message_error_injection_chance_percent: 0.0,
            max_protocol: MAX_PROTOCOL_SUPPORTED,
            socket_sndbuf_kb: 0,
            socket_rcvbuf_kb: 0,
            build_info: String::new(),
        }
    }
}

impl Settings {
    /// Highest protocol this worker will negotiate.
    #[inline]
    pub fn local_max_protocol(&self) -> ProtocolVersion {
        self.max_protocol.min(MAX_PROTOCOL_SUPPORTED)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}
