#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use strand_config::{ClusterConfig, ConfigView, NodeEntry};
use strand_net::Worker;
use strand_wire::{
    Ack, FIXED_HEADER_SIZE, Message, NodeIndex, ProtocolVersion, Status, decode_frame,
};

pub const CLUSTER: &str = "test.cluster";

pub struct Frame {
    pub ty: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn decode(&self, proto: ProtocolVersion) -> Message {
        decode_frame(self.ty, &self.body, proto).expect("bad frame").expect("unknown type")
    }
}

/// Blocking read of one complete frame; the length prefix must cover the
/// frame exactly, which `read_exact` enforces.
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut header = [0_u8; FIXED_HEADER_SIZE];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let ty = u16::from_le_bytes(header[4..6].try_into().unwrap());
    let mut body = vec![0_u8; len - FIXED_HEADER_SIZE];
    stream.read_exact(&mut body)?;
    Ok(Frame { ty, body })
}

pub fn write_msg(stream: &mut TcpStream, msg: &Message, proto: ProtocolVersion) {
    let mut buf = Vec::new();
    msg.encode_into(&mut buf, proto).expect("encode failed");
    stream.write_all(&buf).expect("peer write failed");
}

pub fn ack(status: Status, proto: ProtocolVersion, client_idx: u32) -> Message {
    Message::Ack(Ack { options: 0, rqid: 0, client_idx, proto, status })
}

/// Bind a listener on a fresh port and run `script` against it on its
/// own thread.
pub fn spawn_peer<T: Send + 'static>(
    script: impl FnOnce(TcpListener) -> T + Send + 'static,
) -> (SocketAddr, thread::JoinHandle<T>) {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("failed to fetch listener addr");
    (addr, thread::spawn(move || script(listener)))
}

pub fn config_view(nodes: Vec<NodeEntry>) -> ConfigView {
    ConfigView::new(ClusterConfig::new(CLUSTER, 1, nodes).expect("bad test config"))
}

pub fn node_entry(index: u32, address: SocketAddr, generation: u32) -> NodeEntry {
    NodeEntry { index: NodeIndex(index), address, generation }
}

pub fn pump(worker: &mut Worker, for_how_long: Duration) {
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        worker.tick(Some(Duration::from_millis(1))).expect("tick failed");
    }
}

/// Tick until `cond` holds or the deadline passes; says whether it held.
pub fn pump_until(
    worker: &mut Worker,
    for_how_long: Duration,
    mut cond: impl FnMut(&mut Worker) -> bool,
) -> bool {
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        worker.tick(Some(Duration::from_millis(1))).expect("tick failed");
        if cond(worker) {
            return true;
        }
    }
    false
}
