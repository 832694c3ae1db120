use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    time::Instant,
};

use mio::{Interest, Registry, Token, event::Event, net::TcpStream};
use strand_wire::{
    Ack, FIXED_HEADER_SIZE, Hello, MAX_FRAME_LEN, MIN_PROTOCOL_SUPPORTED, Message, NodeId,
    PeerAddr, ProtocolVersion, Status, WireError, decode_frame,
};
use tracing::{debug, trace, warn};

use crate::{
    budget::Reservation,
    completion::{Completions, SendCallback},
    settings::Settings,
};

const RX_BUF_SIZE: usize = 32 * 1024;

/// Where a connection is in its life. One-way traffic only; there is no
/// path back out of `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, no socket yet.
    Fresh,
    /// TCP connect in flight.
    Connecting,
    /// HELLO written, waiting for the peer's ACK.
    HandshakeSent,
    /// Accepted socket waiting for the peer's HELLO.
    AwaitingHello,
    Handshaken,
    /// Tearing down; pending callbacks are being staged.
    Closing,
    Closed,
}

/// Handshake inputs a connection cannot know by itself.
pub(crate) struct ConnCtx<'a> {
    pub settings: &'a Settings,
    pub cluster_name: &'a str,
    pub local_node: Option<NodeId>,
}

#[derive(Default)]
pub(crate) struct IoOutcome {
    /// Set when the connection died handling this event; the sender must
    /// unindex it.
    pub closed: Option<Status>,
    pub handshaken_now: bool,
}

enum ReadOutcome {
    Frame { ty_raw: u16, body_len: usize },
    WouldBlock,
    Dead(Status),
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the fixed frame header.
    Header { buf: [u8; FIXED_HEADER_SIZE], have: usize },
    /// Reading the remainder of a length-validated frame.
    Payload { frame_len: usize, ty_raw: u16, offset: usize },
}

/// A send accepted before the protocol version is known. Held un-encoded;
/// the reservation covers the size at the lowest version the message can
/// be encoded at.
struct PendingSend {
    msg: Message,
    reservation: Reservation,
    on_sent: Option<SendCallback>,
}

/// An encoded frame waiting for socket writability. Handshake frames
/// carry no reservation; they bypass the budget.
struct OutFrame {
    bytes: Vec<u8>,
    reservation: Option<Reservation>,
    on_sent: Option<SendCallback>,
}

/// One TCP endpoint bound to exactly one peer. Owns the handshake state
/// machine, the pre-handshake serialization queue and the post-handshake
/// output buffer. All I/O is non-blocking; WRITABLE interest is armed
/// only while undrained output remains.
pub(crate) struct Connection {
    id: u64,
    peer: PeerAddr,
    peer_addr: SocketAddr,
    outbound: bool,
    token: Token,
    stream: Option<TcpStream>,
    state: ConnState,
    proto: Option<ProtocolVersion>,
    handshake_deadline: Option<Instant>,

    serialize_q: VecDeque<PendingSend>,
    output: VecDeque<OutFrame>,
    /// Bytes of the front output frame already handed to the kernel.
    front_written: usize,
    /// Invariant: sum of frame sizes in `output`.
    buffered: usize,
    /// Invariant: sum of live reservation bytes on this connection.
    reserved: usize,

    rx: RxState,
    rx_buf: Vec<u8>,
    writable_armed: bool,
    on_close: Vec<SendCallback>,
}

impl Connection {
    pub(crate) fn outbound(id: u64, node: NodeId, peer_addr: SocketAddr, token: Token) -> Self {
        Self::new(id, PeerAddr::Server(node), peer_addr, token, None, ConnState::Fresh, false)
    }

    /// Wrap an accepted socket. The stream must already be registered for
    /// READABLE with `token`.
    pub(crate) fn inbound(
        id: u64,
        peer: PeerAddr,
        stream: TcpStream,
        peer_addr: SocketAddr,
        token: Token,
        deadline: Instant,
    ) -> Self {
        let mut conn =
            Self::new(id, peer, peer_addr, token, Some(stream), ConnState::AwaitingHello, false);
        conn.handshake_deadline = Some(deadline);
        conn
    }

    fn new(
        id: u64,
        peer: PeerAddr,
        peer_addr: SocketAddr,
        token: Token,
        stream: Option<TcpStream>,
        state: ConnState,
        writable_armed: bool,
    ) -> Self {
        Self {
            id,
            peer,
            peer_addr,
            outbound: stream.is_none(),
            token,
            stream,
            state,
            proto: None,
            handshake_deadline: None,
            serialize_q: VecDeque::new(),
            output: VecDeque::new(),
            front_written: 0,
            buffered: 0,
            reserved: 0,
            rx: RxState::Header { buf: [0; FIXED_HEADER_SIZE], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            writable_armed,
            on_close: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn peer(&self) -> PeerAddr {
        self.peer
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub(crate) fn is_handshaken(&self) -> bool {
        self.state == ConnState::Handshaken
    }

    #[inline]
    pub(crate) fn negotiated_proto(&self) -> Option<ProtocolVersion> {
        self.proto
    }

    /// Encoded bytes sitting in the output buffer.
    #[inline]
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Total budgeted bytes on this connection: queued, buffered or
    /// partially written.
    #[inline]
    pub(crate) fn bytes_pending(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub(crate) fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub(crate) fn handshake_expired(&self, now: Instant) -> bool {
        self.handshake_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Start the TCP connect. HELLO goes out once the socket reports
    /// writable.
    pub(crate) fn connect(&mut self, registry: &Registry, settings: &Settings) -> Result<(), Status> {
        match self.state {
            ConnState::Fresh => {}
            ConnState::Connecting | ConnState::HandshakeSent | ConnState::AwaitingHello => {
                return Err(Status::Already);
            }
            ConnState::Handshaken => return Err(Status::IsConn),
            ConnState::Closing | ConnState::Closed => return Err(Status::Shutdown),
        }

        let mut stream = TcpStream::connect(self.peer_addr).map_err(|err| {
            warn!(?err, peer = %self.peer, "tcp connect failed");
            Status::ConnFailed
        })?;
        tune_socket(&stream, settings);
        registry
            .register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)
            .map_err(|err| {
                warn!(?err, peer = %self.peer, "register failed");
                Status::Internal
            })?;
        self.stream = Some(stream);
        self.writable_armed = true;
        self.state = ConnState::Connecting;
        self.handshake_deadline = Some(Instant::now() + settings.handshake_timeout);
        debug!(peer = %self.peer, addr = %self.peer_addr, "connecting");
        Ok(())
    }

    /// Accept a message whose admission the sender already settled.
    /// Returns the close reason if writing it out killed the connection.
    pub(crate) fn queue_message(
        &mut self,
        msg: Message,
        reservation: Reservation,
        on_sent: Option<SendCallback>,
        registry: &Registry,
        completions: &mut Completions,
    ) -> Option<Status> {
        self.reserved += reservation.bytes();
        match self.state {
            ConnState::Fresh | ConnState::Connecting | ConnState::HandshakeSent => {
                self.serialize_q.push_back(PendingSend { msg, reservation, on_sent });
                None
            }
            ConnState::Handshaken => {
                self.buffer_frame(msg, reservation, on_sent, completions);
                self.drive_output(registry, completions)
            }
            // The sender rejects sends in every other state up front.
            _ => {
                self.drop_reservation(reservation);
                completions.stage(on_sent, Status::Internal);
                None
            }
        }
    }

    pub(crate) fn add_on_close(&mut self, cb: SendCallback) {
        self.on_close.push(cb);
    }

    /// Tear down. Idempotent; the output buffer is dropped on the spot,
    /// every pending on-sent is staged with `reason` and every on-close
    /// after them, each exactly once. Budget reservations die with their
    /// records.
    pub(crate) fn close(&mut self, reason: Status, registry: &Registry, completions: &mut Completions) {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return;
        }
        debug!(peer = %self.peer, %reason, "closing connection");
        self.state = ConnState::Closing;
        self.handshake_deadline = None;

        for frame in self.output.drain(..) {
            completions.stage(frame.on_sent, reason);
        }
        for pending in self.serialize_q.drain(..) {
            completions.stage(pending.on_sent, reason);
        }
        self.front_written = 0;
        self.buffered = 0;
        self.reserved = 0;
        for cb in self.on_close.drain(..) {
            completions.stage(Some(cb), reason);
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = ConnState::Closed;
    }

    /// React to poll readiness. All state transitions driven by the peer
    /// happen under here.
    pub(crate) fn on_event(
        &mut self,
        registry: &Registry,
        event: &Event,
        ctx: &ConnCtx<'_>,
        sink: &mut Vec<(PeerAddr, Message)>,
        completions: &mut Completions,
    ) -> IoOutcome {
        let mut out = IoOutcome::default();
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return out;
        }

        if event.is_writable() {
            if self.state == ConnState::Connecting {
                match self.check_connected() {
                    Ok(true) => {
                        self.send_hello(ctx);
                        if let Some(reason) = self.drive_output(registry, completions) {
                            out.closed = Some(reason);
                            return out;
                        }
                    }
                    Ok(false) => {}
                    Err(reason) => {
                        self.close(reason, registry, completions);
                        out.closed = Some(reason);
                        return out;
                    }
                }
            } else if let Some(reason) = self.drive_output(registry, completions) {
                out.closed = Some(reason);
                return out;
            }
        }

        if event.is_readable() {
            loop {
                match self.read_frame() {
                    ReadOutcome::Frame { ty_raw, body_len } => {
                        match self.process_frame(ty_raw, body_len, ctx, registry, completions, sink)
                        {
                            Ok(handshaken_now) => out.handshaken_now |= handshaken_now,
                            Err(reason) => {
                                self.close(reason, registry, completions);
                                out.closed = Some(reason);
                                return out;
                            }
                        }
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Dead(reason) => {
                        self.close(reason, registry, completions);
                        out.closed = Some(reason);
                        return out;
                    }
                }
            }
        }

        out
    }

    /// Non-blocking connect completion check: a writable event with a
    /// pending SO_ERROR means the connect failed.
    fn check_connected(&mut self) -> Result<bool, Status> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Status::Internal);
        };
        match stream.take_error() {
            Ok(Some(err)) => {
                warn!(?err, peer = %self.peer, "connect failed");
                Err(Status::ConnFailed)
            }
            Err(err) => {
                warn!(?err, peer = %self.peer, "connect failed");
                Err(Status::ConnFailed)
            }
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(err) => {
                    warn!(?err, peer = %self.peer, "connect failed");
                    Err(Status::ConnFailed)
                }
            },
        }
    }

    fn send_hello(&mut self, ctx: &ConnCtx<'_>) {
        let destination = match self.peer {
            PeerAddr::Server(node) if ctx.settings.include_destination_on_handshake => Some(node),
            _ => None,
        };
        let hello = Message::Hello(Hello {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: ctx.settings.local_max_protocol(),
            destination,
            cluster_name: ctx
                .settings
                .include_cluster_name_on_handshake
                .then(|| ctx.cluster_name.to_owned()),
            build_info: (!ctx.settings.build_info.is_empty())
                .then(|| ctx.settings.build_info.clone()),
        });
        self.buffer_control_frame(&hello);
        self.state = ConnState::HandshakeSent;
        debug!(peer = %self.peer, "sent HELLO");
    }

    /// Encode a handshake frame straight onto the output buffer, outside
    /// the budget.
    fn buffer_control_frame(&mut self, msg: &Message) {
        let mut bytes = Vec::with_capacity(msg.encoded_size(MIN_PROTOCOL_SUPPORTED));
        if let Err(err) = msg.encode_into(&mut bytes, MIN_PROTOCOL_SUPPORTED) {
            // Handshake frames are fully under our control.
            warn!(?err, peer = %self.peer, "handshake frame failed to encode");
            return;
        }
        self.buffered += bytes.len();
        self.output.push_back(OutFrame { bytes, reservation: None, on_sent: None });
    }

    fn process_frame(
        &mut self,
        ty_raw: u16,
        body_len: usize,
        ctx: &ConnCtx<'_>,
        registry: &Registry,
        completions: &mut Completions,
        sink: &mut Vec<(PeerAddr, Message)>,
    ) -> Result<bool, Status> {
        let decode_proto = self.proto.unwrap_or(MIN_PROTOCOL_SUPPORTED);
        let msg = match decode_frame(ty_raw, &self.rx_buf[..body_len], decode_proto) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(peer = %self.peer, ty_raw, "skipping unknown message type");
                return Ok(false);
            }
            Err(err) => {
                warn!(?err, peer = %self.peer, "bad frame");
                return Err(Status::BadMessage);
            }
        };
        trace!(peer = %self.peer, ty = %msg.msg_type(), "received");

        match (self.state, msg) {
            (ConnState::HandshakeSent, Message::Ack(ack)) => {
                self.handle_ack(&ack, ctx, registry, completions)?;
                Ok(true)
            }
            (ConnState::AwaitingHello, Message::Hello(hello)) => {
                self.handle_hello(&hello, ctx, registry, completions)?;
                Ok(true)
            }
            (ConnState::Handshaken, Message::Hello(_) | Message::Ack(_)) => {
                warn!(peer = %self.peer, "handshake frame after handshake");
                Err(Status::BadMessage)
            }
            (ConnState::Handshaken, msg) => {
                sink.push((self.peer, msg));
                Ok(false)
            }
            // Anything else before the handshake completes is a protocol
            // violation.
            _ => Err(Status::BadMessage),
        }
    }

    fn handle_ack(
        &mut self,
        ack: &Ack,
        ctx: &ConnCtx<'_>,
        registry: &Registry,
        completions: &mut Completions,
    ) -> Result<(), Status> {
        if !ack.status.is_ok() {
            debug!(peer = %self.peer, status = %ack.status, "handshake rejected by peer");
            return Err(ack.status);
        }
        if ack.proto < MIN_PROTOCOL_SUPPORTED || ack.proto > ctx.settings.local_max_protocol() {
            warn!(peer = %self.peer, proto = ack.proto, "peer picked an unsupported protocol");
            return Err(Status::ProtoNoSupport);
        }
        self.complete_handshake(ack.proto, completions);
        if let Some(reason) = self.drive_output(registry, completions) {
            return Err(reason);
        }
        Ok(())
    }

    fn handle_hello(
        &mut self,
        hello: &Hello,
        ctx: &ConnCtx<'_>,
        registry: &Registry,
        completions: &mut Completions,
    ) -> Result<(), Status> {
        let local_max = ctx.settings.local_max_protocol();
        let proto = local_max.min(hello.proto_max);
        let floor = MIN_PROTOCOL_SUPPORTED.max(hello.proto_min);

        let status = if proto < floor {
            Status::ProtoNoSupport
        } else if hello.cluster_name.as_deref().is_some_and(|name| name != ctx.cluster_name) {
            Status::InvalidCluster
        } else if hello.destination.is_some() && hello.destination != ctx.local_node {
            Status::DestinationMismatch
        } else {
            Status::Ok
        };

        let client_idx = match self.peer {
            PeerAddr::Client(client) => client.0,
            PeerAddr::Server(_) => 0,
        };
        let ack = Message::Ack(Ack {
            options: 0,
            rqid: 0,
            client_idx,
            proto: if status.is_ok() { proto } else { 0 },
            status,
        });
        self.buffer_control_frame(&ack);

        if status.is_ok() {
            self.complete_handshake(proto, completions);
            if let Some(reason) = self.drive_output(registry, completions) {
                return Err(reason);
            }
            Ok(())
        } else {
            debug!(peer = %self.peer, %status, "rejecting HELLO");
            // Best effort: push the rejection out before the teardown
            // drops the buffer.
            let _ = self.flush(registry, completions);
            Err(status)
        }
    }

    /// Settle the serialization queue against the negotiated version:
    /// unsupported messages fail with ProtoNoSupport, the rest are
    /// encoded in FIFO order and their reservations shrink to the actual
    /// frame size.
    fn complete_handshake(&mut self, proto: ProtocolVersion, completions: &mut Completions) {
        self.proto = Some(proto);
        self.state = ConnState::Handshaken;
        self.handshake_deadline = None;
        debug!(peer = %self.peer, proto, "handshake complete");

        for pending in std::mem::take(&mut self.serialize_q) {
            if pending.msg.min_protocol() > proto {
                self.drop_reservation(pending.reservation);
                completions.stage(pending.on_sent, Status::ProtoNoSupport);
                continue;
            }
            self.buffer_frame(pending.msg, pending.reservation, pending.on_sent, completions);
        }
    }

    /// Wire stage: encode at the negotiated version and append to the
    /// output buffer. Cancelled messages are dropped here.
    fn buffer_frame(
        &mut self,
        msg: Message,
        mut reservation: Reservation,
        on_sent: Option<SendCallback>,
        completions: &mut Completions,
    ) {
        if msg.cancelled() {
            self.drop_reservation(reservation);
            completions.stage(on_sent, Status::Cancelled);
            return;
        }
        let proto = self.proto.unwrap_or(MIN_PROTOCOL_SUPPORTED);
        let mut bytes = Vec::with_capacity(msg.encoded_size(proto));
        if let Err(err) = msg.encode_into(&mut bytes, proto) {
            warn!(?err, peer = %self.peer, ty = %msg.msg_type(), "encode failed");
            self.drop_reservation(reservation);
            completions.stage(on_sent, Status::Internal);
            return;
        }
        if bytes.len() < reservation.bytes() {
            self.reserved -= reservation.bytes() - bytes.len();
            reservation.shrink(bytes.len());
        }
        self.buffered += bytes.len();
        self.output.push_back(OutFrame { bytes, reservation: Some(reservation), on_sent });
    }

    fn drop_reservation(&mut self, reservation: Reservation) {
        self.reserved -= reservation.bytes();
    }

    /// Flush and fix up poll interest. Any fatal write error closes the
    /// connection and reports the reason.
    fn drive_output(&mut self, registry: &Registry, completions: &mut Completions) -> Option<Status> {
        match self.flush(registry, completions) {
            Ok(()) => None,
            Err(reason) => {
                self.close(reason, registry, completions);
                Some(reason)
            }
        }
    }

    /// Write output frames until the kernel pushes back. On-sent fires,
    /// in order, for each frame that fully left the buffer.
    fn flush(&mut self, registry: &Registry, completions: &mut Completions) -> Result<(), Status> {
        if self.stream.is_none() {
            return Ok(());
        }
        loop {
            let Some(stream) = self.stream.as_mut() else { break };
            let Some(front) = self.output.front() else { break };
            match stream.write(&front.bytes[self.front_written..]) {
                Ok(0) => return Err(Status::ConnFailed),
                Ok(n) => {
                    self.front_written += n;
                    if self.front_written == front.bytes.len() {
                        self.front_written = 0;
                        if let Some(frame) = self.output.pop_front() {
                            self.buffered -= frame.bytes.len();
                            if let Some(reservation) = frame.reservation {
                                self.drop_reservation(reservation);
                            }
                            completions.stage(frame.on_sent, Status::Ok);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, peer = %self.peer, "write failed");
                    return Err(Status::ConnFailed);
                }
            }
        }
        self.update_interest(registry)
    }

    /// Arm WRITABLE only while there is something to write; drop it as
    /// soon as the buffer fully drains.
    fn update_interest(&mut self, registry: &Registry) -> Result<(), Status> {
        let want_writable = !self.output.is_empty() || self.state == ConnState::Connecting;
        if want_writable == self.writable_armed {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let interest = if want_writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(stream, self.token, interest).map_err(|err| {
            debug!(?err, peer = %self.peer, "reregister failed");
            Status::Internal
        })?;
        self.writable_armed = want_writable;
        Ok(())
    }

    /// Read a single complete frame if present, resuming across
    /// WouldBlock boundaries. The length field is validated before any
    /// payload byte is consumed.
    fn read_frame(&mut self) -> ReadOutcome {
        let Some(stream) = self.stream.as_mut() else {
            return ReadOutcome::WouldBlock;
        };
        loop {
            match self.rx {
                RxState::Header { mut buf, mut have } => {
                    while have < FIXED_HEADER_SIZE {
                        match stream.read(&mut buf[have..]) {
                            // EOF on a frame boundary is an ordinary
                            // disconnect; inside a header it is not.
                            Ok(0) if have == 0 => {
                                debug!(peer = %self.peer, "peer closed");
                                return ReadOutcome::Dead(Status::ConnFailed);
                            }
                            Ok(0) => {
                                warn!(err = %WireError::Truncated, peer = %self.peer, "peer closed mid-frame");
                                return ReadOutcome::Dead(Status::BadMessage);
                            }
                            Ok(n) => have += n,
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                self.rx = RxState::Header { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, peer = %self.peer, "read header");
                                return ReadOutcome::Dead(Status::ConnFailed);
                            }
                        }
                    }
                    let frame_len =
                        u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
                    let ty_raw = u16::from_le_bytes(buf[4..6].try_into().unwrap());
                    if frame_len < FIXED_HEADER_SIZE {
                        warn!(peer = %self.peer, frame_len, "frame length below header size");
                        return ReadOutcome::Dead(Status::BadMessage);
                    }
                    if frame_len > MAX_FRAME_LEN {
                        warn!(err = %WireError::TooBig { len: frame_len }, peer = %self.peer, "oversized frame");
                        return ReadOutcome::Dead(Status::BadMessage);
                    }
                    let body_len = frame_len - FIXED_HEADER_SIZE;
                    if body_len > self.rx_buf.len() {
                        self.rx_buf.resize(body_len, 0);
                    }
                    self.rx = RxState::Payload { frame_len, ty_raw, offset: 0 };
                }
                RxState::Payload { frame_len, ty_raw, mut offset } => {
                    let body_len = frame_len - FIXED_HEADER_SIZE;
                    while offset < body_len {
                        match stream.read(&mut self.rx_buf[offset..body_len]) {
                            Ok(0) => {
                                warn!(err = %WireError::Truncated, peer = %self.peer, "peer closed mid-frame");
                                return ReadOutcome::Dead(Status::BadMessage);
                            }
                            Ok(n) => offset += n,
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                self.rx = RxState::Payload { frame_len, ty_raw, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, peer = %self.peer, "read payload");
                                return ReadOutcome::Dead(Status::ConnFailed);
                            }
                        }
                    }
                    self.rx = RxState::Header { buf: [0; FIXED_HEADER_SIZE], have: 0 };
                    return ReadOutcome::Frame { ty_raw, body_len };
                }
            }
        }
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF when the settings ask for it.
pub(crate) fn tune_socket(stream: &TcpStream, settings: &Settings) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    for (opt, kb) in
        [(libc::SO_SNDBUF, settings.socket_sndbuf_kb), (libc::SO_RCVBUF, settings.socket_rcvbuf_kb)]
    {
        if kb == 0 {
            continue;
        }
        let size = (kb * 1024) as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &size as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}
