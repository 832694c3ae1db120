use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use rand::Rng;
use strand_config::ConfigView;
use strand_wire::{
    ClientId, MIN_PROTOCOL_SUPPORTED, Message, NodeId, NodeIndex, PeerAddr, PeerClass, Status,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    budget::OutbufBudget,
    completion::{Completions, SendCallback},
    connection::{ConnCtx, ConnState, Connection, tune_socket},
    settings::Settings,
    throttle::ConnectThrottle,
    worker::Worker,
};

/// Synchronous send failure. Ownership of the message stays with the
/// caller; nothing about it was charged or queued.
#[derive(Error, Debug)]
#[error("send to {peer} failed: {status}")]
pub struct SendError {
    pub status: Status,
    pub peer: PeerAddr,
    pub msg: Message,
}

#[derive(Default)]
pub struct SendOptions {
    pub on_sent: Option<SendCallback>,
    pub on_close: Option<SendCallback>,
}

impl SendOptions {
    pub fn on_sent(mut self, cb: impl FnOnce(Status, &mut Worker) + 'static) -> Self {
        self.on_sent = Some(Box::new(cb));
        self
    }

    pub fn on_close(mut self, cb: impl FnOnce(Status, &mut Worker) + 'static) -> Self {
        self.on_close = Some(Box::new(cb));
        self
    }
}

/// Per-worker connection registry and outbound router. Owns the poll
/// instance, every connection, the output budget and the connect
/// throttle; all of it is single-threaded worker state.
pub struct Sender {
    poll: Poll,
    settings: Settings,
    config: ConfigView,
    local_node: Option<NodeId>,
    budget: OutbufBudget,
    throttle: ConnectThrottle,
    server_conns: IndexMap<NodeIndex, Connection>,
    client_conns: IndexMap<ClientId, Connection>,
    token_peers: HashMap<Token, PeerAddr>,
    listener: Option<(Token, TcpListener)>,
    next_token: usize,
    next_client_id: u32,
    next_conn_id: u64,
}

impl Sender {
    pub(crate) fn new(
        settings: Settings,
        config: ConfigView,
        local_node: Option<NodeId>,
    ) -> io::Result<Self> {
        let budget = OutbufBudget::new(&settings);
        let throttle = ConnectThrottle::new(
            settings.connect_throttle_initial,
            settings.connect_throttle_max,
        );
        Ok(Self {
            poll: Poll::new()?,
            settings,
            config,
            local_node,
            budget,
            throttle,
            server_conns: IndexMap::new(),
            client_conns: IndexMap::new(),
            token_peers: HashMap::new(),
            listener: None,
            next_token: 0,
            next_client_id: 1,
            next_conn_id: 1,
        })
    }

    pub(crate) fn poll_events(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn alloc_conn_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Start accepting inbound peers. Each accepted socket becomes a
    /// client-class connection that must present HELLO before anything
    /// else.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        let local = listener.local_addr()?;
        info!(%local, "listening");
        self.listener = Some((token, listener));
        Ok(local)
    }

    /// Initiate the connection to `node` without sending anything yet.
    pub fn connect(&mut self, node: NodeId, completions: &mut Completions) -> Result<(), Status> {
        self.ensure_server_conn(node, completions)?;
        let Some(conn) = self.server_conns.get_mut(&node.index) else {
            return Err(Status::Internal);
        };
        let result = conn.connect(self.poll.registry(), &self.settings);
        if result == Err(Status::ConnFailed) {
            self.drop_failed_conn(node);
        }
        result
    }

    /// Route one message to `peer`, creating and connecting the
    /// connection on first use. Synchronous failures hand the message
    /// back; success transfers ownership, and the outcome arrives via
    /// `opts.on_sent` / `opts.on_close`.
    pub(crate) fn send_message(
        &mut self,
        msg: Message,
        peer: PeerAddr,
        opts: SendOptions,
        completions: &mut Completions,
    ) -> Result<(), SendError> {
        match peer {
            PeerAddr::Server(node) => {
                if let Err(status) = self.ensure_server_conn(node, completions) {
                    return Err(SendError { status, peer, msg });
                }
                if let Err(status) = self.connect_if_fresh(node) {
                    return Err(SendError { status, peer, msg });
                }
            }
            PeerAddr::Client(client) => {
                if !self.client_conns.contains_key(&client) {
                    return Err(SendError { status: Status::Unreachable, peer, msg });
                }
            }
        }

        let budget = self.budget.clone();
        let injection = (
            self.settings.message_error_injection_status,
            self.settings.message_error_injection_chance_percent,
        );
        let conn = match peer {
            PeerAddr::Server(node) => self.server_conns.get_mut(&node.index),
            PeerAddr::Client(client) => self.client_conns.get_mut(&client),
        };
        let Some(conn) = conn else {
            return Err(SendError { status: Status::Internal, peer, msg });
        };

        match conn.state() {
            ConnState::AwaitingHello => {
                return Err(SendError { status: Status::Unreachable, peer, msg });
            }
            ConnState::Closing | ConnState::Closed => {
                return Err(SendError { status: Status::Shutdown, peer, msg });
            }
            ConnState::Handshaken => {
                if conn.negotiated_proto().is_some_and(|proto| msg.min_protocol() > proto) {
                    return Err(SendError { status: Status::ProtoNoSupport, peer, msg });
                }
            }
            _ => {}
        }

        if injection.0 != Status::Ok
            && injection.1 > 0.0
            && rand::rng().random_bool((injection.1 / 100.0).clamp(0.0, 1.0))
        {
            debug!(%peer, status = %injection.0, "injecting send error");
            if let Some(cb) = opts.on_close {
                conn.add_on_close(cb);
            }
            completions.stage(opts.on_sent, injection.0);
            return Ok(());
        }

        // Pre-handshake sends are charged at the lowest version the
        // message can be encoded at; the upper bound shrinks to the real
        // size once the version is negotiated.
        let proto_for_size = conn
            .negotiated_proto()
            .unwrap_or_else(|| msg.min_protocol().max(MIN_PROTOCOL_SUPPORTED));
        let size = msg.encoded_size(proto_for_size);
        let Some(reservation) = budget.try_reserve(peer.class(), size, conn.bytes_pending()) else {
            return Err(SendError { status: Status::NoBufs, peer, msg });
        };

        if let Some(cb) = opts.on_close {
            conn.add_on_close(cb);
        }
        let closed = conn.queue_message(msg, reservation, opts.on_sent, self.poll.registry(), completions);
        if let Some(reason) = closed {
            debug!(%peer, %reason, "connection died while flushing");
            self.unindex(peer);
        }
        Ok(())
    }

    /// Resolve `node` against the config and make sure a connection entry
    /// for its current generation exists.
    fn ensure_server_conn(
        &mut self,
        node: NodeId,
        completions: &mut Completions,
    ) -> Result<(), Status> {
        let Some((addr, generation)) = self.config.lookup(node.index) else {
            return Err(Status::NotInConfig);
        };
        if node.generation != generation {
            return Err(Status::NotInConfig);
        }

        if let Some(existing) = self.server_conns.get(&node.index) {
            if let PeerAddr::Server(current) = existing.peer()
                && current.generation == node.generation
            {
                return Ok(());
            }
            // A connection to a replaced instance of this index; tear it
            // down and rebuild against the new generation.
            self.close_connection(PeerAddr::Server(node), Status::NotInConfig, completions);
        }

        let peer = PeerAddr::Server(node);
        if !self.throttle.may_connect(peer) {
            debug!(%peer, "connect attempt throttled");
            return Err(Status::ConnFailed);
        }
        let token = self.alloc_token();
        let id = self.alloc_conn_id();
        debug!(%peer, %addr, id, "creating connection");
        self.token_peers.insert(token, peer);
        self.server_conns.insert(node.index, Connection::outbound(id, node, addr, token));
        Ok(())
    }

    fn connect_if_fresh(&mut self, node: NodeId) -> Result<(), Status> {
        let Some(conn) = self.server_conns.get_mut(&node.index) else {
            return Err(Status::Internal);
        };
        if conn.state() != ConnState::Fresh {
            return Ok(());
        }
        match conn.connect(self.poll.registry(), &self.settings) {
            Ok(()) => Ok(()),
            Err(status) => {
                self.drop_failed_conn(node);
                Err(status)
            }
        }
    }

    /// A constructor-failed connection never existed as far as callers
    /// are concerned.
    fn drop_failed_conn(&mut self, node: NodeId) {
        if let Some(conn) = self.server_conns.swap_remove(&node.index) {
            self.token_peers.remove(&conn.token());
        }
        self.throttle.on_failure(PeerAddr::Server(node));
    }

    pub(crate) fn handle_event(
        &mut self,
        event: &Event,
        sink: &mut Vec<(PeerAddr, Message)>,
        completions: &mut Completions,
    ) {
        let token = event.token();
        if self.listener.as_ref().is_some_and(|(listener_token, _)| *listener_token == token) {
            self.accept_ready();
            return;
        }
        let Some(&peer) = self.token_peers.get(&token) else {
            debug!(?token, "event for unknown token");
            return;
        };

        let cluster_name = self.config.cluster_name();
        let ctx = ConnCtx {
            settings: &self.settings,
            cluster_name: &cluster_name,
            local_node: self.local_node,
        };
        let conn = match peer {
            PeerAddr::Server(node) => self.server_conns.get_mut(&node.index),
            PeerAddr::Client(client) => self.client_conns.get_mut(&client),
        };
        let Some(conn) = conn else { return };

        let was_outbound = conn.is_outbound();
        let outcome = conn.on_event(self.poll.registry(), event, &ctx, sink, completions);
        let never_handshaken = conn.negotiated_proto().is_none();

        if outcome.handshaken_now && was_outbound {
            self.throttle.on_success(peer);
        }
        if outcome.closed.is_some() {
            if was_outbound && never_handshaken {
                self.throttle.on_failure(peer);
            }
            self.unindex(peer);
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some((_, listener)) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    tune_socket(&stream, &self.settings);
                    let client = ClientId(self.next_client_id);
                    self.next_client_id += 1;
                    let token = self.alloc_token();
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, "failed to register accepted socket");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let id = self.alloc_conn_id();
                    let deadline = Instant::now() + self.settings.handshake_timeout;
                    let peer = PeerAddr::Client(client);
                    debug!(%peer, %addr, id, "accepted");
                    self.token_peers.insert(token, peer);
                    self.client_conns
                        .insert(client, Connection::inbound(id, peer, stream, addr, token, deadline));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Periodic housekeeping: expire handshakes, close connections whose
    /// node left the config or changed generation.
    pub(crate) fn sweep(&mut self, completions: &mut Completions) {
        let now = Instant::now();
        let expired: Vec<PeerAddr> = self
            .server_conns
            .values()
            .chain(self.client_conns.values())
            .filter(|conn| conn.handshake_expired(now))
            .map(Connection::peer)
            .collect();
        for peer in expired {
            debug!(%peer, "handshake timed out");
            if matches!(peer, PeerAddr::Server(_)) {
                self.throttle.on_failure(peer);
            }
            self.close_connection(peer, Status::TimedOut, completions);
        }

        let snapshot = self.config.snapshot();
        let stale: Vec<PeerAddr> = self
            .server_conns
            .values()
            .filter(|conn| {
                let PeerAddr::Server(node) = conn.peer() else { return false };
                !matches!(
                    snapshot.lookup(node.index),
                    Some((_, generation)) if generation == node.generation
                )
            })
            .map(Connection::peer)
            .collect();
        for peer in stale {
            debug!(%peer, "peer left the configuration");
            self.close_connection(peer, Status::NotInConfig, completions);
        }
    }

    /// Close and forget the connection to `peer`. The entry is unindexed
    /// before any callback can run, so a send issued from an on-close
    /// callback observes no connection and builds a fresh one.
    pub(crate) fn close_connection(
        &mut self,
        peer: PeerAddr,
        reason: Status,
        completions: &mut Completions,
    ) -> bool {
        let conn = match peer {
            PeerAddr::Server(node) => self.server_conns.swap_remove(&node.index),
            PeerAddr::Client(client) => self.client_conns.swap_remove(&client),
        };
        let Some(mut conn) = conn else { return false };
        self.token_peers.remove(&conn.token());
        conn.close(reason, self.poll.registry(), completions);
        true
    }

    /// Close every connection with `Shutdown`.
    pub(crate) fn shutdown_sockets(&mut self, completions: &mut Completions) {
        info!(
            server = self.server_conns.len(),
            client = self.client_conns.len(),
            "closing all connections"
        );
        let conns: Vec<Connection> = self
            .server_conns
            .drain(..)
            .map(|(_, conn)| conn)
            .chain(self.client_conns.drain(..).map(|(_, conn)| conn))
            .collect();
        self.token_peers.clear();
        for mut conn in conns {
            conn.close(Status::Shutdown, self.poll.registry(), completions);
        }
    }

    fn unindex(&mut self, peer: PeerAddr) {
        let conn = match peer {
            PeerAddr::Server(node) => self.server_conns.swap_remove(&node.index),
            PeerAddr::Client(client) => self.client_conns.swap_remove(&client),
        };
        if let Some(conn) = conn {
            self.token_peers.remove(&conn.token());
        }
    }

    fn conn(&self, peer: PeerAddr) -> Option<&Connection> {
        match peer {
            PeerAddr::Server(node) => self.server_conns.get(&node.index),
            PeerAddr::Client(client) => self.client_conns.get(&client),
        }
    }

    #[inline]
    pub fn used_bytes(&self, class: PeerClass) -> usize {
        self.budget.used(class)
    }

    #[inline]
    pub fn total_used_bytes(&self) -> usize {
        self.budget.total_used()
    }

    pub fn has_connection(&self, peer: PeerAddr) -> bool {
        self.conn(peer).is_some()
    }

    pub fn connection_state(&self, peer: PeerAddr) -> Option<ConnState> {
        self.conn(peer).map(Connection::state)
    }

    pub fn is_handshaken(&self, peer: PeerAddr) -> bool {
        self.conn(peer).is_some_and(Connection::is_handshaken)
    }

    /// Identity of the live connection to `peer`. Recreated connections
    /// get fresh ids, which is how tests tell replacements apart.
    pub fn connection_id(&self, peer: PeerAddr) -> Option<u64> {
        self.conn(peer).map(Connection::id)
    }

    pub fn buffered_bytes(&self, peer: PeerAddr) -> Option<usize> {
        self.conn(peer).map(Connection::buffered_bytes)
    }

    pub fn bytes_pending(&self, peer: PeerAddr) -> Option<usize> {
        self.conn(peer).map(Connection::bytes_pending)
    }

    /// Client ids of currently accepted inbound sockets, in accept order.
    pub fn client_peers(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.client_conns.keys().copied()
    }
}
