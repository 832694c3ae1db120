use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::mpsc,
    time::Duration,
};

use mio::Events;
use strand_config::ConfigView;
use strand_wire::{Message, NodeId, PeerAddr, Status};
use tracing::{debug, info};

use crate::{
    completion::Completions,
    request::{Disposition, Request, RequestId},
    sender::{SendError, SendOptions, Sender},
    settings::Settings,
};

type Task = Box<dyn FnOnce(&mut Worker)>;

const EVENT_CAPACITY: usize = 128;

/// Single-threaded cooperative executor bound to one poll instance. Owns
/// a sender, a task queue and the registry of running requests; every
/// connection it routes for is touched only from this thread. Tasks run
/// to completion; the only suspension points are I/O readiness and the
/// timer-driven sweeps inside `tick`.
pub struct Worker {
    events: Events,
    sender: Sender,
    tasks: VecDeque<Task>,
    posted_rx: mpsc::Receiver<Box<dyn FnOnce(&mut Worker) + Send>>,
    posted_tx: mpsc::Sender<Box<dyn FnOnce(&mut Worker) + Send>>,
    requests: HashMap<RequestId, Box<dyn Request>>,
    completions: Completions,
    inbound: Vec<(PeerAddr, Message)>,
    shutting_down: bool,
}

/// Cheap cross-thread handle for posting work onto a worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Box<dyn FnOnce(&mut Worker) + Send>>,
}

impl WorkerHandle {
    pub fn post(&self, f: impl FnOnce(&mut Worker) + Send + 'static) -> Result<(), Status> {
        self.tx.send(Box::new(f)).map_err(|_| Status::Shutdown)
    }
}

impl Worker {
    pub fn new(
        settings: Settings,
        config: ConfigView,
        local_node: Option<NodeId>,
    ) -> io::Result<Self> {
        let sender = Sender::new(settings, config, local_node)?;
        let (posted_tx, posted_rx) = mpsc::channel();
        Ok(Self {
            events: Events::with_capacity(EVENT_CAPACITY),
            sender,
            tasks: VecDeque::new(),
            posted_rx,
            posted_tx,
            requests: HashMap::new(),
            completions: Completions::default(),
            inbound: Vec::new(),
            shutting_down: false,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { tx: self.posted_tx.clone() }
    }

    #[inline]
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Start accepting inbound peers on `addr`; returns the bound
    /// address.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        self.sender.listen(addr)
    }

    /// Initiate a connection without sending anything.
    pub fn connect(&mut self, node: NodeId) -> Result<(), Status> {
        if self.shutting_down {
            return Err(Status::Shutdown);
        }
        self.sender.connect(node, &mut self.completions)
    }

    /// Route `msg` to `peer`. See `Sender::send_message` for the
    /// contract; completion callbacks run on this worker in subsequent
    /// `tick`s.
    pub fn send_message(
        &mut self,
        msg: Message,
        peer: PeerAddr,
        opts: SendOptions,
    ) -> Result<(), SendError> {
        if self.shutting_down {
            return Err(SendError { status: Status::Shutdown, peer, msg });
        }
        self.sender.send_message(msg, peer, opts, &mut self.completions)
    }

    /// Close the connection to `peer` with `reason`; pending callbacks
    /// fire on the next `tick`.
    pub fn close_connection(&mut self, peer: PeerAddr, reason: Status) -> bool {
        self.sender.close_connection(peer, reason, &mut self.completions)
    }

    /// Enqueue a request. It starts executing on the next `tick` and
    /// stays registered for replies while it returns
    /// `Disposition::Continue`.
    pub fn post(&mut self, request: Box<dyn Request>) -> Result<(), Status> {
        if self.shutting_down {
            return Err(Status::Shutdown);
        }
        self.tasks.push_back(Box::new(move |worker| worker.start_request(request)));
        Ok(())
    }

    /// Enqueue a plain closure.
    pub fn add(&mut self, f: impl FnOnce(&mut Worker) + 'static) -> Result<(), Status> {
        if self.shutting_down {
            return Err(Status::Shutdown);
        }
        self.tasks.push_back(Box::new(f));
        Ok(())
    }

    fn start_request(&mut self, mut request: Box<dyn Request>) {
        let rqid = request.rqid();
        match request.execute(self) {
            Disposition::Continue => {
                self.requests.insert(rqid, request);
            }
            Disposition::Done => {}
        }
    }

    /// One scheduler turn: queued tasks, poll, socket events, timeout
    /// sweeps, reply dispatch, then completion callbacks.
    pub fn tick(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.run_tasks();
        self.sender.poll_events(&mut self.events, timeout)?;
        for event in self.events.iter() {
            self.sender.handle_event(event, &mut self.inbound, &mut self.completions);
        }
        self.sender.sweep(&mut self.completions);
        self.dispatch_inbound();
        self.run_completions();
        Ok(())
    }

    /// Run until shut down from a posted task or handle.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutting_down {
            self.tick(Some(Duration::from_millis(10)))?;
        }
        Ok(())
    }

    /// Stop accepting work, close every connection with `Shutdown` and
    /// drain residual callbacks.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("worker shutting down");
        self.shutting_down = true;
        self.sender.shutdown_sockets(&mut self.completions);
        self.run_completions();
        self.tasks.clear();
        self.requests.clear();
    }

    fn run_tasks(&mut self) {
        while let Ok(posted) = self.posted_rx.try_recv() {
            self.tasks.push_back(posted);
        }
        // Tasks enqueued by a running task wait for the next turn.
        let mut tasks = std::mem::take(&mut self.tasks);
        while let Some(task) = tasks.pop_front() {
            task(self);
        }
    }

    fn dispatch_inbound(&mut self) {
        let inbound = std::mem::take(&mut self.inbound);
        for (from, msg) in inbound {
            let Some(rqid) = msg.rqid() else {
                debug!(%from, ty = %msg.msg_type(), "dropping unrouted message");
                continue;
            };
            // The registry entry is removed for the duration of the
            // callback; a reply for an unknown id means the request
            // already completed and is dropped silently.
            let Some(mut request) = self.requests.remove(&rqid) else {
                debug!(rqid, "no running request for reply");
                continue;
            };
            match request.on_reply(from, msg, self) {
                Disposition::Continue => {
                    self.requests.insert(rqid, request);
                }
                Disposition::Done => {}
            }
        }
    }

    /// Drain staged completion callbacks. A callback may send or close,
    /// staging further completions; the loop keeps going until the
    /// queue stays empty.
    fn run_completions(&mut self) {
        loop {
            let mut batch = std::mem::take(&mut self.completions);
            if batch.is_empty() {
                break;
            }
            while let Some(completion) = batch.pop() {
                (completion.cb)(completion.status, self);
            }
        }
    }
}
