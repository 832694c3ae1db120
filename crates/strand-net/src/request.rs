use strand_wire::{Message, PeerAddr};

use crate::worker::Worker;

pub type RequestId = u64;

/// What the worker should do with a request after handing it control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the request registered; replies carrying its id keep being
    /// delivered.
    Continue,
    /// The request is finished; drop it.
    Done,
}

/// A unit of work scheduled on a worker. Runs to completion on the
/// worker thread; there are no suspension points other than waiting for
/// replies routed back by request id.
pub trait Request {
    fn rqid(&self) -> RequestId;

    /// First slice of work, run from the task queue.
    fn execute(&mut self, worker: &mut Worker) -> Disposition;

    /// A reply addressed to this request arrived. Replies for ids with no
    /// registered request are dropped by the worker; the request has
    /// already completed or been cancelled.
    fn on_reply(&mut self, from: PeerAddr, msg: Message, worker: &mut Worker) -> Disposition;
}
