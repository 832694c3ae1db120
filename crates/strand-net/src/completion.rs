use std::collections::VecDeque;

use strand_wire::Status;

use crate::worker::Worker;

/// Owned completion callback. Held by the pending-send record that it
/// belongs to and consumed on invocation, so it can never fire twice; it
/// runs with full worker access, which is what makes reentrant `send` and
/// `close` from inside a callback safe.
pub type SendCallback = Box<dyn FnOnce(Status, &mut Worker)>;

pub(crate) struct Completion {
    pub status: Status,
    pub cb: SendCallback,
}

/// FIFO staging area for callbacks whose records have already been
/// removed. Mutating calls stage here and return; the worker drains the
/// queue once no connection or sender borrow is live.
#[derive(Default)]
pub struct Completions(VecDeque<Completion>);

impl Completions {
    #[inline]
    pub(crate) fn stage(&mut self, cb: Option<SendCallback>, status: Status) {
        if let Some(cb) = cb {
            self.0.push_back(Completion { status, cb });
        }
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<Completion> {
        self.0.pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}
