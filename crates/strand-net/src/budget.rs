use std::{cell::RefCell, rc::Rc};

use strand_wire::PeerClass;

use crate::settings::Settings;

struct BudgetState {
    used_server: usize,
    used_client: usize,
    class_cap: usize,
    combined_cap: usize,
    socket_min: usize,
    per_class: bool,
}

impl BudgetState {
    fn used_mut(&mut self, class: PeerClass) -> &mut usize {
        match class {
            PeerClass::Server => &mut self.used_server,
            PeerClass::Client => &mut self.used_client,
        }
    }
}

/// Output-memory accounting for one worker. Two class totals, each
/// capped; every socket additionally holds a guaranteed minimum that
/// front-runs the caps, so a fresh connection can always make progress
/// even when its class is saturated by other peers.
///
/// Single-threaded by construction; lives on the owning worker only.
#[derive(Clone)]
pub struct OutbufBudget {
    state: Rc<RefCell<BudgetState>>,
}

impl OutbufBudget {
    pub fn new(settings: &Settings) -> Self {
        let combined_cap = settings.outbufs_mb_max_per_thread * 1024 * 1024;
        Self {
            state: Rc::new(RefCell::new(BudgetState {
                used_server: 0,
                used_client: 0,
                class_cap: combined_cap / 2,
                combined_cap,
                socket_min: settings.outbuf_socket_min_kb * 1024,
                per_class: settings.outbufs_limit_per_peer_type_enabled,
            })),
        }
    }

    /// Admit `bytes` for a socket that currently holds `socket_reserved`
    /// bytes, or refuse without side effects. An admitted reservation is
    /// charged to the class total until the returned value is dropped.
    pub fn try_reserve(
        &self,
        class: PeerClass,
        bytes: usize,
        socket_reserved: usize,
    ) -> Option<Reservation> {
        let mut state = self.state.borrow_mut();
        let admit = if socket_reserved < state.socket_min {
            true
        } else if state.per_class {
            let used = match class {
                PeerClass::Server => state.used_server,
                PeerClass::Client => state.used_client,
            };
            used + bytes <= state.class_cap
        } else {
            state.used_server + state.used_client + bytes <= state.combined_cap
        };
        if !admit {
            return None;
        }
        *state.used_mut(class) += bytes;
        drop(state);
        Some(Reservation { state: Rc::clone(&self.state), class, bytes })
    }

    #[inline]
    pub fn used(&self, class: PeerClass) -> usize {
        let state = self.state.borrow();
        match class {
            PeerClass::Server => state.used_server,
            PeerClass::Client => state.used_client,
        }
    }

    #[inline]
    pub fn total_used(&self) -> usize {
        let state = self.state.borrow();
        state.used_server + state.used_client
    }
}

/// One admitted send's share of the class total. Shrinks once the
/// message is encoded at the negotiated protocol; releases in full on
/// drop, whether the bytes were transmitted or torn down with the
/// connection.
pub struct Reservation {
    state: Rc<RefCell<BudgetState>>,
    class: PeerClass,
    bytes: usize,
}

impl Reservation {
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Refund the difference between the reserved upper bound and the
    /// actual encoded size.
    pub fn shrink(&mut self, actual: usize) {
        debug_assert!(actual <= self.bytes, "reservations never grow");
        if actual < self.bytes {
            *self.state.borrow_mut().used_mut(self.class) -= self.bytes - actual;
            self.bytes = actual;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        *self.state.borrow_mut().used_mut(self.class) -= self.bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(mb: usize, min_kb: usize, per_class: bool) -> OutbufBudget {
        OutbufBudget::new(&Settings {
            outbufs_mb_max_per_thread: mb,
            outbuf_socket_min_kb: min_kb,
            outbufs_limit_per_peer_type_enabled: per_class,
            ..Settings::default()
        })
    }

    const KIB: usize = 1024;

    #[test]
    fn class_caps_are_half_the_worker_budget() {
        let budget = budget(1, 1, true);

        // Fresh sockets are admitted by the per-socket minimum.
        let a = budget.try_reserve(PeerClass::Server, 600 * KIB, 0).unwrap();
        let _b = budget.try_reserve(PeerClass::Server, 600 * KIB, 0).unwrap();
        assert_eq!(budget.used(PeerClass::Server), 1200 * KIB);

        // A socket past its minimum competes against the class cap.
        assert!(budget.try_reserve(PeerClass::Server, 600 * KIB, 600 * KIB).is_none());

        // The client class is unaffected by server saturation.
        assert!(budget.try_reserve(PeerClass::Client, 100 * KIB, 100 * KIB).is_some());

        drop(a);
        assert_eq!(budget.used(PeerClass::Server), 600 * KIB);
    }

    #[test]
    fn socket_minimum_front_runs_a_saturated_class() {
        let budget = budget(1, 1, true);
        let _hog = budget.try_reserve(PeerClass::Server, 600 * KIB, 0).unwrap();

        // First reservation on a fresh socket goes through even though it
        // exceeds the minimum itself; the second does not.
        let first = budget.try_reserve(PeerClass::Server, 2 * KIB, 0);
        assert!(first.is_some());
        assert!(budget.try_reserve(PeerClass::Server, 2 * KIB, 2 * KIB).is_none());
    }

    #[test]
    fn combined_mode_shares_one_pool() {
        let budget = budget(1, 1, false);
        let _s = budget.try_reserve(PeerClass::Server, 600 * KIB, 0).unwrap();
        let _c = budget.try_reserve(PeerClass::Client, 300 * KIB, 0).unwrap();

        // 900 KiB of the shared 1 MiB pool is gone.
        assert!(budget.try_reserve(PeerClass::Server, 200 * KIB, 50 * KIB).is_none());
        assert!(budget.try_reserve(PeerClass::Client, 100 * KIB, 50 * KIB).is_some());
    }

    #[test]
    fn shrink_refunds_the_difference() {
        let budget = budget(1, 1, true);
        let mut res = budget.try_reserve(PeerClass::Server, 100 * KIB, 0).unwrap();
        res.shrink(90 * KIB);
        assert_eq!(budget.used(PeerClass::Server), 90 * KIB);
        assert_eq!(res.bytes(), 90 * KIB);
        drop(res);
        assert_eq!(budget.total_used(), 0);
    }
}
