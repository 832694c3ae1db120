use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use strand_wire::PeerAddr;
use tracing::debug;

struct Backoff {
    delay: Duration,
    until: Instant,
}

/// Per-peer pacing for reconnect attempts. Failures double the delay up
/// to the cap; a completed handshake clears the entry. Zero initial and
/// max disable throttling entirely.
pub struct ConnectThrottle {
    initial: Duration,
    max: Duration,
    entries: HashMap<PeerAddr, Backoff>,
}

impl ConnectThrottle {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, entries: HashMap::new() }
    }

    #[inline]
    fn disabled(&self) -> bool {
        self.initial.is_zero() && self.max.is_zero()
    }

    pub fn may_connect(&self, peer: PeerAddr) -> bool {
        if self.disabled() {
            return true;
        }
        self.entries.get(&peer).is_none_or(|backoff| Instant::now() >= backoff.until)
    }

    pub fn on_success(&mut self, peer: PeerAddr) {
        self.entries.remove(&peer);
    }

    pub fn on_failure(&mut self, peer: PeerAddr) {
        if self.disabled() {
            return;
        }
        let delay = match self.entries.get(&peer) {
            Some(backoff) => self.max.min(backoff.delay.saturating_mul(2)),
            None => self.initial,
        };
        debug!(%peer, ?delay, "connect backoff");
        self.entries.insert(peer, Backoff { delay, until: Instant::now() + delay });
    }
}

#[cfg(test)]
mod tests {
    use strand_wire::NodeId;

    use super::*;

    fn peer() -> PeerAddr {
        PeerAddr::Server(NodeId::new(1, 1))
    }

    #[test]
    fn failures_back_off_exponentially_up_to_the_cap() {
        let mut throttle =
            ConnectThrottle::new(Duration::from_millis(100), Duration::from_millis(350));
        assert!(throttle.may_connect(peer()));

        throttle.on_failure(peer());
        assert!(!throttle.may_connect(peer()));
        assert_eq!(throttle.entries[&peer()].delay, Duration::from_millis(100));

        throttle.on_failure(peer());
        assert_eq!(throttle.entries[&peer()].delay, Duration::from_millis(200));

        throttle.on_failure(peer());
        assert_eq!(throttle.entries[&peer()].delay, Duration::from_millis(350));
    }

    #[test]
    fn success_clears_the_backoff() {
        let mut throttle = ConnectThrottle::new(Duration::from_secs(1), Duration::from_secs(10));
        throttle.on_failure(peer());
        assert!(!throttle.may_connect(peer()));

        throttle.on_success(peer());
        assert!(throttle.may_connect(peer()));
    }

    #[test]
    fn zero_zero_disables_throttling() {
        let mut throttle = ConnectThrottle::new(Duration::ZERO, Duration::ZERO);
        throttle.on_failure(peer());
        throttle.on_failure(peer());
        assert!(throttle.may_connect(peer()));
    }

    #[test]
    fn expired_backoff_allows_a_retry() {
        let mut throttle = ConnectThrottle::new(Duration::ZERO, Duration::from_secs(10));
        // initial is zero but max is not, so throttling is active with an
        // immediately-expired first window.
        throttle.on_failure(peer());
        assert!(throttle.may_connect(peer()));
    }
}
