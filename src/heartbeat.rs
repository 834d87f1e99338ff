//! Liveness monitor bookkeeping.
//!
//! `Heartbeat` tracks inbound activity on one connection leg and decides when
//! a liveness probe is due. It holds no timer of its own; the owning task
//! drives it from its interval tick and feeds it the current instant, which
//! keeps the decision logic deterministic under test.

use std::time::Duration;

use tokio::time::Instant;

/// Default interval between liveness checks.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Tracks inbound silence on a connection and schedules liveness probes.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    interval: Duration,
    last_inbound: Instant,
    last_probe: Instant,
}

impl Heartbeat {
    /// Creates a monitor that considers the connection live as of `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_inbound: now,
            last_probe: now,
        }
    }

    /// Records an inbound frame. Any frame counts, including probe replies.
    pub fn note_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Returns whether a probe should be emitted at `now`.
    ///
    /// A probe is due once the peer has been silent for longer than the
    /// interval, at most one probe per interval.
    pub fn probe_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_inbound) > self.interval
            && now.duration_since(self.last_probe) >= self.interval
    }

    /// Resets the last-sent marker after emitting a probe.
    pub fn mark_probe(&mut self, now: Instant) {
        self.last_probe = now;
    }

    /// Interval between liveness checks.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
