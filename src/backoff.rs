//! Reconnect backoff utilities.
//!
//! The policy here is transport-agnostic and is used by the stream client
//! worker to space out reconnection attempts after abnormal closures.

use std::time::Duration;

/// Policy controlling reconnect attempts and exponential delay growth.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay used before the first reconnect attempt.
    pub base: Duration,
    /// Multiplicative growth factor applied per attempt.
    pub growth: f64,
    /// Upper bound for the computed delay.
    pub cap: Duration,
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based; the first attempt waits `base`, and each
    /// subsequent attempt grows by `growth` up to `cap`. Delays are
    /// non-decreasing across consecutive attempts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64);
        let scaled = self.base.as_secs_f64() * self.growth.powi(exponent as i32);
        let capped = scaled.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Returns whether the given 1-based attempt is within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            growth: 1.5,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}
