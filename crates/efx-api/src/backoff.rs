//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use std::time::Duration;

/// Exponential reconnect backoff with a cap.
///
/// After N consecutive failures the delay is `min(base * 2^(N-1), cap)`;
/// a successful connect resets the failure count to zero.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    /// Create a backoff policy from its base delay and upper bound.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Delay that would apply after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        let delay = self
            .base
            .checked_mul(factor.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Clear the failure count after a successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Delay before HTTP retry attempt `attempt` (1-based), derived from the
/// configured backoff factor in seconds: `factor * 2^(attempt-1)`.
pub fn http_retry_delay(backoff_factor: f64, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1).min(32);
    let seconds = backoff_factor * f64::from(1u32 << exponent);
    Duration::from_secs_f64(seconds.max(0.0))
}
