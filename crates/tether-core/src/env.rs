//! Environment abstraction for time and jitter.
//!
//! State machines in this crate take time as a parameter rather than
//! reading a clock, so they stay deterministic. The runtime supplies an
//! [`Environment`] at its edges (timers, reconnect jitter, heartbeat
//! timestamps); the test harness supplies a seeded implementation.

use std::time::{Duration, Instant};

/// Source of time and randomness for the runtime layer.
pub trait Environment: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time in unix milliseconds (heartbeat
    /// timestamps, invite expiry checks).
    fn unix_ms(&self) -> u64;

    /// Uniform random jitter in `[0, max]`.
    fn jitter(&self, max: Duration) -> Duration;
}
