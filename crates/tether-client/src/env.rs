//! Production [`Environment`]: real clocks and thread-local randomness.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use tether_core::env::Environment;

/// System clock and `rand` thread RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    fn jitter(&self, max: Duration) -> Duration {
        if max.is_zero() {
            return Duration::ZERO;
        }
        let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds() {
        let env = SystemEnv;
        for _ in 0..100 {
            let j = env.jitter(Duration::from_millis(250));
            assert!(j <= Duration::from_millis(250));
        }
        assert_eq!(env.jitter(Duration::ZERO), Duration::ZERO);
    }
}
