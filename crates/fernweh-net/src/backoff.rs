//! Reconnection backoff: exponential growth with equal jitter, so a fleet
//! of clients losing the same server does not retry in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^n` capped, then jittered
    /// into `[half, full]` of that value.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let half = exp.as_millis() as u64 / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=half.max(1));
        Duration::from_millis(jittered)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called after a successful connect so the next outage starts cheap.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        for expected_exp in [1u64, 2, 4, 8, 16, 30, 30] {
            let delay = backoff.next_delay();
            let full = Duration::from_secs(expected_exp);
            assert!(delay <= full, "delay {delay:?} above cap {full:?}");
            assert!(
                delay >= full / 2,
                "delay {delay:?} below jitter floor {:?}",
                full / 2
            );
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }
}
