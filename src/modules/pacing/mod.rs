//! Human-like request pacing.
//!
//! Computes the randomized delay applied before every attempt and between
//! dequeues, the fixed throttle delay, and exponential backoff after
//! connection failures.

use std::time::Duration;

use crate::modules::rng::SharedRng;

/// Delay envelope used by the dispatcher.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Extra uniform jitter added on top of the base range.
    pub jitter: Duration,
    /// Fixed pause inserted when the governor flags a burst.
    pub throttle_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            jitter: Duration::from_millis(500),
            throttle_delay: Duration::from_millis(5000),
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl PacingConfig {
    /// No waiting at all. Useful for tests and local tooling.
    pub fn immediate() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            throttle_delay: Duration::ZERO,
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pacer {
    config: PacingConfig,
    rng: SharedRng,
}

impl Pacer {
    pub fn new(config: PacingConfig, rng: SharedRng) -> Self {
        Self { config, rng }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Uniform delay in `[min, max]` plus `[0, jitter]`.
    pub fn human_delay(&self) -> Duration {
        let low = self.config.min_delay.as_millis() as u64;
        let high = (self.config.max_delay.as_millis() as u64).max(low);
        let base = self.rng.range_u64(low, high);
        let jitter = self.rng.range_u64(0, self.config.jitter.as_millis() as u64);
        Duration::from_millis(base + jitter)
    }

    pub fn throttle_delay(&self) -> Duration {
        self.config.throttle_delay
    }

    /// `base * 2^(failures - 1)`, capped. Zero failures means no wait.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap)
    }

    pub async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_delay_stays_in_envelope() {
        let pacer = Pacer::new(PacingConfig::default(), SharedRng::from_seed(3));
        for _ in 0..500 {
            let delay = pacer.human_delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(3500));
        }
    }

    #[test]
    fn seeded_pacers_agree() {
        let a = Pacer::new(PacingConfig::default(), SharedRng::from_seed(11));
        let b = Pacer::new(PacingConfig::default(), SharedRng::from_seed(11));
        let left: Vec<_> = (0..8).map(|_| a.human_delay()).collect();
        let right: Vec<_> = (0..8).map(|_| b.human_delay()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let pacer = Pacer::new(PacingConfig::default(), SharedRng::from_seed(1));
        assert_eq!(pacer.backoff_delay(0), Duration::ZERO);
        assert_eq!(pacer.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(pacer.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(pacer.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(pacer.backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn immediate_config_never_waits() {
        let pacer = Pacer::new(PacingConfig::immediate(), SharedRng::from_seed(1));
        assert_eq!(pacer.human_delay(), Duration::ZERO);
        assert_eq!(pacer.backoff_delay(4), Duration::ZERO);
    }
}
