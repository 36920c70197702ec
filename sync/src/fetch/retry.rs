use std::time::Duration;

use config::shared::RetryConfig;
use rand::Rng;

/// Backoff timing for retried page requests.
///
/// Delays grow exponentially from the initial delay, are capped at the
/// maximum, and carry uniform jitter so that concurrent fetchers do not
/// retry in lockstep. A server-provided `Retry-After` hint replaces the
/// computed delay, still subject to the cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f32,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f32,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_factor,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_factor,
        )
    }

    /// Maximum attempts for a single request, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = match hint {
            Some(hint) => hint.min(self.max_delay),
            None => {
                let exponent = attempt.saturating_sub(1).min(16);
                let factor = self.backoff_factor.powi(exponent as i32) as f64;
                let millis = (self.initial_delay.as_millis() as f64 * factor)
                    .min(self.max_delay.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        };

        base + jitter(base)
    }
}

/// Uniform jitter up to a quarter of the base delay.
fn jitter(base: Duration) -> Duration {
    let max_jitter_ms = (base.as_millis() / 4) as u64;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }

    Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(30), 2.0)
    }

    #[test]
    fn delays_grow_exponentially_within_bounds() {
        let policy = policy();

        let first = policy.delay_for_attempt(1, None);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(625));

        let third = policy.delay_for_attempt(3, None);
        assert!(third >= Duration::from_millis(2000));
        assert!(third <= Duration::from_millis(2500));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = policy();

        let late = policy.delay_for_attempt(12, None);
        // Cap plus at most 25% jitter.
        assert!(late <= Duration::from_millis(37_500));
        assert!(late >= Duration::from_secs(30));
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let policy = policy();

        let hinted = policy.delay_for_attempt(1, Some(Duration::from_secs(7)));
        assert!(hinted >= Duration::from_secs(7));
        assert!(hinted <= Duration::from_millis(8750));
    }

    #[test]
    fn oversized_hint_is_capped() {
        let policy = policy();

        let hinted = policy.delay_for_attempt(1, Some(Duration::from_secs(600)));
        assert!(hinted <= Duration::from_millis(37_500));
    }
}
