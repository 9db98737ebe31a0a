use std::time::Duration;

/// How much multiplicative jitter a deployment applies to retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterProfile {
    /// Up to 10% on top of the deterministic delay.
    Steady,
    /// Up to 30%, for deployments with many tenants retrying in lockstep.
    Spread,
}

impl JitterProfile {
    fn max_ratio(self) -> f64 {
        match self {
            JitterProfile::Steady => 0.1,
            JitterProfile::Spread => 0.3,
        }
    }
}

/// Per-job exponential retry schedule.
///
/// `next_retry_delay(attempts)` = `min(base * multiplier^(attempts-1), cap)`
/// scaled by `(1 + jitter)` with jitter uniform in `[0, max_ratio)`. Jitter
/// is always multiplicative on top of the exponential term; many jobs
/// scheduled at the same base delay must not retry at the same instant.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    pub jitter: JitterProfile,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 60_000,
            multiplier: 2.0,
            cap_ms: 3_600_000,
            jitter: JitterProfile::Steady,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay for the given attempt count, before jitter.
    pub fn deterministic_delay_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(63);
        let factor = self.multiplier.max(1.0).powi(exp as i32);
        let raw = (self.base_ms as f64) * factor;
        if !raw.is_finite() || raw >= self.cap_ms as f64 {
            self.cap_ms
        } else {
            raw as u64
        }
    }

    /// Jittered delay before the next retry of a job that has now failed
    /// `attempts` times.
    pub fn next_retry_delay(&self, attempts: u32) -> Duration {
        let base = self.deterministic_delay_ms(attempts);
        let jitter = fastrand::f64() * self.jitter.max_ratio();
        Duration::from_millis((base as f64 * (1.0 + jitter)) as u64)
    }
}

/// Tuning for the batch-adaptive backoff controller.
#[derive(Debug, Clone)]
pub struct BatchBackoffConfig {
    /// Failure-rate at or above which a batch counts as bad.
    pub failure_rate_threshold: f64,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for BatchBackoffConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            initial_delay_ms: 5_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

/// Adaptive delay applied to the whole pipeline, not an individual job.
///
/// Per-job backoff cannot protect a downstream platform or the database
/// from many jobs failing for the same systemic reason; this controller
/// slows the entire batch loop when the recent failure rate is high.
///
/// State is held explicitly per orchestrator instance so tests can inject
/// arbitrary starting conditions and multiple pipelines in one process do
/// not share hidden state.
#[derive(Debug, Clone)]
pub struct BatchBackoff {
    config: BatchBackoffConfig,
    consecutive_bad: u32,
    delay_ms: u64,
}

impl BatchBackoff {
    pub fn new(config: BatchBackoffConfig) -> Self {
        Self {
            config,
            consecutive_bad: 0,
            delay_ms: 0,
        }
    }

    /// Delay to sleep at the start of the next batch pass.
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn consecutive_bad_batches(&self) -> u32 {
        self.consecutive_bad
    }

    /// Feed the outcome counts of a finished batch into the controller.
    pub fn observe_batch(&mut self, total: usize, failed: usize, limit_exceeded: usize) {
        if total == 0 {
            return;
        }

        let failure_rate = (failed + limit_exceeded) as f64 / total as f64;
        if failure_rate >= self.config.failure_rate_threshold {
            self.consecutive_bad = self.consecutive_bad.saturating_add(1);
            let exp = self.consecutive_bad.saturating_sub(1).min(63);
            let raw = self.config.initial_delay_ms as f64
                * self.config.multiplier.max(1.0).powi(exp as i32);
            self.delay_ms = if !raw.is_finite() || raw >= self.config.max_delay_ms as f64 {
                self.config.max_delay_ms
            } else {
                raw as u64
            };
        } else {
            self.consecutive_bad = self.consecutive_bad.saturating_sub(1);
            if self.consecutive_bad == 0 {
                self.delay_ms = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_delay_grows_until_cap() {
        let policy = RetryPolicy::default();
        let mut previous = 0;
        for attempts in 1..=20 {
            let delay = policy.deterministic_delay_ms(attempts);
            assert!(delay >= previous, "delay decreased at attempt {attempts}");
            assert!(delay <= policy.cap_ms);
            previous = delay;
        }
        assert_eq!(policy.deterministic_delay_ms(20), policy.cap_ms);
    }

    #[test]
    fn jittered_delay_stays_below_cap_times_1_3() {
        let policy = RetryPolicy {
            jitter: JitterProfile::Spread,
            ..RetryPolicy::default()
        };
        for attempts in 1..=30 {
            for _ in 0..50 {
                let delay = policy.next_retry_delay(attempts).as_millis() as f64;
                assert!(delay < policy.cap_ms as f64 * 1.3);
                assert!(delay >= policy.deterministic_delay_ms(attempts) as f64);
            }
        }
    }

    #[test]
    fn bad_batch_sets_initial_delay() {
        let config = BatchBackoffConfig::default();
        let initial = config.initial_delay_ms;
        let mut backoff = BatchBackoff::new(config);

        // 6 failed out of 10 is 60%, at or above the 50% threshold.
        backoff.observe_batch(10, 6, 0);
        assert_eq!(backoff.current_delay(), Duration::from_millis(initial));
    }

    #[test]
    fn consecutive_bad_batches_grow_exponentially() {
        let mut backoff = BatchBackoff::new(BatchBackoffConfig::default());
        backoff.observe_batch(10, 10, 0);
        backoff.observe_batch(10, 10, 0);
        backoff.observe_batch(10, 10, 0);
        assert_eq!(backoff.current_delay(), Duration::from_millis(20_000));
        assert_eq!(backoff.consecutive_bad_batches(), 3);
    }

    #[test]
    fn limit_exceeded_counts_toward_failure_rate() {
        let mut backoff = BatchBackoff::new(BatchBackoffConfig::default());
        backoff.observe_batch(10, 2, 3);
        assert_eq!(backoff.current_delay(), Duration::from_millis(5_000));
    }

    #[test]
    fn good_batches_decay_and_reset() {
        let mut backoff = BatchBackoff::new(BatchBackoffConfig::default());
        backoff.observe_batch(10, 10, 0);
        backoff.observe_batch(10, 10, 0);
        assert!(backoff.current_delay() > Duration::ZERO);

        backoff.observe_batch(10, 0, 0);
        // Counter decayed but not yet zero; delay persists.
        assert!(backoff.current_delay() > Duration::ZERO);

        backoff.observe_batch(10, 0, 0);
        assert_eq!(backoff.current_delay(), Duration::ZERO);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut backoff = BatchBackoff::new(BatchBackoffConfig::default());
        backoff.observe_batch(0, 0, 0);
        assert_eq!(backoff.current_delay(), Duration::ZERO);
        assert_eq!(backoff.consecutive_bad_batches(), 0);
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff = BatchBackoff::new(BatchBackoffConfig {
            initial_delay_ms: 100_000,
            max_delay_ms: 300_000,
            ..BatchBackoffConfig::default()
        });
        for _ in 0..10 {
            backoff.observe_batch(4, 4, 0);
        }
        assert_eq!(backoff.current_delay(), Duration::from_millis(300_000));
    }
}
