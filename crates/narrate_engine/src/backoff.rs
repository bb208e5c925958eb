use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the push channel is given up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(2^attempts * base, max)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempts))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry(Duration),
    GiveUp,
}

/// Consecutive-failure bookkeeping. Only a successful open resets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempts: u32,
    current_delay: Option<Duration>,
}

impl ReconnectState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Option<Duration> {
        self.current_delay
    }

    pub fn exhausted(&self, policy: &BackoffPolicy) -> bool {
        self.attempts >= policy.max_attempts
    }

    pub fn record_open(&mut self) {
        self.attempts = 0;
        self.current_delay = None;
    }

    /// The delay uses the attempt count from before this failure.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> ReconnectDecision {
        let delay = policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        if self.exhausted(policy) {
            self.current_delay = None;
            return ReconnectDecision::GiveUp;
        }
        self.current_delay = Some(delay);
        ReconnectDecision::Retry(delay)
    }
}
