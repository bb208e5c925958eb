use std::time::Duration;

/// Refetch cadence while the push channel is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Delay until the next poll, or `None` when nothing should be polled.
    ///
    /// Polls only on the polling channel and only while work is unresolved;
    /// with push connected the stream carries every change.
    pub fn next_poll(&self, polling: bool, has_unresolved: bool) -> Option<Duration> {
        (polling && has_unresolved).then_some(self.interval)
    }
}
