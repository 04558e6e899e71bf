use std::time::Duration;

/// Re-exported so callers can configure pacing without their own dependency.
pub use exponential_backoff::Backoff;

/// How a [`crate::Coordinator`] paces its compare-and-swap retries.
///
/// A version mismatch means another node won the race and the verb simply
/// re-reads and tries again, so the default is to retry immediately and
/// without bound. Callers that need a deadline bound the attempts and let
/// the mismatch surface.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    // Zero means unbounded.
    attempts: u32,
    backoff: Option<Backoff>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            backoff: None,
        }
    }
}

impl RetryPolicy {
    /// Give up (surfacing the version mismatch) after `attempts` failed
    /// write attempts.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: None,
        }
    }

    /// Sleep per the backoff schedule between attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay before retry number `attempt` (1-based), or None to stop
    /// retrying.
    pub(crate) fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        if self.attempts != 0 && attempt >= self.attempts {
            return None;
        }
        match &self.backoff {
            None => Some(Duration::ZERO),
            Some(backoff) => backoff.next(attempt),
        }
    }
}
