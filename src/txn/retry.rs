// # Retry Policy
//
// Pacing for the cooperative retry loop around conflict rollbacks. Backoff
// grows linearly with a small cap so a herd of conflicting writers spreads
// out without anyone stalling for long.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub cap: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(cap: u32) -> RetryPolicy {
        RetryPolicy {
            cap,
            base_delay: Duration::from_micros(100),
            max_delay: Duration::from_millis(5),
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.cap
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.base_delay * attempt.min(64)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_saturates() {
        let policy = RetryPolicy::new(100);
        assert!(policy.backoff(1) < policy.backoff(10));
        assert_eq!(policy.backoff(1000), policy.max_delay);
        assert!(!policy.exhausted(99));
        assert!(policy.exhausted(100));
    }
}
