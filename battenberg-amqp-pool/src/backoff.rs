//! Reconnection backoff policies.

use std::sync::Arc;
use std::time::Duration;

/// Maps a 0-based retry attempt to the sleep observed before the next dial.
///
/// Policies must be monotonic non-decreasing in the attempt number.
pub type BackoffPolicy = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// An exponential backoff doubling from `min` up to `max`.
pub fn exponential(min: Duration, max: Duration) -> BackoffPolicy {
    Arc::new(move |attempt| {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        min.checked_mul(factor).unwrap_or(max).clamp(min, max)
    })
}

/// The default reconnection policy: exponential between 1s and 15s.
pub fn default_backoff() -> BackoffPolicy {
    exponential(Duration::from_secs(1), Duration::from_secs(15))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_doubles_from_one_second() {
        let backoff = default_backoff();
        let delays: Vec<u64> = (0..4).map(|r| backoff(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn default_policy_caps_at_fifteen_seconds() {
        let backoff = default_backoff();
        assert_eq!(backoff(4), Duration::from_secs(15));
        assert_eq!(backoff(100), Duration::from_secs(15));
    }

    #[test]
    fn policy_is_monotonic_non_decreasing() {
        let backoff = exponential(Duration::from_millis(250), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 0..128 {
            let delay = backoff(attempt);
            assert!(delay >= previous, "backoff regressed at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn lower_bound_applies_to_the_first_attempt() {
        let backoff = exponential(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff(0), Duration::from_secs(2));
    }
}
