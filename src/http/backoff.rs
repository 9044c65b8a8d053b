//! Retry backoff
//!
//! The backoff is a property of the transport, not of one transaction:
//! every failed attempt anywhere doubles it, every success halves it, and
//! all concurrent transactions share the resulting delay.

use std::time::Duration;

use rand::Rng;

/// Next shared backoff value: double on error, halve on success, clamped
/// to `[min, max]`. `prev` must be positive.
pub fn next_backoff(min: Duration, max: Duration, prev: Duration, in_error: bool) -> Duration {
    let min = min.max(Duration::from_millis(1));
    if in_error {
        (prev * 2).min(max)
    } else {
        (prev / 2).max(min)
    }
}

/// Randomize a backoff for one waiter: uniform in `[backoff/2, backoff]`.
/// Spreads reconnect attempts so recovering clients do not stampede.
pub fn randomized_backoff(backoff: Duration) -> Duration {
    let base = backoff.as_millis() as u64;
    if base <= 1 {
        return backoff;
    }
    let millis = rand::thread_rng().gen_range(base / 2..=base);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(5);

    #[test]
    fn test_error_doubles_until_max() {
        let mut backoff = MIN;
        backoff = next_backoff(MIN, MAX, backoff, true);
        assert_eq!(backoff, Duration::from_millis(1000));
        for _ in 0..10 {
            backoff = next_backoff(MIN, MAX, backoff, true);
        }
        assert_eq!(backoff, MAX);
    }

    #[test]
    fn test_success_halves_until_min() {
        let mut backoff = MAX;
        backoff = next_backoff(MIN, MAX, backoff, false);
        assert_eq!(backoff, Duration::from_millis(2500));
        for _ in 0..10 {
            backoff = next_backoff(MIN, MAX, backoff, false);
        }
        assert_eq!(backoff, MIN);
    }

    #[test]
    fn test_randomized_backoff_in_range() {
        let backoff = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = randomized_backoff(backoff);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= backoff);
        }
    }
}
