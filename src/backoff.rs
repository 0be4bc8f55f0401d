//! Delay computation for the retry kernel.
//!
//! Spec formula (§4.1):
//! `base = initialDelay × backoff^(attempt-1)`, `attempt` 1-indexed.

use std::time::Duration;

/// Compute the unjittered base delay for a given attempt number.
///
/// Overflow-safe: the exponent and multiplication both saturate rather than
/// panic, matching the teacher's exponential-backoff overflow handling.
pub fn base_delay(initial: Duration, factor: f64, attempt: usize) -> Duration {
    if factor <= 0.0 {
        return initial;
    }
    let exponent = attempt.saturating_sub(1) as i32;
    let multiplier = factor.powi(exponent);
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Duration::from_secs(u64::MAX / 1000);
    }
    let scaled_millis = initial.as_secs_f64() * 1000.0 * multiplier;
    if !scaled_millis.is_finite() || scaled_millis >= (u64::MAX as f64) {
        Duration::from_secs(u64::MAX / 1000)
    } else {
        Duration::from_millis(scaled_millis.max(0.0) as u64)
    }
}

/// Clamp a delay into `[min, max]`.
pub fn clamp(delay: Duration, min: Duration, max: Duration) -> Duration {
    delay.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_first_attempt_is_initial() {
        let d = base_delay(Duration::from_millis(500), 2.0, 1);
        assert_eq!(d, Duration::from_millis(500));
    }

    #[test]
    fn base_delay_doubles_per_attempt_with_factor_two() {
        assert_eq!(base_delay(Duration::from_millis(500), 2.0, 1), Duration::from_millis(500));
        assert_eq!(base_delay(Duration::from_millis(500), 2.0, 2), Duration::from_millis(1000));
        assert_eq!(base_delay(Duration::from_millis(500), 2.0, 3), Duration::from_millis(2000));
    }

    #[test]
    fn base_delay_constant_with_factor_one() {
        for attempt in 1..=5 {
            assert_eq!(base_delay(Duration::from_millis(250), 1.0, attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn base_delay_does_not_panic_on_large_attempt() {
        let d = base_delay(Duration::from_secs(1), 2.0, 200);
        assert!(d >= Duration::from_secs(1));
    }

    #[test]
    fn clamp_respects_bounds() {
        let min = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(clamp(Duration::from_millis(100), min, max), min);
        assert_eq!(clamp(Duration::from_secs(60), min, max), max);
        assert_eq!(clamp(Duration::from_secs(5), min, max), Duration::from_secs(5));
    }
}
