// =============================================================================
// Reconnect backoff — exponential with cap and full jitter
// =============================================================================

use std::time::Duration;

use rand::Rng;

/// Upper bound for attempt `n`: `base * 2^n`, capped at `cap_ms`.
pub fn backoff_ceiling_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX));
    exp.min(cap_ms).max(1)
}

/// Full-jitter delay for attempt `n`: uniform in `[0, ceiling]`.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let ceiling = backoff_ceiling_ms(attempt, base_ms, cap_ms);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        assert_eq!(backoff_ceiling_ms(0, 500, 30_000), 500);
        assert_eq!(backoff_ceiling_ms(1, 500, 30_000), 1_000);
        assert_eq!(backoff_ceiling_ms(2, 500, 30_000), 2_000);
        assert_eq!(backoff_ceiling_ms(6, 500, 30_000), 30_000);
        assert_eq!(backoff_ceiling_ms(63, 500, 30_000), 30_000);
    }

    #[test]
    fn ceiling_never_zero() {
        assert_eq!(backoff_ceiling_ms(0, 0, 30_000), 1);
    }

    #[test]
    fn delay_stays_within_ceiling() {
        for attempt in 0..10 {
            for _ in 0..50 {
                let d = backoff_delay(attempt, 500, 30_000);
                assert!(d.as_millis() as u64 <= backoff_ceiling_ms(attempt, 500, 30_000));
            }
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = backoff_delay(u32::MAX, 500, 30_000);
        assert!(d.as_millis() as u64 <= 30_000);
    }
}
