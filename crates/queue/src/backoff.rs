//! Retry backoff schedule: exponential, jittered, capped.

use std::time::Duration;

use rand::Rng;

/// Base delay before the first retry.
const BASE: Duration = Duration::from_secs(1);
/// Hard ceiling on any scheduled delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Jitter factor: 0.5 means the delay lands in `[0.5x, 1.5x]`.
const JITTER: f64 = 0.5;

/// Delay before retry number `attempt` (1-indexed). Doubles per
/// attempt from [`BASE`], randomized by ±50 %, and never exceeds
/// [`MAX_BACKOFF`] — a queue item is always re-visible within a
/// minute of its failure.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let raw = BASE.saturating_mul(2_u32.saturating_pow(pow)).min(MAX_BACKOFF);

    let mut rng = rand::thread_rng();
    let factor = 1.0 - JITTER + rng.r#gen::<f64>() * 2.0 * JITTER;
    let jittered = Duration::from_millis((raw.as_millis() as f64 * factor).round() as u64);
    jittered.min(MAX_BACKOFF)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_the_ceiling() {
        for attempt in 1..=20 {
            for _ in 0..50 {
                assert!(backoff_for_attempt(attempt) <= MAX_BACKOFF);
            }
        }
    }

    #[test]
    fn backoff_stays_within_jitter_band() {
        for _ in 0..50 {
            let first = backoff_for_attempt(1);
            assert!(first >= Duration::from_millis(500), "{first:?} below band");
            assert!(first <= Duration::from_millis(1500), "{first:?} above band");

            let third = backoff_for_attempt(3); // nominal 4s
            assert!(third >= Duration::from_secs(2), "{third:?} below band");
            assert!(third <= Duration::from_secs(6), "{third:?} above band");
        }
    }

    #[test]
    fn late_attempts_saturate_at_the_ceiling_band() {
        for _ in 0..50 {
            // Nominal 2^9 = 512s, capped to 60s before jitter.
            let late = backoff_for_attempt(10);
            assert!(late >= Duration::from_secs(30));
            assert!(late <= MAX_BACKOFF);
        }
    }
}
