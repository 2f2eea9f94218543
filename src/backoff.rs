//! Retry backoff schedule.
//!
//! Delays grow exponentially with the attempt count, carry a randomized
//! jitter so queued retries do not stampede the transport together, and
//! are capped at a configured maximum. The jitter range is chosen so the
//! schedule stays non-decreasing across successive attempts: attempt `k`
//! can reach at most 1.5× its raw delay, while attempt `k+1` starts at
//! 2× the same raw delay.

use rand::Rng;

/// Compute the delay before retry number `attempts` (1-based), in seconds.
///
/// Raw delay is `base_secs * 2^(attempts-1)`; jitter adds a uniform draw
/// from `[0, raw/2]`; the sum is capped at `max_secs`.
pub fn backoff_secs(attempts: u32, base_secs: u64, max_secs: u64) -> u64 {
    let exponent = attempts.saturating_sub(1).min(63);
    let raw = base_secs.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    if raw >= max_secs {
        return max_secs;
    }
    let jitter_ceiling = raw.saturating_div(2);
    let jitter = if jitter_ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ceiling)
    };
    raw.saturating_add(jitter).min(max_secs)
}
