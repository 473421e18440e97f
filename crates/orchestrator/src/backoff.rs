//! Retry backoff schedule.
//!
//! `delay = min(base * multiplier^retry_count, max)` plus additive
//! jitter of up to 10%. Jitter only ever lengthens the delay, so the
//! k-th retry is never scheduled earlier than the deterministic floor;
//! it spreads out simultaneous retries so a failing phase does not
//! hammer the engine with a thundering herd.

use std::time::Duration;

use rand::Rng;

const JITTER_RATIO: f64 = 0.10;

/// Deterministic floor of the backoff schedule.
pub fn backoff_floor_ms(base_ms: u64, max_ms: u64, retry_count: u32, multiplier: u64) -> u64 {
    let factor = multiplier.saturating_pow(retry_count);
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Delay before the next retry attempt, jitter included.
pub fn backoff_delay(base_ms: u64, max_ms: u64, retry_count: u32, multiplier: u64) -> Duration {
    let floor = backoff_floor_ms(base_ms, max_ms, retry_count, multiplier);
    let jitter_cap = (floor as f64 * JITTER_RATIO) as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    Duration::from_millis(floor.saturating_add(jitter))
}
