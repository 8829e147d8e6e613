//! Throttle window computation for rate-limit backpressure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

/// Computes when a throttled installation may resume.
///
/// The window ends at `max(reset_hint, now + cooldown)` plus a random jitter
/// in `[0, jitter_max]` to spread resumption across installations, and is
/// capped at `now + max_backoff` so a bogus reset timestamp cannot park an
/// installation indefinitely.
pub fn throttle_until(
    reset_hint: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
    jitter_max: Duration,
    max_backoff: Duration,
) -> DateTime<Utc> {
    let cooldown = ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::seconds(60));
    let floor = now + cooldown;
    let base = match reset_hint {
        Some(reset) if reset > floor => reset,
        _ => floor,
    };

    let jitter_secs = jitter_max.as_secs();
    let jitter = if jitter_secs == 0 {
        ChronoDuration::zero()
    } else {
        ChronoDuration::seconds(rand::thread_rng().gen_range(0..=jitter_secs) as i64)
    };

    let cap = now + ChronoDuration::from_std(max_backoff).unwrap_or(ChronoDuration::seconds(120));
    (base + jitter).min(cap)
}
