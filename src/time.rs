/*!
 * Process Clock
 *
 * Expiry deadlines are absolute millisecond timestamps on a monotonic
 * clock that starts with the process. Store operations take `now` as an
 * argument so expiry stays a plain comparison and tests can drive time.
 */

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Returns current monotonic time in milliseconds since process start.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Converts a relative TTL into an absolute deadline.
#[inline]
pub fn deadline_after(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}
