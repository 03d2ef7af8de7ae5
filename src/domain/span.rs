//! Conversions from configured second counts to chrono arithmetic.
//!
//! Config documents carry spans as `u64` seconds; chrono works in `i64` and
//! panics when a subtraction leaves its range, so every conversion goes
//! through here.

use chrono::{DateTime, Duration, Utc};

/// Largest span a config document may carry (ten years)
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 3_600;

/// Seconds as a chrono duration, None when it does not fit
pub fn span(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Seconds as a comparable `i64`, saturating instead of wrapping
pub fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// `now - secs`, None when the result falls outside chrono's range
pub fn before(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    span(secs).and_then(|d| now.checked_sub_signed(d))
}
