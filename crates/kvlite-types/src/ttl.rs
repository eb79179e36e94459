//! TTL and deadline arithmetic
//!
//! Deadlines are absolute epoch milliseconds. `None` means the entry never
//! expires; on disk that is stored as [`NEVER_EXPIRES`].

use std::time::Duration;

/// Column value for entries without a deadline
pub const NEVER_EXPIRES: i64 = -1;

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a caller-supplied TTL in seconds into an absolute deadline.
///
/// Only a finite, strictly positive TTL produces a deadline. Missing, zero,
/// negative, `NaN` and infinite values all mean "never expires".
pub fn expiry_deadline(created_at: i64, ttl_seconds: Option<f64>) -> Option<i64> {
    let ttl = ttl_seconds?;
    if !ttl.is_finite() || ttl <= 0.0 {
        return None;
    }
    // `as` saturates, so absurdly large TTLs clamp instead of wrapping
    let millis = (ttl * 1000.0).ceil() as i64;
    Some(created_at.saturating_add(millis))
}

/// TTL in seconds for a [`Duration`], as accepted by [`expiry_deadline`]
pub fn ttl_seconds(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

/// Whether a deadline has passed at `now`
pub fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(deadline) if deadline < now)
}

/// Encode a deadline for the `expiredAt` column
pub fn to_column(expires_at: Option<i64>) -> i64 {
    expires_at.unwrap_or(NEVER_EXPIRES)
}

/// Decode an `expiredAt` column value
pub fn from_column(value: i64) -> Option<i64> {
    if value == NEVER_EXPIRES {
        None
    } else {
        Some(value)
    }
}
