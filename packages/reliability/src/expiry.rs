use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `now + ttl`, saturating at the latest representable instant.
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
