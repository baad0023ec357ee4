//! Timestamp arithmetic shared by the state machine and the loops.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `at + duration`, saturating at the largest representable instant.
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
