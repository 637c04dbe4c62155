//! DTN epoch time helpers.
//!
//! Bundle timestamps count from the DTN epoch, 2000-01-01T00:00:00Z.

use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Seconds between the Unix epoch and the DTN epoch.
pub const DTN_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Current time as seconds since the DTN epoch.
pub fn now_dtn_secs() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(DTN_EPOCH_UNIX_SECS)
}

/// Current time as seconds since the Unix epoch.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render a DTN-epoch second count for log and report output.
pub fn dtn_secs_to_display(dtn_secs: u64) -> String {
    let unix = (dtn_secs + DTN_EPOCH_UNIX_SECS) as i64;
    match OffsetDateTime::from_unix_timestamp(unix) {
        Ok(ts) => ts.format(&Rfc3339).unwrap_or_else(|_| dtn_secs.to_string()),
        Err(_) => dtn_secs.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_offset() {
        // 2000-01-01T00:00:00Z in Unix seconds
        assert_eq!(DTN_EPOCH_UNIX_SECS, 946_684_800);
        assert_eq!(dtn_secs_to_display(0), "2000-01-01T00:00:00Z");
    }

    #[test]
    fn now_is_after_the_epoch() {
        assert!(now_unix_secs() > DTN_EPOCH_UNIX_SECS);
        assert!(now_dtn_secs() > 0);
    }
}
