//! ID and timestamp utilities for hilloop
//!
//! Run ids name bundle directories and appear in `RUN_START`/`RUN_END` markers,
//! so they must be unique per attempt and contain no whitespace.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

/// Format a timestamp the way artifacts record it (RFC 3339, millisecond precision).
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Generate a unique run ID
///
/// Format: `run_{YYYYmmddTHHMMSSZ}_{random_hex}`
/// Example: `run_20261019T101500Z_a1b2c3`
pub fn generate_run_id() -> String {
    let now = Utc::now().format("%Y%m%dT%H%M%SZ");
    let random: u32 = rand::rng().random_range(0..0x0100_0000);
    format!("run_{}_{:06x}", now, random)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_run_id_format() {
        let id = generate_run_id();
        assert!(id.starts_with("run_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 16);
        assert!(parts[1].ends_with('Z'));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!id.contains(char::is_whitespace));
    }

    #[test]
    fn test_generate_run_id_unique() {
        let ids: std::collections::HashSet<String> = (0..50).map(|_| generate_run_id()).collect();
        assert!(ids.len() > 45);
    }

    #[test]
    fn test_format_ts_millis() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_ts(&ts), "2026-01-02T03:04:05.000Z");
    }
}
