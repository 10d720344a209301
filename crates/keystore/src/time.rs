//! Timestamp and quota-period helpers
//!
//! All timestamps are RFC 3339 UTC strings; quota periods are UTC
//! calendar months (`YYYY-MM`). String ordering matches chronological
//! ordering for both, which the log query filters rely on.

use chrono::{Duration, SecondsFormat, Utc};

/// Current time as an RFC 3339 UTC string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current quota period as `YYYY-MM` in UTC.
pub fn current_period() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// RFC 3339 UTC string for `days` days before now. Used for log retention.
pub fn days_ago_iso(days: i64) -> String {
    (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_year_dash_month() {
        let period = current_period();
        assert_eq!(period.len(), 7);
        assert_eq!(&period[4..5], "-");
        let year: u32 = period[..4].parse().unwrap();
        let month: u32 = period[5..].parse().unwrap();
        assert!(year >= 2024);
        assert!((1..=12).contains(&month));
    }

    #[test]
    fn days_ago_sorts_before_now() {
        assert!(days_ago_iso(30) < now_iso());
    }

    #[test]
    fn now_iso_is_utc_rfc3339() {
        let now = now_iso();
        assert!(now.ends_with('Z'), "expected UTC zulu suffix, got {now}");
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
