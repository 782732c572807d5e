// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timestamp helpers.
//!
//! All persisted timestamps are ISO 8601 UTC with millisecond precision
//! (`2026-03-01T10:00:00.000Z`). The format sorts lexicographically, which
//! the record-log merge and range filters rely on.

use chrono::{DateTime, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp in the canonical persisted form.
pub fn format_iso(at: DateTime<Utc>) -> String {
    at.format(ISO_FORMAT).to_string()
}

/// Current time in the canonical persisted form.
pub fn now_iso() -> String {
    format_iso(Utc::now())
}

/// Parse a canonical timestamp back into a `DateTime<Utc>`.
///
/// Accepts any RFC 3339 input, not only the exact persisted format, so
/// caller-supplied `expire_date` values with other precisions still parse.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether an ISO timestamp lies strictly in the past relative to `now`.
pub fn is_past(s: &str, now: DateTime<Utc>) -> bool {
    parse_iso(s).is_some_and(|dt| dt < now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_and_parse_round_trip() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let s = format_iso(dt);
        assert_eq!(s, "2026-03-01T10:00:00.000Z");
        assert_eq!(parse_iso(&s).unwrap(), dt);
    }

    #[test]
    fn iso_format_sorts_lexicographically() {
        let earlier = format_iso(Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap());
        let later = format_iso(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn is_past_compares_against_given_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(is_past("2026-03-01T11:59:59.000Z", now));
        assert!(!is_past("2026-03-01T12:00:01.000Z", now));
        assert!(!is_past("not a timestamp", now));
    }
}
