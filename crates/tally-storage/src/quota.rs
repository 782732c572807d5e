// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quota counter store: atomically reserved, ceiling-bounded accumulators.
//!
//! One row per (tenant, item, period key). `try_reserve` is a single
//! conditional UPDATE, never a read-then-write pair, so concurrent grants
//! against the same counter can never overshoot the ceiling. Counters only
//! ever grow; consumption does not give quota back.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tally_core::time::format_iso;

/// Period key for the global, non-expiring counter.
pub const TOTAL_PERIOD: &str = "total";

/// Period key for the calendar day containing `at`, e.g. `2026-03-01`.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Result of a reservation attempt, carrying the counter state observed at
/// decision time so callers can build quota errors with full context.
#[derive(Debug, Clone, Copy)]
pub struct ReserveOutcome {
    /// Whether the reservation was applied.
    pub ok: bool,
    /// `granted` before this reservation.
    pub granted: i64,
    /// Counter ceiling (`None` = unlimited).
    pub limit: Option<i64>,
}

/// Reserve `amount` against the (tenant, item, period) counter in
/// `quota_table`.
///
/// The counter row is created on first use and its ceiling refreshed from
/// the template's current limit. The increment applies only if
/// `granted + amount <= limit` (or the limit is NULL); a failed reservation
/// leaves `granted` untouched. Must run inside the grant's transaction so
/// a later business failure rolls the increment back.
#[allow(clippy::too_many_arguments)]
pub fn try_reserve(
    conn: &rusqlite::Connection,
    quota_table: &str,
    tenant: &str,
    item_id: &str,
    period_key: &str,
    amount: i64,
    limit: Option<i64>,
    now: DateTime<Utc>,
) -> rusqlite::Result<ReserveOutcome> {
    let now_iso = format_iso(now);

    // Seed the row and keep the ceiling in sync with the template.
    conn.execute(
        &format!(
            "INSERT INTO {quota_table} (tenant, item_id, period_key, granted, limit_value, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT(tenant, item_id, period_key) DO UPDATE SET limit_value = excluded.limit_value"
        ),
        params![tenant, item_id, period_key, limit, now_iso],
    )?;

    // The reservation itself: one indivisible conditional increment.
    let changed = conn.execute(
        &format!(
            "UPDATE {quota_table}
             SET granted = granted + ?4, updated_at = ?5
             WHERE tenant = ?1 AND item_id = ?2 AND period_key = ?3
               AND (limit_value IS NULL OR granted + ?4 <= limit_value)"
        ),
        params![tenant, item_id, period_key, amount, now_iso],
    )?;

    let granted_now: i64 = conn.query_row(
        &format!(
            "SELECT granted FROM {quota_table}
             WHERE tenant = ?1 AND item_id = ?2 AND period_key = ?3"
        ),
        params![tenant, item_id, period_key],
        |row| row.get(0),
    )?;

    let ok = changed == 1;
    Ok(ReserveOutcome {
        ok,
        granted: if ok { granted_now - amount } else { granted_now },
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ensure_quota_shard;
    use chrono::TimeZone;

    fn setup() -> (rusqlite::Connection, String, DateTime<Utc>) {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::migrations::run_migrations(&mut conn).unwrap();
        let table = ensure_quota_shard(&conn, "demo").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        (conn, table, now)
    }

    #[test]
    fn reserve_within_limit_succeeds() {
        let (conn, table, now) = setup();
        let out =
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 30, Some(50), now).unwrap();
        assert!(out.ok);
        assert_eq!(out.granted, 0);
    }

    #[test]
    fn reserve_over_limit_fails_without_side_effect() {
        let (conn, table, now) = setup();
        assert!(
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 30, Some(50), now)
                .unwrap()
                .ok
        );

        let out =
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 25, Some(50), now).unwrap();
        assert!(!out.ok);
        assert_eq!(out.granted, 30, "failed reservation must not increment");

        // A smaller amount that fits still goes through.
        let out =
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 20, Some(50), now).unwrap();
        assert!(out.ok);
        assert_eq!(out.granted, 30);
    }

    #[test]
    fn null_limit_is_unlimited() {
        let (conn, table, now) = setup();
        let out =
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 1_000_000, None, now).unwrap();
        assert!(out.ok);
    }

    #[test]
    fn zero_limit_rejects_any_positive_amount() {
        let (conn, table, now) = setup();
        let out = try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 1, Some(0), now).unwrap();
        assert!(!out.ok);
        assert_eq!(out.granted, 0);
        assert_eq!(out.limit, Some(0));
    }

    #[test]
    fn periods_are_independent_counters() {
        let (conn, table, now) = setup();
        let day = day_key(now);
        assert!(try_reserve(&conn, &table, "t1", "itm", &day, 5, Some(5), now).unwrap().ok);
        // Daily exhausted, total untouched.
        assert!(!try_reserve(&conn, &table, "t1", "itm", &day, 1, Some(5), now).unwrap().ok);
        assert!(
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 5, Some(10), now)
                .unwrap()
                .ok
        );
    }

    #[test]
    fn tenants_have_independent_counters() {
        let (conn, table, now) = setup();
        assert!(
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 5, Some(5), now)
                .unwrap()
                .ok
        );
        assert!(
            !try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 1, Some(5), now)
                .unwrap()
                .ok
        );

        // Another tenant sharing the app (and hence the table) starts at zero.
        let out = try_reserve(&conn, &table, "t2", "itm", TOTAL_PERIOD, 5, Some(5), now).unwrap();
        assert!(out.ok);
        assert_eq!(out.granted, 0);
    }

    #[test]
    fn limit_refreshes_from_template() {
        let (conn, table, now) = setup();
        assert!(
            !try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 10, Some(5), now)
                .unwrap()
                .ok
        );
        // Template limit raised; the same reservation now fits.
        assert!(
            try_reserve(&conn, &table, "t1", "itm", TOTAL_PERIOD, 10, Some(20), now)
                .unwrap()
                .ok
        );
    }

    #[test]
    fn day_key_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap();
        assert_eq!(day_key(now), "2026-03-01");
    }
}
