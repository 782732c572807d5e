// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic shard routing.
//!
//! Shard names are pure functions of (app key, time bucket): balances are
//! bucketed monthly, records daily, quota counters per app. Routing needs
//! no lookup table; the `shard_catalog` table only answers "which shards
//! exist" for range queries and idempotency fan-out.
//!
//! App keys are interpolated into table names, so they are validated
//! against an allow-list pattern (`^[a-z0-9][a-z0-9_]{0,47}$`) before any
//! SQL is built. Shard creation is `CREATE TABLE IF NOT EXISTS` plus an
//! `INSERT OR IGNORE` into the catalog, safe to race.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tally_core::TallyError;

/// Table-name prefix for monthly balance shards.
pub const BALANCE_PREFIX: &str = "item_balances";
/// Table-name prefix for daily record-log shards.
pub const RECORD_PREFIX: &str = "item_records";
/// Table-name prefix for per-app quota counter tables.
pub const QUOTA_PREFIX: &str = "quota_counters";

/// Kind discriminator stored in `shard_catalog.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Balances,
    Records,
    Quota,
}

impl ShardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ShardKind::Balances => "balances",
            ShardKind::Records => "records",
            ShardKind::Quota => "quota",
        }
    }
}

/// Validate an app key against the allow-list pattern.
///
/// Keys become part of physical table names and must never carry anything
/// SQL-meaningful: lowercase alphanumerics and underscores, starting with
/// an alphanumeric, at most 48 characters.
pub fn validate_app_key(app_key: &str) -> Result<(), TallyError> {
    let mut chars = app_key.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_first || !valid_rest || app_key.len() > 48 {
        return Err(TallyError::Validation(format!(
            "app key {app_key:?} does not match [a-z0-9][a-z0-9_]{{0,47}}"
        )));
    }
    Ok(())
}

/// Monthly time bucket, e.g. `202603`.
pub fn month_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y%m").to_string()
}

/// Daily time bucket, e.g. `20260301`.
pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

/// Name of the balance shard for (app, timestamp).
pub fn balance_shard(app_key: &str, at: DateTime<Utc>) -> String {
    format!("{BALANCE_PREFIX}_{app_key}_{}", month_bucket(at))
}

/// Name of the record-log shard for (app, timestamp).
pub fn record_shard(app_key: &str, at: DateTime<Utc>) -> String {
    format!("{RECORD_PREFIX}_{app_key}_{}", day_bucket(at))
}

/// Name of the quota counter table for an app.
pub fn quota_shard(app_key: &str) -> String {
    format!("{QUOTA_PREFIX}_{app_key}")
}

fn catalog_insert(
    conn: &rusqlite::Connection,
    table_name: &str,
    kind: ShardKind,
    app_key: &str,
    time_bucket: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO shard_catalog (table_name, kind, app_key, time_bucket)
         VALUES (?1, ?2, ?3, ?4)",
        params![table_name, kind.as_str(), app_key, time_bucket],
    )?;
    Ok(())
}

/// Create the balance shard for (app, timestamp) if absent. Idempotent.
///
/// Returns the shard name. Runs inside the caller's transaction.
pub fn ensure_balance_shard(
    conn: &rusqlite::Connection,
    app_key: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let name = balance_shard(app_key, at);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            app_key TEXT NOT NULL,
            player_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0 CHECK (amount >= 0),
            total_granted INTEGER NOT NULL DEFAULT 0,
            obtained_at TEXT NOT NULL,
            expires_at TEXT,
            last_idempotency_key TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant, player_id, item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_{name}_player ON {name}(tenant, player_id);"
    ))?;
    catalog_insert(conn, &name, ShardKind::Balances, app_key, Some(&month_bucket(at)))?;
    Ok(name)
}

/// Create the record-log shard for (app, timestamp) if absent. Idempotent.
pub fn ensure_record_shard(
    conn: &rusqlite::Connection,
    app_key: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<String> {
    let name = record_shard(app_key, at);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            app_key TEXT NOT NULL,
            player_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            amount_delta INTEGER NOT NULL,
            kind TEXT NOT NULL,
            balance_after INTEGER NOT NULL,
            idempotency_key TEXT,
            remark TEXT,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_{name}_idem
            ON {name}(tenant, player_id, item_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_{name}_created ON {name}(created_at);"
    ))?;
    catalog_insert(conn, &name, ShardKind::Records, app_key, Some(&day_bucket(at)))?;
    Ok(name)
}

/// Create the quota counter table for an app if absent. Idempotent.
pub fn ensure_quota_shard(conn: &rusqlite::Connection, app_key: &str) -> rusqlite::Result<String> {
    let name = quota_shard(app_key);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            tenant TEXT NOT NULL,
            item_id TEXT NOT NULL,
            period_key TEXT NOT NULL,
            granted INTEGER NOT NULL DEFAULT 0,
            limit_value INTEGER,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant, item_id, period_key)
        );"
    ))?;
    catalog_insert(conn, &name, ShardKind::Quota, app_key, None)?;
    Ok(name)
}

/// List all existing shards of one kind for an app, newest bucket first.
pub fn list_shards(
    conn: &rusqlite::Connection,
    app_key: &str,
    kind: ShardKind,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM shard_catalog
         WHERE app_key = ?1 AND kind = ?2
         ORDER BY time_bucket DESC",
    )?;
    let rows = stmt.query_map(params![app_key, kind.as_str()], |row| row.get(0))?;
    rows.collect()
}

/// Filter a candidate shard list down to the shards that actually exist.
///
/// Querying a shard that was never created must contribute zero rows, not
/// fail, so range queries pass their candidates through here first.
pub fn filter_existing(
    conn: &rusqlite::Connection,
    candidates: &[String],
) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM shard_catalog WHERE table_name = ?1 LIMIT 1")?;
    let mut existing = Vec::new();
    for name in candidates {
        if stmt.exists(params![name])? {
            existing.push(name.clone());
        }
    }
    Ok(existing)
}

/// Existing record shards whose daily bucket overlaps [from, to], newest
/// first. `None` bounds are unbounded.
pub fn record_shards_in_range(
    conn: &rusqlite::Connection,
    app_key: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> rusqlite::Result<Vec<String>> {
    let from_bucket = from.map(day_bucket);
    let to_bucket = to.map(day_bucket);
    let mut stmt = conn.prepare(
        "SELECT table_name FROM shard_catalog
         WHERE app_key = ?1 AND kind = 'records'
           AND (?2 IS NULL OR time_bucket >= ?2)
           AND (?3 IS NULL OR time_bucket <= ?3)
         ORDER BY time_bucket DESC",
    )?;
    let rows = stmt.query_map(params![app_key, from_bucket, to_bucket], |row| row.get(0))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn test_conn() -> rusqlite::Connection {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::migrations::run_migrations(&mut conn).unwrap();
        conn
    }

    #[test]
    fn shard_names_are_deterministic() {
        let ts = at(2026, 3, 1);
        assert_eq!(balance_shard("demo", ts), "item_balances_demo_202603");
        assert_eq!(record_shard("demo", ts), "item_records_demo_20260301");
        assert_eq!(quota_shard("demo"), "quota_counters_demo");
    }

    #[test]
    fn app_key_allow_list() {
        assert!(validate_app_key("demo").is_ok());
        assert!(validate_app_key("shop_2").is_ok());
        assert!(validate_app_key("9lives").is_ok());

        assert!(validate_app_key("").is_err());
        assert!(validate_app_key("_leading").is_err());
        assert!(validate_app_key("UPPER").is_err());
        assert!(validate_app_key("bad-dash").is_err());
        assert!(validate_app_key("drop table; --").is_err());
        assert!(validate_app_key(&"a".repeat(49)).is_err());
    }

    proptest! {
        #[test]
        fn valid_keys_always_produce_single_identifier_names(
            key in "[a-z0-9][a-z0-9_]{0,47}"
        ) {
            prop_assert!(validate_app_key(&key).is_ok());
            let name = balance_shard(&key, at(2026, 3, 1));
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
    }

    #[test]
    fn ensure_is_idempotent_and_catalogued() {
        let conn = test_conn();
        let ts = at(2026, 3, 1);

        let first = ensure_balance_shard(&conn, "demo", ts).unwrap();
        let second = ensure_balance_shard(&conn, "demo", ts).unwrap();
        assert_eq!(first, second);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shard_catalog WHERE table_name = ?1",
                params![first],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "duplicate creation must not duplicate catalog rows");
    }

    #[test]
    fn list_shards_newest_first() {
        let conn = test_conn();
        ensure_record_shard(&conn, "demo", at(2026, 3, 1)).unwrap();
        ensure_record_shard(&conn, "demo", at(2026, 3, 3)).unwrap();
        ensure_record_shard(&conn, "demo", at(2026, 3, 2)).unwrap();

        let shards = list_shards(&conn, "demo", ShardKind::Records).unwrap();
        assert_eq!(
            shards,
            vec![
                "item_records_demo_20260303",
                "item_records_demo_20260302",
                "item_records_demo_20260301",
            ]
        );
    }

    #[test]
    fn filter_existing_drops_never_created_shards() {
        let conn = test_conn();
        ensure_record_shard(&conn, "demo", at(2026, 3, 1)).unwrap();

        let candidates = vec![
            "item_records_demo_20260301".to_string(),
            "item_records_demo_20260302".to_string(),
        ];
        let existing = filter_existing(&conn, &candidates).unwrap();
        assert_eq!(existing, vec!["item_records_demo_20260301"]);
    }

    #[test]
    fn record_shards_in_range_respects_bounds() {
        let conn = test_conn();
        for d in 1..=5 {
            ensure_record_shard(&conn, "demo", at(2026, 3, d)).unwrap();
        }

        let shards =
            record_shards_in_range(&conn, "demo", Some(at(2026, 3, 2)), Some(at(2026, 3, 4)))
                .unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0], "item_records_demo_20260304");

        let all = record_shards_in_range(&conn, "demo", None, None).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn shards_are_scoped_per_app() {
        let conn = test_conn();
        ensure_record_shard(&conn, "alpha", at(2026, 3, 1)).unwrap();
        ensure_record_shard(&conn, "beta", at(2026, 3, 1)).unwrap();

        let alpha = list_shards(&conn, "alpha", ShardKind::Records).unwrap();
        assert_eq!(alpha, vec!["item_records_alpha_20260301"]);
    }
}
