// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The append-only item record log, time-sharded by day.
//!
//! Records are write-once: appended in the same transaction as the balance
//! mutation they document, then only ever read. Queries fan out across the
//! shards overlapping the requested range, merge reverse-chronologically,
//! and paginate after the merge. Tenants sharing an `app_key` share shards,
//! so every lookup is tenant-scoped.

use std::str::FromStr;

use rusqlite::{OptionalExtension, params};
use tally_core::time::{format_iso, parse_iso};
use tally_core::types::{ItemRecord, RecordFilter, RecordKind};

use crate::shard::{self, ShardKind};

/// Fields of a record not assigned by the log itself (id comes from the
/// shard's auto-increment, the shard name from the router).
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub tenant: &'a str,
    pub app_key: &'a str,
    pub player_id: &'a str,
    pub item_id: &'a str,
    pub amount_delta: i64,
    pub kind: RecordKind,
    pub balance_after: i64,
    pub idempotency_key: Option<&'a str>,
    pub remark: Option<&'a str>,
    pub created_at: &'a str,
}

fn map_kind(idx: usize, s: String) -> rusqlite::Result<RecordKind> {
    RecordKind::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_record(shard: &str, row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        shard: shard.to_string(),
        tenant: row.get(1)?,
        app_key: row.get(2)?,
        player_id: row.get(3)?,
        item_id: row.get(4)?,
        amount_delta: row.get(5)?,
        kind: map_kind(6, row.get::<_, String>(6)?)?,
        balance_after: row.get(7)?,
        idempotency_key: row.get(8)?,
        remark: row.get(9)?,
        created_at: row.get(10)?,
    })
}

const RECORD_COLUMNS: &str = "id, tenant, app_key, player_id, item_id, amount_delta, kind,
                              balance_after, idempotency_key, remark, created_at";

/// Append a record to `shard`, assigning its id. Must run inside the same
/// transaction as the balance mutation it documents.
pub fn append(
    conn: &rusqlite::Connection,
    shard: &str,
    new: &NewRecord<'_>,
) -> rusqlite::Result<ItemRecord> {
    conn.execute(
        &format!(
            "INSERT INTO {shard} (tenant, app_key, player_id, item_id, amount_delta, kind,
                                  balance_after, idempotency_key, remark, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            new.tenant,
            new.app_key,
            new.player_id,
            new.item_id,
            new.amount_delta,
            new.kind.to_string(),
            new.balance_after,
            new.idempotency_key,
            new.remark,
            new.created_at,
        ],
    )?;
    Ok(ItemRecord {
        id: conn.last_insert_rowid(),
        shard: shard.to_string(),
        tenant: new.tenant.to_string(),
        app_key: new.app_key.to_string(),
        player_id: new.player_id.to_string(),
        item_id: new.item_id.to_string(),
        amount_delta: new.amount_delta,
        kind: new.kind,
        balance_after: new.balance_after,
        idempotency_key: new.idempotency_key.map(str::to_string),
        remark: new.remark.map(str::to_string),
        created_at: new.created_at.to_string(),
    })
}

/// Find a prior committed record carrying this idempotency key, scoped to
/// (tenant, player, item). Scans existing record shards newest-first;
/// retries are near the original in time, so the scan usually hits in the
/// first shard.
pub fn find_by_idempotency_key(
    conn: &rusqlite::Connection,
    app_key: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
    idempotency_key: &str,
) -> rusqlite::Result<Option<ItemRecord>> {
    let shards = shard::list_shards(conn, app_key, ShardKind::Records)?;
    for s in &shards {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {s}
             WHERE tenant = ?1 AND player_id = ?2 AND item_id = ?3 AND idempotency_key = ?4"
        ))?;
        let found = stmt
            .query_row(params![tenant, player_id, item_id, idempotency_key], |row| {
                row_to_record(s, row)
            })
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Query the record log across all shards overlapping the filter's time
/// range, scoped to one tenant. Results merge newest-first; `page` is
/// 1-based and pagination applies after the merge, not per shard. Returns
/// the page plus the total match count.
pub fn query(
    conn: &rusqlite::Connection,
    app_key: &str,
    tenant: &str,
    filter: &RecordFilter,
    page: u32,
    page_size: u32,
) -> rusqlite::Result<(Vec<ItemRecord>, u64)> {
    // Canonicalize the bounds once: the row filter compares `created_at`
    // lexicographically, so an offset-form or reduced-precision RFC 3339
    // bound must be rewritten into the persisted format first.
    let from = filter.from.as_deref().and_then(parse_iso);
    let to = filter.to.as_deref().and_then(parse_iso);
    let from_canon = from.map(format_iso);
    let to_canon = to.map(format_iso);
    let shards = shard::record_shards_in_range(conn, app_key, from, to)?;

    let kind = filter.kind.map(|k| k.to_string());
    let mut matches: Vec<ItemRecord> = Vec::new();
    for s in &shards {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {s}
             WHERE tenant = ?1
               AND (?2 IS NULL OR player_id = ?2)
               AND (?3 IS NULL OR item_id = ?3)
               AND (?4 IS NULL OR kind = ?4)
               AND (?5 IS NULL OR created_at >= ?5)
               AND (?6 IS NULL OR created_at <= ?6)"
        ))?;
        let rows = stmt.query_map(
            params![
                tenant,
                filter.player_id.as_deref(),
                filter.item_id.as_deref(),
                kind.as_deref(),
                from_canon.as_deref(),
                to_canon.as_deref(),
            ],
            |row| row_to_record(s, row),
        )?;
        for row in rows {
            matches.push(row?);
        }
    }

    // Reverse chronological; id breaks ties within one shard.
    matches.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });

    let total = matches.len() as u64;
    let start = (page.saturating_sub(1) as usize).saturating_mul(page_size as usize);
    let records = if start >= matches.len() {
        Vec::new()
    } else {
        matches
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect()
    };
    Ok((records, total))
}
