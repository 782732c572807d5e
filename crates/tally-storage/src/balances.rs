// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Balance-row access across monthly balance shards.
//!
//! A (tenant, player, item) triple has at most one balance row
//! workspace-wide: the row is created in the month shard current at first
//! grant and updated in place afterwards, so lookups scan existing shards
//! newest-first and stop at the first hit. Two tenants may share an
//! `app_key` (and hence a shard), so every lookup and mutation is scoped by
//! tenant. Rows are never deleted; amount can reach zero.

use rusqlite::{OptionalExtension, params};

use crate::shard::{self, ShardKind};

/// One player's balance of one item, tagged with the shard it lives in.
#[derive(Debug, Clone)]
pub struct BalanceRow {
    pub shard: String,
    pub tenant: String,
    pub app_key: String,
    pub player_id: String,
    pub item_id: String,
    pub amount: i64,
    /// Lifetime sum of grants, maintained under the same row lock as
    /// `amount`; source for the player-total-limit check.
    pub total_granted: i64,
    pub obtained_at: String,
    pub expires_at: Option<String>,
    pub last_idempotency_key: Option<String>,
    pub updated_at: String,
}

fn select_in_shard(
    conn: &rusqlite::Connection,
    shard: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
) -> rusqlite::Result<Option<BalanceRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT tenant, app_key, player_id, item_id, amount, total_granted,
                obtained_at, expires_at, last_idempotency_key, updated_at
         FROM {shard} WHERE tenant = ?1 AND player_id = ?2 AND item_id = ?3"
    ))?;
    stmt.query_row(params![tenant, player_id, item_id], |row| {
        Ok(BalanceRow {
            shard: shard.to_string(),
            tenant: row.get(0)?,
            app_key: row.get(1)?,
            player_id: row.get(2)?,
            item_id: row.get(3)?,
            amount: row.get(4)?,
            total_granted: row.get(5)?,
            obtained_at: row.get(6)?,
            expires_at: row.get(7)?,
            last_idempotency_key: row.get(8)?,
            updated_at: row.get(9)?,
        })
    })
    .optional()
}

/// Locate the balance row for (tenant, player, item), scanning existing
/// balance shards newest-first. `shard_hint` pins the search to one shard
/// (the consume-side row selector); a hint naming a shard that was never
/// created yields `None`, not an error.
pub fn find_balance(
    conn: &rusqlite::Connection,
    app_key: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
    shard_hint: Option<&str>,
) -> rusqlite::Result<Option<BalanceRow>> {
    let shards = match shard_hint {
        Some(hint) => shard::filter_existing(conn, std::slice::from_ref(&hint.to_string()))?,
        None => shard::list_shards(conn, app_key, ShardKind::Balances)?,
    };
    for s in &shards {
        if let Some(row) = select_in_shard(conn, s, tenant, player_id, item_id)? {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

/// Insert a fresh balance row (first grant for this tenant/player/item).
#[allow(clippy::too_many_arguments)]
pub fn insert_balance(
    conn: &rusqlite::Connection,
    shard: &str,
    tenant: &str,
    app_key: &str,
    player_id: &str,
    item_id: &str,
    amount: i64,
    expires_at: Option<&str>,
    idempotency_key: &str,
    now_iso: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {shard} (tenant, app_key, player_id, item_id, amount, total_granted,
                                  obtained_at, expires_at, last_idempotency_key, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8, ?6)"
        ),
        params![tenant, app_key, player_id, item_id, amount, now_iso, expires_at, idempotency_key],
    )?;
    Ok(())
}

/// Apply a new amount / grant total / expiry to an existing row.
#[allow(clippy::too_many_arguments)]
pub fn update_balance(
    conn: &rusqlite::Connection,
    shard: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
    amount: i64,
    total_granted: i64,
    expires_at: Option<&str>,
    idempotency_key: Option<&str>,
    now_iso: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "UPDATE {shard}
             SET amount = ?4, total_granted = ?5, expires_at = ?6,
                 last_idempotency_key = COALESCE(?7, last_idempotency_key),
                 updated_at = ?8
             WHERE tenant = ?1 AND player_id = ?2 AND item_id = ?3"
        ),
        params![
            tenant,
            player_id,
            item_id,
            amount,
            total_granted,
            expires_at,
            idempotency_key,
            now_iso
        ],
    )?;
    Ok(())
}

/// Zero out an expired holding, leaving `total_granted` and expiry intact
/// for audit. Returns the amount that was forfeited.
pub fn zero_out(
    conn: &rusqlite::Connection,
    shard: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
    now_iso: &str,
) -> rusqlite::Result<i64> {
    let prior: i64 = conn.query_row(
        &format!(
            "SELECT amount FROM {shard}
             WHERE tenant = ?1 AND player_id = ?2 AND item_id = ?3"
        ),
        params![tenant, player_id, item_id],
        |row| row.get(0),
    )?;
    conn.execute(
        &format!(
            "UPDATE {shard} SET amount = 0, updated_at = ?4
             WHERE tenant = ?1 AND player_id = ?2 AND item_id = ?3"
        ),
        params![tenant, player_id, item_id, now_iso],
    )?;
    Ok(prior)
}

/// All balance rows for a (tenant, player) across existing shards,
/// optionally filtered to one item. Newest shard first, then insertion
/// order.
pub fn list_for_player(
    conn: &rusqlite::Connection,
    app_key: &str,
    tenant: &str,
    player_id: &str,
    item_id: Option<&str>,
) -> rusqlite::Result<Vec<BalanceRow>> {
    let shards = shard::list_shards(conn, app_key, ShardKind::Balances)?;
    let mut out = Vec::new();
    for s in &shards {
        let mut stmt = conn.prepare(&format!(
            "SELECT tenant, app_key, player_id, item_id, amount, total_granted,
                    obtained_at, expires_at, last_idempotency_key, updated_at
             FROM {s}
             WHERE tenant = ?1 AND player_id = ?2 AND (?3 IS NULL OR item_id = ?3)
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![tenant, player_id, item_id], |row| {
            Ok(BalanceRow {
                shard: s.clone(),
                tenant: row.get(0)?,
                app_key: row.get(1)?,
                player_id: row.get(2)?,
                item_id: row.get(3)?,
                amount: row.get(4)?,
                total_granted: row.get(5)?,
                obtained_at: row.get(6)?,
                expires_at: row.get(7)?,
                last_idempotency_key: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}
