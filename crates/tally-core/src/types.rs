// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain types shared across the Tally workspace.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kind of a balance-affecting event in the item record log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    Grant,
    Consume,
    Expire,
}

/// Lifecycle status of an item template, owned by the template registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Normal,
    Expired,
    PendingDelete,
    Deleted,
}

/// Immutable-during-the-operation policy data for one item template.
///
/// Read from the [`TemplateRegistry`](crate::traits::TemplateRegistry); the
/// ledger never writes these fields except via the best-effort
/// `mark_expired` write-back. All limits are `None` = unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTemplatePolicy {
    pub item_id: String,
    pub is_active: bool,
    pub lifecycle_status: LifecycleStatus,
    /// Relative expiry in hours, applied from the moment of grant.
    pub expire_duration_hours: Option<f64>,
    /// Absolute expiry timestamp (ISO 8601 UTC).
    pub expire_date: Option<String>,
    /// Maximum balance one player may hold.
    pub holding_cap: Option<i64>,
    /// Maximum amount grantable per calendar day across all players.
    pub daily_limit: Option<i64>,
    /// Maximum amount one player may ever be granted.
    pub player_total_limit: Option<i64>,
    /// Maximum amount grantable ever, across all players.
    pub global_total_limit: Option<i64>,
}

impl ItemTemplatePolicy {
    /// A policy with no limits and no expiry, useful as a base.
    pub fn unrestricted(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            is_active: true,
            lifecycle_status: LifecycleStatus::Normal,
            expire_duration_hours: None,
            expire_date: None,
            holding_cap: None,
            daily_limit: None,
            player_total_limit: None,
            global_total_limit: None,
        }
    }
}

/// One immutable entry in the append-only item record log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Auto-increment id, scoped to the shard the record lives in.
    pub id: i64,
    /// Name of the record shard holding this entry.
    pub shard: String,
    pub tenant: String,
    pub app_key: String,
    pub player_id: String,
    pub item_id: String,
    /// Positive for grants, negative for consume/expire.
    pub amount_delta: i64,
    pub kind: RecordKind,
    /// Balance of the (player, item) pair after this event applied.
    pub balance_after: i64,
    /// Caller-supplied replay-detection token. Unique per
    /// (tenant, player, item) scope within a shard.
    pub idempotency_key: Option<String>,
    /// Free-text note supplied by the caller.
    pub remark: Option<String>,
    pub created_at: String,
}

/// Read model for one player's holding of one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceView {
    pub tenant: String,
    pub app_key: String,
    pub player_id: String,
    pub item_id: String,
    pub amount: i64,
    /// Lifetime sum of grants to this player for this item.
    pub total_granted: i64,
    pub obtained_at: String,
    pub expires_at: Option<String>,
    /// False once the holding is expired or empty.
    pub usable: bool,
}

/// Result of a committed grant or consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerOutcome {
    pub balance_after: i64,
    pub record: ItemRecord,
    /// True when this outcome was replayed from a prior committed record
    /// carrying the same idempotency key, with no new mutation.
    pub replayed: bool,
}

/// Filters for record-log queries. All fields optional; `from`/`to` are
/// inclusive ISO 8601 bounds on `created_at`.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub player_id: Option<String>,
    pub item_id: Option<String>,
    pub kind: Option<RecordKind>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// One page of a fanned-out record query, with the total match count
/// across all shards in range.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<ItemRecord>,
    pub total: u64,
}
