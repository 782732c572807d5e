// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Tally item ledger.
//!
//! Business-rule failures carry the numeric context (current / attempted /
//! limit) a caller needs to render a useful message. Only `Storage` is an
//! infrastructure error; everything else aborts the transaction cleanly and
//! is safe to retry after the caller fixes the request.

use thiserror::Error;

/// The primary error type used across the Tally workspace.
#[derive(Debug, Error)]
pub enum TallyError {
    /// Configuration errors (invalid TOML, missing required fields, type mismatches).
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed request rejected before touching storage (bad amount,
    /// empty identifier, app key failing the allow-list pattern).
    #[error("validation error: {0}")]
    Validation(String),

    /// The owning application is administratively disabled.
    #[error("application {tenant}/{app_key} is disabled")]
    AppDisabled { tenant: String, app_key: String },

    /// Item template missing, inactive, or not in NORMAL lifecycle status.
    #[error("item template {item_id} is invalid: {reason}")]
    TemplateInvalid { item_id: String, reason: String },

    /// Item template's absolute expire date has passed.
    #[error("item template {item_id} has expired")]
    TemplateExpired { item_id: String },

    /// The player's holding of this item expired before the operation.
    #[error("item {item_id} has expired")]
    ItemExpired { item_id: String },

    /// Grant would push the player's balance past the per-player holding cap.
    #[error("holding cap exceeded: current {current} + attempted {attempted} > cap {cap}")]
    HoldingCapExceeded {
        current: i64,
        attempted: i64,
        cap: i64,
    },

    /// Daily grant quota for this item is exhausted.
    #[error("daily limit exceeded: granted {granted} + attempted {attempted} > limit {limit}")]
    DailyLimitExceeded {
        granted: i64,
        attempted: i64,
        limit: i64,
    },

    /// Global total grant quota for this item is exhausted.
    #[error(
        "global total limit exceeded: granted {granted} + attempted {attempted} > limit {limit}"
    )]
    GlobalTotalLimitExceeded {
        granted: i64,
        attempted: i64,
        limit: i64,
    },

    /// This player's lifetime grant total for the item is exhausted.
    #[error(
        "player total limit exceeded: granted {granted} + attempted {attempted} > limit {limit}"
    )]
    PlayerTotalLimitExceeded {
        granted: i64,
        attempted: i64,
        limit: i64,
    },

    /// The player holds no balance row for this item.
    #[error("player {player_id} has no holding of item {item_id}")]
    NoSuchHolding { player_id: String, item_id: String },

    /// Consume amount exceeds the current balance.
    #[error("insufficient balance: current {current}, attempted {attempted}")]
    InsufficientBalance { current: i64, attempted: i64 },

    /// Storage backend errors (database connection, query failure, shard creation).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether this is a business-rule failure (typed result, clean abort)
    /// as opposed to an infrastructure failure the caller should retry.
    pub fn is_business(&self) -> bool {
        !matches!(
            self,
            TallyError::Storage { .. } | TallyError::Internal(_) | TallyError::Config(_)
        )
    }
}
