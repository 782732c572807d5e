// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The grant/consume engine.
//!
//! Each call runs as one short-lived SQLite transaction inside a single
//! `conn.call()` closure: idempotency lookup, policy evaluation, quota
//! reservation, balance mutation, and record append either all commit or
//! all roll back. Template policy and application state are fetched from
//! the registry before the transaction starts and treated as immutable for
//! its duration.
//!
//! Business failures abort the transaction cleanly and come back as typed
//! errors; the one deliberate exception is consume hitting an expired
//! holding, which commits the zero-out and EXPIRE record before failing
//! with `ItemExpired`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::TransactionBehavior;
use tracing::info;

use tally_config::QueryConfig;
use tally_core::time::{format_iso, is_past, parse_iso};
use tally_core::{
    ItemTemplatePolicy, LedgerOutcome, LifecycleStatus, RecordKind, TallyError, TemplateRegistry,
};
use tally_storage::records::NewRecord;
use tally_storage::{Database, balances, map_tr_err, quota, records, shard};

/// A grant request. `idempotency_key` is caller-supplied and guarantees a
/// retried request is not double-applied.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub tenant: String,
    pub app_key: String,
    pub player_id: String,
    pub item_id: String,
    pub amount: i64,
    pub note: Option<String>,
    pub idempotency_key: String,
}

/// A consume request. `shard` optionally pins the balance row to one
/// specific balance shard instead of scanning newest-first.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub tenant: String,
    pub app_key: String,
    pub player_id: String,
    pub item_id: String,
    pub amount: i64,
    pub note: Option<String>,
    pub idempotency_key: String,
    pub shard: Option<String>,
}

/// Outcome of a transaction body: what to do with the open transaction and
/// what to hand back to the caller.
pub(crate) enum TxVerdict {
    /// Commit and return success.
    Commit(LedgerOutcome),
    /// Commit the side effects written so far, then return the error.
    CommitFail(TallyError),
    /// Roll back everything and return the error.
    Abort(TallyError),
}

/// The item ledger engine.
pub struct ItemLedger {
    pub(crate) db: Database,
    pub(crate) registry: Arc<dyn TemplateRegistry>,
    pub(crate) query: QueryConfig,
}

impl ItemLedger {
    pub fn new(db: Database, registry: Arc<dyn TemplateRegistry>, query: QueryConfig) -> Self {
        Self { db, registry, query }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Grant `amount` of an item to a player.
    pub async fn grant(&self, req: GrantRequest) -> Result<LedgerOutcome, TallyError> {
        validate_request(&req.app_key, &req.tenant, &req.player_id, &req.item_id, req.amount, &req.idempotency_key)?;

        let enabled = self.registry.app_enabled(&req.tenant, &req.app_key).await?;
        let policy = self
            .registry
            .get_template(&req.tenant, &req.app_key, &req.item_id)
            .await?;
        let now = Utc::now();

        let (tenant, app_key, player_id, item_id) = (
            req.tenant.clone(),
            req.app_key.clone(),
            req.player_id.clone(),
            req.item_id.clone(),
        );

        let result = self
            .db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match grant_tx(&tx, &req, enabled, policy.as_ref(), now)? {
                    TxVerdict::Commit(outcome) => {
                        tx.commit()?;
                        Ok(Ok(outcome))
                    }
                    TxVerdict::CommitFail(err) => {
                        tx.commit()?;
                        Ok(Err(err))
                    }
                    TxVerdict::Abort(err) => {
                        tx.rollback()?;
                        Ok(Err(err))
                    }
                }
            })
            .await
            .map_err(map_tr_err)?;

        match result {
            Ok(outcome) => {
                info!(
                    tenant = %tenant,
                    app_key = %app_key,
                    player_id = %player_id,
                    item_id = %item_id,
                    delta = outcome.record.amount_delta,
                    balance_after = outcome.balance_after,
                    replayed = outcome.replayed,
                    "grant committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                if matches!(err, TallyError::TemplateExpired { .. }) {
                    self.spawn_mark_expired(&tenant, &app_key, &item_id);
                }
                Err(err)
            }
        }
    }

    /// Consume `amount` of an item from a player's holding.
    pub async fn consume(&self, req: ConsumeRequest) -> Result<LedgerOutcome, TallyError> {
        validate_request(&req.app_key, &req.tenant, &req.player_id, &req.item_id, req.amount, &req.idempotency_key)?;

        let policy = self
            .registry
            .get_template(&req.tenant, &req.app_key, &req.item_id)
            .await?;
        let now = Utc::now();

        let (tenant, app_key, player_id, item_id) = (
            req.tenant.clone(),
            req.app_key.clone(),
            req.player_id.clone(),
            req.item_id.clone(),
        );

        let result = self
            .db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match consume_tx(&tx, &req, policy.as_ref(), now)? {
                    TxVerdict::Commit(outcome) => {
                        tx.commit()?;
                        Ok(Ok(outcome))
                    }
                    TxVerdict::CommitFail(err) => {
                        tx.commit()?;
                        Ok(Err(err))
                    }
                    TxVerdict::Abort(err) => {
                        tx.rollback()?;
                        Ok(Err(err))
                    }
                }
            })
            .await
            .map_err(map_tr_err)?;

        match result {
            Ok(outcome) => {
                info!(
                    tenant = %tenant,
                    app_key = %app_key,
                    player_id = %player_id,
                    item_id = %item_id,
                    delta = outcome.record.amount_delta,
                    balance_after = outcome.balance_after,
                    replayed = outcome.replayed,
                    "consume committed"
                );
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }
}

fn validate_request(
    app_key: &str,
    tenant: &str,
    player_id: &str,
    item_id: &str,
    amount: i64,
    idempotency_key: &str,
) -> Result<(), TallyError> {
    shard::validate_app_key(app_key)?;
    if tenant.is_empty() || player_id.is_empty() || item_id.is_empty() {
        return Err(TallyError::Validation(
            "tenant, player_id, and item_id must be non-empty".to_string(),
        ));
    }
    if amount <= 0 {
        return Err(TallyError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    if idempotency_key.is_empty() {
        return Err(TallyError::Validation(
            "idempotency_key must be non-empty".to_string(),
        ));
    }
    Ok(())
}

/// Compute the absolute expiry for a freshly granted lot: the earlier of
/// `now + expire_duration` and the template's absolute expire date.
fn compute_expires_at(policy: &ItemTemplatePolicy, now: DateTime<Utc>) -> Option<String> {
    let mut candidate: Option<DateTime<Utc>> = policy
        .expire_duration_hours
        .map(|hours| now + Duration::milliseconds((hours * 3_600_000.0).round() as i64));
    if let Some(date) = policy.expire_date.as_deref().and_then(parse_iso) {
        candidate = Some(match candidate {
            Some(c) => c.min(date),
            None => date,
        });
    }
    candidate.map(format_iso)
}

/// Merge a pre-existing row expiry with a newly computed one: earliest wins.
fn merge_expiry(existing: Option<&str>, new: Option<String>) -> Option<String> {
    match (existing, new) {
        (None, new) => new,
        (Some(e), None) => Some(e.to_string()),
        (Some(e), Some(n)) => {
            let keep_existing = match (parse_iso(e), parse_iso(&n)) {
                (Some(de), Some(dn)) => de <= dn,
                _ => e <= n.as_str(),
            };
            Some(if keep_existing { e.to_string() } else { n })
        }
    }
}

fn grant_tx(
    tx: &rusqlite::Transaction<'_>,
    req: &GrantRequest,
    enabled: bool,
    policy: Option<&ItemTemplatePolicy>,
    now: DateTime<Utc>,
) -> Result<TxVerdict, rusqlite::Error> {
    let now_iso = format_iso(now);
    let record_shard = shard::ensure_record_shard(tx, &req.app_key, now)?;

    // Replay detection comes before any validation: a retried request gets
    // the originally committed outcome verbatim.
    if let Some(prior) = records::find_by_idempotency_key(
        tx,
        &req.app_key,
        &req.tenant,
        &req.player_id,
        &req.item_id,
        &req.idempotency_key,
    )? {
        return Ok(TxVerdict::Commit(LedgerOutcome {
            balance_after: prior.balance_after,
            record: prior,
            replayed: true,
        }));
    }

    if !enabled {
        return Ok(TxVerdict::Abort(TallyError::AppDisabled {
            tenant: req.tenant.clone(),
            app_key: req.app_key.clone(),
        }));
    }

    let Some(policy) = policy else {
        return Ok(TxVerdict::Abort(TallyError::TemplateInvalid {
            item_id: req.item_id.clone(),
            reason: "template not found".to_string(),
        }));
    };
    if !policy.is_active {
        return Ok(TxVerdict::Abort(TallyError::TemplateInvalid {
            item_id: req.item_id.clone(),
            reason: "template inactive".to_string(),
        }));
    }
    if policy.lifecycle_status != LifecycleStatus::Normal {
        return Ok(TxVerdict::Abort(TallyError::TemplateInvalid {
            item_id: req.item_id.clone(),
            reason: format!("lifecycle status {}", policy.lifecycle_status),
        }));
    }
    if policy.expire_date.as_deref().is_some_and(|d| is_past(d, now)) {
        return Ok(TxVerdict::Abort(TallyError::TemplateExpired {
            item_id: req.item_id.clone(),
        }));
    }

    let existing = balances::find_balance(
        tx,
        &req.app_key,
        &req.tenant,
        &req.player_id,
        &req.item_id,
        None,
    )?;
    let current = existing.as_ref().map_or(0, |r| r.amount);
    let prior_granted = existing.as_ref().map_or(0, |r| r.total_granted);
    let (Some(new_amount), Some(new_total)) = (
        current.checked_add(req.amount),
        prior_granted.checked_add(req.amount),
    ) else {
        return Ok(TxVerdict::Abort(TallyError::Validation(format!(
            "amount {} overflows the balance accumulators",
            req.amount
        ))));
    };

    if let Some(cap) = policy.holding_cap {
        if new_amount > cap {
            return Ok(TxVerdict::Abort(TallyError::HoldingCapExceeded {
                current,
                attempted: req.amount,
                cap,
            }));
        }
    }

    let quota_table = shard::ensure_quota_shard(tx, &req.app_key)?;
    let daily = quota::try_reserve(
        tx,
        &quota_table,
        &req.tenant,
        &req.item_id,
        &quota::day_key(now),
        req.amount,
        policy.daily_limit,
        now,
    )?;
    if !daily.ok {
        return Ok(TxVerdict::Abort(TallyError::DailyLimitExceeded {
            granted: daily.granted,
            attempted: req.amount,
            limit: daily.limit.unwrap_or(0),
        }));
    }

    let total = quota::try_reserve(
        tx,
        &quota_table,
        &req.tenant,
        &req.item_id,
        quota::TOTAL_PERIOD,
        req.amount,
        policy.global_total_limit,
        now,
    )?;
    if !total.ok {
        return Ok(TxVerdict::Abort(TallyError::GlobalTotalLimitExceeded {
            granted: total.granted,
            attempted: req.amount,
            limit: total.limit.unwrap_or(0),
        }));
    }

    if let Some(limit) = policy.player_total_limit {
        if new_total > limit {
            return Ok(TxVerdict::Abort(TallyError::PlayerTotalLimitExceeded {
                granted: prior_granted,
                attempted: req.amount,
                limit,
            }));
        }
    }

    let new_expiry = merge_expiry(
        existing.as_ref().and_then(|r| r.expires_at.as_deref()),
        compute_expires_at(policy, now),
    );

    match &existing {
        Some(row) => {
            balances::update_balance(
                tx,
                &row.shard,
                &req.tenant,
                &req.player_id,
                &req.item_id,
                new_amount,
                new_total,
                new_expiry.as_deref(),
                Some(&req.idempotency_key),
                &now_iso,
            )?;
        }
        None => {
            let balance_shard = shard::ensure_balance_shard(tx, &req.app_key, now)?;
            balances::insert_balance(
                tx,
                &balance_shard,
                &req.tenant,
                &req.app_key,
                &req.player_id,
                &req.item_id,
                req.amount,
                new_expiry.as_deref(),
                &req.idempotency_key,
                &now_iso,
            )?;
        }
    }

    let record = records::append(
        tx,
        &record_shard,
        &NewRecord {
            tenant: &req.tenant,
            app_key: &req.app_key,
            player_id: &req.player_id,
            item_id: &req.item_id,
            amount_delta: req.amount,
            kind: RecordKind::Grant,
            balance_after: new_amount,
            idempotency_key: Some(&req.idempotency_key),
            remark: req.note.as_deref(),
            created_at: &now_iso,
        },
    )?;

    Ok(TxVerdict::Commit(LedgerOutcome {
        balance_after: new_amount,
        record,
        replayed: false,
    }))
}

fn consume_tx(
    tx: &rusqlite::Transaction<'_>,
    req: &ConsumeRequest,
    policy: Option<&ItemTemplatePolicy>,
    now: DateTime<Utc>,
) -> Result<TxVerdict, rusqlite::Error> {
    let now_iso = format_iso(now);
    let record_shard = shard::ensure_record_shard(tx, &req.app_key, now)?;

    if let Some(prior) = records::find_by_idempotency_key(
        tx,
        &req.app_key,
        &req.tenant,
        &req.player_id,
        &req.item_id,
        &req.idempotency_key,
    )? {
        return Ok(TxVerdict::Commit(LedgerOutcome {
            balance_after: prior.balance_after,
            record: prior,
            replayed: true,
        }));
    }

    // Consume only requires the template to still exist; it need not be
    // active.
    if policy.is_none() {
        return Ok(TxVerdict::Abort(TallyError::TemplateInvalid {
            item_id: req.item_id.clone(),
            reason: "template not found".to_string(),
        }));
    }

    let Some(row) = balances::find_balance(
        tx,
        &req.app_key,
        &req.tenant,
        &req.player_id,
        &req.item_id,
        req.shard.as_deref(),
    )?
    else {
        return Ok(TxVerdict::Abort(TallyError::NoSuchHolding {
            player_id: req.player_id.clone(),
            item_id: req.item_id.clone(),
        }));
    };

    if row.expires_at.as_deref().is_some_and(|d| is_past(d, now)) {
        let expired = TallyError::ItemExpired {
            item_id: req.item_id.clone(),
        };
        if row.amount == 0 {
            return Ok(TxVerdict::Abort(expired));
        }
        // The zero-out and its EXPIRE record commit even though the
        // consume itself fails.
        let forfeited = balances::zero_out(
            tx,
            &row.shard,
            &req.tenant,
            &req.player_id,
            &req.item_id,
            &now_iso,
        )?;
        records::append(
            tx,
            &record_shard,
            &NewRecord {
                tenant: &req.tenant,
                app_key: &req.app_key,
                player_id: &req.player_id,
                item_id: &req.item_id,
                amount_delta: -forfeited,
                kind: RecordKind::Expire,
                balance_after: 0,
                idempotency_key: None,
                remark: None,
                created_at: &now_iso,
            },
        )?;
        return Ok(TxVerdict::CommitFail(expired));
    }

    if req.amount > row.amount {
        return Ok(TxVerdict::Abort(TallyError::InsufficientBalance {
            current: row.amount,
            attempted: req.amount,
        }));
    }

    let new_amount = row.amount - req.amount;
    balances::update_balance(
        tx,
        &row.shard,
        &req.tenant,
        &req.player_id,
        &req.item_id,
        new_amount,
        row.total_granted,
        row.expires_at.as_deref(),
        Some(&req.idempotency_key),
        &now_iso,
    )?;

    let record = records::append(
        tx,
        &record_shard,
        &NewRecord {
            tenant: &req.tenant,
            app_key: &req.app_key,
            player_id: &req.player_id,
            item_id: &req.item_id,
            amount_delta: -req.amount,
            kind: RecordKind::Consume,
            balance_after: new_amount,
            idempotency_key: Some(&req.idempotency_key),
            remark: req.note.as_deref(),
            created_at: &now_iso,
        },
    )?;

    Ok(TxVerdict::Commit(LedgerOutcome {
        balance_after: new_amount,
        record,
        replayed: false,
    }))
}
