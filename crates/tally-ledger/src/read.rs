// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Read-side operations: player holdings and the record log.
//!
//! Reads are where lazy expiration does its cleanup: a holding whose expiry
//! has passed is zeroed out in a short transaction of its own before the
//! view is returned, so callers never observe a positive balance on an
//! expired holding.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use tracing::{info, warn};

use tally_core::time::{format_iso, is_past};
use tally_core::{BalanceView, LifecycleStatus, RecordFilter, RecordKind, RecordPage, TallyError};
use tally_storage::balances::BalanceRow;
use tally_storage::records::NewRecord;
use tally_storage::{balances, map_tr_err, records, shard};

use crate::ledger::ItemLedger;

impl ItemLedger {
    /// List a player's holdings, optionally narrowed to one item.
    ///
    /// Expired holdings are zeroed out on the way through (with an EXPIRE
    /// record appended) and come back with `usable: false`.
    pub async fn list_player_items(
        &self,
        tenant: &str,
        app_key: &str,
        player_id: &str,
        item_id: Option<&str>,
    ) -> Result<Vec<BalanceView>, TallyError> {
        shard::validate_app_key(app_key)?;
        if tenant.is_empty() || player_id.is_empty() {
            return Err(TallyError::Validation(
                "tenant and player_id must be non-empty".to_string(),
            ));
        }
        let now = Utc::now();

        let rows = {
            let app_key = app_key.to_string();
            let tenant = tenant.to_string();
            let player_id = player_id.to_string();
            let item_id = item_id.map(str::to_string);
            self.db
                .connection()
                .call(move |conn| {
                    balances::list_for_player(conn, &app_key, &tenant, &player_id, item_id.as_deref())
                })
                .await
                .map_err(map_tr_err)?
        };

        let mut policies = HashMap::new();
        for row in &rows {
            if !policies.contains_key(&row.item_id) {
                let policy = self
                    .registry
                    .get_template(tenant, app_key, &row.item_id)
                    .await?;
                policies.insert(row.item_id.clone(), policy);
            }
        }

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let policy = policies.get(&row.item_id).and_then(|p| p.as_ref());

            let template_expired = policy
                .and_then(|p| p.expire_date.as_deref())
                .is_some_and(|d| is_past(d, now));
            if template_expired
                && policy.is_some_and(|p| p.lifecycle_status == LifecycleStatus::Normal)
            {
                self.spawn_mark_expired(tenant, app_key, &row.item_id);
            }

            let row_expired = row.expires_at.as_deref().is_some_and(|d| is_past(d, now));
            let expired = row_expired || template_expired;

            let mut amount = row.amount;
            if expired && amount > 0 {
                let forfeited = self.expire_touch(&row, now).await?;
                info!(
                    app_key = %row.app_key,
                    player_id = %row.player_id,
                    item_id = %row.item_id,
                    forfeited,
                    "expired holding zeroed on read"
                );
                amount = 0;
            }

            views.push(BalanceView {
                tenant: row.tenant,
                app_key: row.app_key,
                player_id: row.player_id,
                item_id: row.item_id,
                amount,
                total_granted: row.total_granted,
                obtained_at: row.obtained_at,
                expires_at: row.expires_at,
                usable: amount > 0 && !expired,
            });
        }
        Ok(views)
    }

    /// Query the record log with paging. `page` is 1-based; an absent or
    /// oversized `page_size` falls back to the configured bounds.
    pub async fn query_records(
        &self,
        tenant: &str,
        app_key: &str,
        filter: RecordFilter,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> Result<RecordPage, TallyError> {
        shard::validate_app_key(app_key)?;
        if tenant.is_empty() {
            return Err(TallyError::Validation("tenant must be non-empty".to_string()));
        }
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size
            .unwrap_or(self.query.default_page_size)
            .min(self.query.max_page_size)
            .max(1);

        let tenant = tenant.to_string();
        let app_key = app_key.to_string();
        let (records, total) = self
            .db
            .connection()
            .call(move |conn| records::query(conn, &app_key, &tenant, &filter, page, page_size))
            .await
            .map_err(map_tr_err)?;
        Ok(RecordPage { records, total })
    }

    /// Zero out an expired holding in its own short transaction, appending
    /// the EXPIRE record. Re-reads the row under the write lock so a
    /// concurrent touch applies at most once. Returns the forfeited amount.
    async fn expire_touch(&self, row: &BalanceRow, now: DateTime<Utc>) -> Result<i64, TallyError> {
        let balance_shard = row.shard.clone();
        let tenant = row.tenant.clone();
        let app_key = row.app_key.clone();
        let player_id = row.player_id.clone();
        let item_id = row.item_id.clone();
        let now_iso = format_iso(now);

        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(current) = balances::find_balance(
                    &tx,
                    &app_key,
                    &tenant,
                    &player_id,
                    &item_id,
                    Some(&balance_shard),
                )?
                else {
                    return Ok(0);
                };
                if current.amount == 0 {
                    return Ok(0);
                }
                let record_shard = shard::ensure_record_shard(&tx, &app_key, now)?;
                let forfeited = balances::zero_out(
                    &tx,
                    &balance_shard,
                    &tenant,
                    &player_id,
                    &item_id,
                    &now_iso,
                )?;
                records::append(
                    &tx,
                    &record_shard,
                    &NewRecord {
                        tenant: &tenant,
                        app_key: &app_key,
                        player_id: &player_id,
                        item_id: &item_id,
                        amount_delta: -forfeited,
                        kind: RecordKind::Expire,
                        balance_after: 0,
                        idempotency_key: None,
                        remark: None,
                        created_at: &now_iso,
                    },
                )?;
                tx.commit()?;
                Ok(forfeited)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Fire-and-forget lifecycle write-back when an expired template is
    /// observed. Failure is logged, never surfaced.
    pub(crate) fn spawn_mark_expired(&self, tenant: &str, app_key: &str, item_id: &str) {
        let registry = Arc::clone(&self.registry);
        let tenant = tenant.to_string();
        let app_key = app_key.to_string();
        let item_id = item_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = registry.mark_expired(&tenant, &app_key, &item_id).await {
                warn!(
                    %tenant,
                    %app_key,
                    %item_id,
                    error = %err,
                    "template expiry write-back failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::GrantRequest;
    use crate::registry::InMemoryTemplateRegistry;
    use tally_config::QueryConfig;
    use tally_core::{ItemTemplatePolicy, TemplateRegistry};
    use tally_storage::Database;
    use tempfile::TempDir;

    async fn setup() -> (ItemLedger, Arc<InMemoryTemplateRegistry>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ledger.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        let registry = Arc::new(InMemoryTemplateRegistry::new());
        registry.register_app("t1", "demo", true).await;
        let ledger = ItemLedger::new(db, registry.clone(), QueryConfig::default());
        (ledger, registry, dir)
    }

    async fn grant(ledger: &ItemLedger, player: &str, item: &str, amount: i64, token: &str) {
        ledger
            .grant(GrantRequest {
                tenant: "t1".to_string(),
                app_key: "demo".to_string(),
                player_id: player.to_string(),
                item_id: item.to_string(),
                amount,
                note: None,
                idempotency_key: token.to_string(),
            })
            .await
            .unwrap();
    }

    /// Backdate every expiry in the current balance shard.
    async fn backdate_expiries(ledger: &ItemLedger) {
        let table = shard::balance_shard("demo", Utc::now());
        ledger
            .database()
            .connection()
            .call(move |conn| {
                conn.execute(
                    &format!("UPDATE {table} SET expires_at = '2020-01-01T00:00:00.000Z'"),
                    [],
                )
                .map(|_| ())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn listing_reports_usable_and_empty_holdings() {
        let (ledger, registry, _dir) = setup().await;
        registry
            .upsert_template("t1", "demo", ItemTemplatePolicy::unrestricted("itm_a"))
            .await;
        registry
            .upsert_template("t1", "demo", ItemTemplatePolicy::unrestricted("itm_b"))
            .await;
        grant(&ledger, "p1", "itm_a", 5, "a-1").await;
        grant(&ledger, "p1", "itm_b", 2, "b-1").await;

        let views = ledger.list_player_items("t1", "demo", "p1", None).await.unwrap();
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|v| v.usable));

        let one = ledger
            .list_player_items("t1", "demo", "p1", Some("itm_b"))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].amount, 2);

        assert!(
            ledger
                .list_player_items("t1", "demo", "nobody", None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn expired_holding_is_zeroed_on_read_exactly_once() {
        let (ledger, registry, _dir) = setup().await;
        let mut policy = ItemTemplatePolicy::unrestricted("itm");
        policy.expire_duration_hours = Some(24.0);
        registry.upsert_template("t1", "demo", policy).await;
        grant(&ledger, "p1", "itm", 7, "tok-1").await;
        backdate_expiries(&ledger).await;

        let views = ledger.list_player_items("t1", "demo", "p1", None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].amount, 0);
        assert!(!views[0].usable);

        // A second read must not append another EXPIRE record.
        ledger.list_player_items("t1", "demo", "p1", None).await.unwrap();

        let filter = RecordFilter {
            kind: Some(RecordKind::Expire),
            ..RecordFilter::default()
        };
        let page = ledger.query_records("t1", "demo", filter, None, None).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].amount_delta, -7);
        assert_eq!(page.records[0].balance_after, 0);
        assert!(page.records[0].idempotency_key.is_none());
    }

    #[tokio::test]
    async fn past_template_expire_date_expires_holdings_on_read() {
        let (ledger, registry, _dir) = setup().await;
        registry
            .upsert_template("t1", "demo", ItemTemplatePolicy::unrestricted("itm"))
            .await;
        grant(&ledger, "p1", "itm", 4, "tok-1").await;

        // The template expires after the grant; the row itself carries no expiry.
        let mut expired = ItemTemplatePolicy::unrestricted("itm");
        expired.expire_date = Some("2020-01-01T00:00:00.000Z".to_string());
        registry.upsert_template("t1", "demo", expired).await;

        let views = ledger.list_player_items("t1", "demo", "p1", None).await.unwrap();
        assert_eq!(views[0].amount, 0);
        assert!(!views[0].usable);

        tokio::task::yield_now().await;
        let policy = registry.get_template("t1", "demo", "itm").await.unwrap().unwrap();
        assert_eq!(policy.lifecycle_status, LifecycleStatus::Expired);
    }

    #[tokio::test]
    async fn record_queries_page_and_filter() {
        let (ledger, registry, _dir) = setup().await;
        registry
            .upsert_template("t1", "demo", ItemTemplatePolicy::unrestricted("itm"))
            .await;
        for i in 0..7 {
            grant(&ledger, "p1", "itm", 1, &format!("tok-{i}")).await;
        }
        grant(&ledger, "p2", "itm", 1, "tok-p2").await;

        let filter = RecordFilter {
            player_id: Some("p1".to_string()),
            ..RecordFilter::default()
        };
        let page = ledger
            .query_records("t1", "demo", filter.clone(), Some(1), Some(3))
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.records.len(), 3);

        let last = ledger
            .query_records("t1", "demo", filter.clone(), Some(3), Some(3))
            .await
            .unwrap();
        assert_eq!(last.records.len(), 1);

        let beyond = ledger.query_records("t1", "demo", filter, Some(9), Some(3)).await.unwrap();
        assert!(beyond.records.is_empty());
        assert_eq!(beyond.total, 7);
    }

    #[tokio::test]
    async fn page_size_is_clamped_to_configured_bounds() {
        let (ledger, registry, _dir) = setup().await;
        registry
            .upsert_template("t1", "demo", ItemTemplatePolicy::unrestricted("itm"))
            .await;
        for i in 0..3 {
            grant(&ledger, "p1", "itm", 1, &format!("tok-{i}")).await;
        }

        // Default max_page_size is 500; an absurd request is capped, a zero
        // request is raised to 1.
        let all = ledger
            .query_records("t1", "demo", RecordFilter::default(), None, Some(1_000_000))
            .await
            .unwrap();
        assert_eq!(all.records.len(), 3);

        let one = ledger
            .query_records("t1", "demo", RecordFilter::default(), None, Some(0))
            .await
            .unwrap();
        assert_eq!(one.records.len(), 1);
        assert_eq!(one.total, 3);
    }
}
