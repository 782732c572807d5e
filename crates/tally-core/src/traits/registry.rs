// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The template-registry seam.
//!
//! Template and application administration live outside the ledger core.
//! The ledger only reads policy data through this trait and issues one
//! best-effort write-back (`mark_expired`) when it observes a template
//! whose absolute expire date has passed.

use async_trait::async_trait;

use crate::error::TallyError;
use crate::types::ItemTemplatePolicy;

/// Read access to item-template policy and application state.
///
/// Implementations must be safe to call concurrently. Policy returned by
/// [`get_template`](TemplateRegistry::get_template) is treated as immutable
/// for the duration of the ledger operation that fetched it.
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    /// Whether the application is administratively enabled.
    async fn app_enabled(&self, tenant: &str, app_key: &str) -> Result<bool, TallyError>;

    /// Fetch the policy for one item template, or `None` if it does not exist.
    async fn get_template(
        &self,
        tenant: &str,
        app_key: &str,
        item_id: &str,
    ) -> Result<Option<ItemTemplatePolicy>, TallyError>;

    /// Best-effort write-back marking a template expired.
    ///
    /// The ledger fires this when it observes a past `expire_date`; failures
    /// are logged by the caller and never fail the ledger operation.
    async fn mark_expired(
        &self,
        tenant: &str,
        app_key: &str,
        item_id: &str,
    ) -> Result<(), TallyError>;
}
