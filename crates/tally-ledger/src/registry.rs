// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory `TemplateRegistry` implementation.
//!
//! The production registry lives in the administrative service that owns
//! template CRUD; this implementation backs tests and single-process
//! embeddings of the ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tally_core::{ItemTemplatePolicy, LifecycleStatus, TallyError, TemplateRegistry};

type AppKey = (String, String);
type TemplateKey = (String, String, String);

/// Template registry backed by in-process maps.
#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    apps: RwLock<HashMap<AppKey, bool>>,
    templates: RwLock<HashMap<TemplateKey, ItemTemplatePolicy>>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application. Unregistered applications read as disabled.
    pub async fn register_app(&self, tenant: &str, app_key: &str, enabled: bool) {
        self.apps
            .write()
            .await
            .insert((tenant.to_string(), app_key.to_string()), enabled);
    }

    /// Create or replace a template's policy.
    pub async fn upsert_template(&self, tenant: &str, app_key: &str, policy: ItemTemplatePolicy) {
        self.templates.write().await.insert(
            (tenant.to_string(), app_key.to_string(), policy.item_id.clone()),
            policy,
        );
    }
}

#[async_trait]
impl TemplateRegistry for InMemoryTemplateRegistry {
    async fn app_enabled(&self, tenant: &str, app_key: &str) -> Result<bool, TallyError> {
        Ok(self
            .apps
            .read()
            .await
            .get(&(tenant.to_string(), app_key.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn get_template(
        &self,
        tenant: &str,
        app_key: &str,
        item_id: &str,
    ) -> Result<Option<ItemTemplatePolicy>, TallyError> {
        Ok(self
            .templates
            .read()
            .await
            .get(&(tenant.to_string(), app_key.to_string(), item_id.to_string()))
            .cloned())
    }

    async fn mark_expired(
        &self,
        tenant: &str,
        app_key: &str,
        item_id: &str,
    ) -> Result<(), TallyError> {
        if let Some(policy) = self.templates.write().await.get_mut(&(
            tenant.to_string(),
            app_key.to_string(),
            item_id.to_string(),
        )) {
            policy.lifecycle_status = LifecycleStatus::Expired;
        }
        Ok(())
    }
}
