// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Tally item ledger engine.
//!
//! Grants and consumes virtual items for players across multiple
//! applications, with exactly-once idempotency, template-policy quota
//! enforcement, and lazy expiration. Persistence is the time-sharded
//! SQLite layer from `tally-storage`; template policy comes from a
//! [`TemplateRegistry`](tally_core::TemplateRegistry) implementation.

pub mod ledger;
pub mod read;
pub mod registry;

pub use ledger::{ConsumeRequest, GrantRequest, ItemLedger};
pub use registry::InMemoryTemplateRegistry;
