// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Tally item ledger.
//!
//! This crate provides the error taxonomy, domain types, timestamp helpers,
//! and the `TemplateRegistry` trait used throughout the Tally workspace.
//! The ledger engine itself lives in `tally-ledger`; SQLite persistence in
//! `tally-storage`.

pub mod error;
pub mod time;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::TallyError;
pub use traits::TemplateRegistry;
pub use types::{
    BalanceView, ItemRecord, ItemTemplatePolicy, LedgerOutcome, LifecycleStatus, RecordFilter,
    RecordKind, RecordPage,
};
