// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence layer for the Tally item ledger.
//!
//! Provides WAL-mode SQLite storage with embedded migrations, a
//! single-writer concurrency model via `tokio-rusqlite`, deterministic
//! shard routing, atomically-reserved quota counters, balance-row access,
//! and the append-only item record log.
//!
//! The modules in this crate expose synchronous functions over
//! `&rusqlite::Connection` so the ledger engine can compose them inside a
//! single transaction within one `conn.call()` closure.

pub mod balances;
pub mod database;
pub mod migrations;
pub mod quota;
pub mod records;
pub mod shard;

pub use database::{Database, map_sql_err, map_tr_err};
