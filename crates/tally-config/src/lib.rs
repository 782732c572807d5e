// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration system for the Tally item ledger.
//!
//! Layered TOML configuration with XDG hierarchy and `TALLY_` environment
//! variable overrides, built on Figment.

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{QueryConfig, StorageConfig, TallyConfig};
