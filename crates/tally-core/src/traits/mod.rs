// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait seams between the ledger core and its external collaborators.

mod registry;

pub use registry::TemplateRegistry;
