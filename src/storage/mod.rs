// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Durable Storage
//!
//! Everything that outlives the process lives in one embedded redb database:
//!
//! - `projects` - encrypted slot data and metadata of persistent projects
//! - `ledger` - credit balances and the usage trail
//! - `key_versions` - current local key version per user (no key material)
//!
//! ## Important Notes
//!
//! - Slot values arrive here already encrypted by [`crate::crypto::KeyManager`]
//! - Memory-only projects never reach this module
//! - DO NOT decrypt anything in this module

pub mod database;
pub mod key_versions;
pub mod ledger;
pub mod projects;

pub use database::{AppDatabase, StorageError, StorageResult};
pub use key_versions::KeyVersionRepository;
pub use ledger::{
    ChargeRequest, CreditLedger, LedgerError, StageCosts, UsageAction, UsageRecord,
};
pub use projects::{DurableProjectStore, PersistedProject, PersistentProjectId, ProjectRepository};
