// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `projects`: project_id → serialized [`PersistedProject`](super::projects::PersistedProject)
//! - `project_slots`: (project_id, slot) → serialized `UserCiphertext`
//! - `owner_projects`: (owner_id, project_id) → ()
//! - `credit_balances`: user_id → balance
//! - `usage_records`: (user_id, sequence) → serialized `UsageRecord`
//! - `ledger_state`: key → u64 (sequence counters)
//! - `key_versions`: user_id → current local key version
//!
//! Only persistent projects ever reach the first three tables.

use std::path::Path;

use redb::{Database, ReadableDatabase, TableDefinition};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

pub(crate) const PROJECT_SLOTS: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("project_slots");

pub(crate) const OWNER_PROJECTS: TableDefinition<(&str, &str), ()> =
    TableDefinition::new("owner_projects");

pub(crate) const CREDIT_BALANCES: TableDefinition<&str, u64> =
    TableDefinition::new("credit_balances");

/// Key is `(user_id, sequence)`; sequence grows monotonically across users.
pub(crate) const USAGE_RECORDS: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("usage_records");

pub(crate) const LEDGER_STATE: TableDefinition<&str, u64> = TableDefinition::new("ledger_state");

pub(crate) const KEY_VERSIONS: TableDefinition<&str, u32> = TableDefinition::new("key_versions");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    /// A durable write was attempted for a memory-only project.
    #[error("refusing durable write for memory-only project {0}")]
    PrivacyViolation(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// AppDatabase
// =============================================================================

/// Shared handle to the embedded database.
pub struct AppDatabase {
    db: Database,
}

impl AppDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PROJECTS)?;
            let _ = write_txn.open_table(PROJECT_SLOTS)?;
            let _ = write_txn.open_table(OWNER_PROJECTS)?;
            let _ = write_txn.open_table(CREDIT_BALANCES)?;
            let _ = write_txn.open_table(USAGE_RECORDS)?;
            let _ = write_txn.open_table(LEDGER_STATE)?;
            let _ = write_txn.open_table(KEY_VERSIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub(crate) fn inner(&self) -> &Database {
        &self.db
    }

    /// Readiness check: a read transaction can be opened.
    pub fn check_readable(&self) -> StorageResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(PROJECTS)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_db() -> (std::sync::Arc<AppDatabase>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = AppDatabase::open(&dir.path().join("test.redb")).unwrap();
    (std::sync::Arc::new(db), dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::{ReadableDatabase, ReadableTable, ReadableTableMetadata};

    #[test]
    fn open_creates_parent_dirs_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("ventura.redb");
        let db = AppDatabase::open(&path).unwrap();
        assert!(path.exists());

        let read_txn = db.inner().begin_read().unwrap();
        assert_eq!(read_txn.open_table(PROJECTS).unwrap().len().unwrap(), 0);
        assert_eq!(read_txn.open_table(USAGE_RECORDS).unwrap().len().unwrap(), 0);
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ventura.redb");
        {
            let db = AppDatabase::open(&path).unwrap();
            let txn = db.inner().begin_write().unwrap();
            {
                let mut table = txn.open_table(CREDIT_BALANCES).unwrap();
                table.insert("u1", 7u64).unwrap();
            }
            txn.commit().unwrap();
        }

        let db = AppDatabase::open(&path).unwrap();
        let read_txn = db.inner().begin_read().unwrap();
        let table = read_txn.open_table(CREDIT_BALANCES).unwrap();
        assert_eq!(table.get("u1").unwrap().unwrap().value(), 7);
    }
}
