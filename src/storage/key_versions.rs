// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Current local key version per user.

use std::sync::Arc;

use redb::{ReadableDatabase, ReadableTable};

use super::database::{AppDatabase, StorageResult, KEY_VERSIONS};
use crate::crypto::kms::KeyVersionStore;

/// redb-backed [`KeyVersionStore`].
pub struct KeyVersionRepository {
    db: Arc<AppDatabase>,
}

impl KeyVersionRepository {
    pub fn new(db: Arc<AppDatabase>) -> Self {
        Self { db }
    }
}

impl KeyVersionStore for KeyVersionRepository {
    fn load_version(&self, user_id: &str) -> StorageResult<Option<u32>> {
        let read_txn = self.db.inner().begin_read()?;
        let table = read_txn.open_table(KEY_VERSIONS)?;
        Ok(table.get(user_id)?.map(|v| v.value()))
    }

    fn store_version(&self, user_id: &str, version: u32) -> StorageResult<()> {
        let write_txn = self.db.inner().begin_write()?;
        {
            let mut table = write_txn.open_table(KEY_VERSIONS)?;
            table.insert(user_id, version)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove_version(&self, user_id: &str) -> StorageResult<()> {
        let write_txn = self.db.inner().begin_write()?;
        {
            let mut table = write_txn.open_table(KEY_VERSIONS)?;
            table.remove(user_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::{DataKey, KEY_LEN};
    use crate::crypto::kms::LocalKeyring;
    use crate::crypto::{KeyManager, UserCiphertext};
    use crate::storage::database::temp_db;
    use serde_json::json;

    fn manager(db: &Arc<AppDatabase>) -> KeyManager {
        let keyring = LocalKeyring::new(DataKey::from_bytes([5u8; KEY_LEN]))
            .with_version_store(Arc::new(KeyVersionRepository::new(db.clone())));
        KeyManager::new(None, Some(keyring))
    }

    fn version_of(blob: &UserCiphertext) -> u32 {
        match blob {
            UserCiphertext::LocalEncrypted { key_version, .. } => *key_version,
            UserCiphertext::RemoteEncrypted { .. } => panic!("expected a local blob"),
        }
    }

    #[tokio::test]
    async fn rotation_holds_across_restart() {
        let (db, _dir) = temp_db();

        let before = manager(&db);
        let old = before.encrypt_user_data("u1", &json!("old")).await.unwrap();
        assert_eq!(before.rotate_user_key("u1").await.unwrap().version, 2);
        drop(before);

        let after = manager(&db);
        let new = after.encrypt_user_data("u1", &json!("new")).await.unwrap();
        assert_eq!(version_of(&old), 1);
        assert_eq!(version_of(&new), 2);
        assert_eq!(after.decrypt_user_data("u1", &old).await.unwrap(), json!("old"));
    }

    #[test]
    fn versions_are_per_user_and_removable() {
        let (db, _dir) = temp_db();
        let repo = KeyVersionRepository::new(db);
        repo.store_version("u1", 3).unwrap();
        assert_eq!(repo.load_version("u1").unwrap(), Some(3));
        assert_eq!(repo.load_version("u2").unwrap(), None);

        repo.remove_version("u1").unwrap();
        assert_eq!(repo.load_version("u1").unwrap(), None);
    }
}
