// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Process-local fallback keyring.
//!
//! Per-user keys are derived from one master key:
//!
//! ```text
//! user_key(user, n) = HMAC-SHA256(master, "ventura-user-key|{user}|v{n}")
//! ```
//!
//! Rotation only bumps the version used for new encryptions. Every earlier
//! version stays derivable, so existing ciphertexts remain readable until they
//! are re-encrypted.
//!
//! The current version per user is cached in memory and, when a
//! [`KeyVersionStore`] is attached, written through to it so a rotation
//! survives a restart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use super::KmsResult;
use crate::crypto::envelope::{self, CryptoResult, DataKey, EncryptedPayload};
use crate::storage::StorageResult;

/// Durable record of each user's current local key version.
pub trait KeyVersionStore: Send + Sync {
    fn load_version(&self, user_id: &str) -> StorageResult<Option<u32>>;

    fn store_version(&self, user_id: &str, version: u32) -> StorageResult<()>;

    fn remove_version(&self, user_id: &str) -> StorageResult<()>;
}

pub struct LocalKeyring {
    master: DataKey,
    versions: RwLock<HashMap<String, u32>>,
    store: Option<Arc<dyn KeyVersionStore>>,
}

impl LocalKeyring {
    /// Keyring whose version pointers live only in this process.
    pub fn new(master: DataKey) -> Self {
        Self {
            master,
            versions: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_version_store(mut self, store: Arc<dyn KeyVersionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current version for the user, creating version 1 on first use.
    pub fn ensure(&self, user_id: &str) -> KmsResult<u32> {
        if let Some(version) = self.cached(user_id) {
            return Ok(version);
        }
        let mut versions = self.write_versions();
        if let Some(version) = self.current(&mut versions, user_id)? {
            return Ok(version);
        }
        self.persist(user_id, 1)?;
        versions.insert(user_id.to_string(), 1);
        Ok(1)
    }

    /// Current version without creating one.
    pub fn peek(&self, user_id: &str) -> KmsResult<Option<u32>> {
        if let Some(version) = self.cached(user_id) {
            return Ok(Some(version));
        }
        let mut versions = self.write_versions();
        self.current(&mut versions, user_id)
    }

    /// Start using a new version for this user. Returns the new version.
    pub fn rotate(&self, user_id: &str) -> KmsResult<u32> {
        let mut versions = self.write_versions();
        let next = self.current(&mut versions, user_id)?.unwrap_or(1) + 1;
        self.persist(user_id, next)?;
        versions.insert(user_id.to_string(), next);
        Ok(next)
    }

    /// Drop the user's version pointer (account erasure).
    pub fn forget(&self, user_id: &str) -> KmsResult<()> {
        let mut versions = self.write_versions();
        versions.remove(user_id);
        if let Some(store) = &self.store {
            store.remove_version(user_id)?;
        }
        Ok(())
    }

    /// Encrypt under the user's current key version.
    pub fn encrypt(
        &self,
        user_id: &str,
        value: &serde_json::Value,
    ) -> KmsResult<(u32, EncryptedPayload)> {
        let version = self.ensure(user_id)?;
        let key = self.user_key(user_id, version)?;
        Ok((version, envelope::encrypt(value, &key)?))
    }

    /// Decrypt a payload sealed under `version` of the user's key.
    pub fn decrypt(
        &self,
        user_id: &str,
        version: u32,
        payload: &EncryptedPayload,
    ) -> CryptoResult<serde_json::Value> {
        let key = self.user_key(user_id, version)?;
        envelope::decrypt(payload, &key)
    }

    fn user_key(&self, user_id: &str, version: u32) -> CryptoResult<DataKey> {
        self.master
            .derive(&format!("ventura-user-key|{user_id}|v{version}"))
    }

    fn cached(&self, user_id: &str) -> Option<u32> {
        let versions = self.versions.read().unwrap_or_else(|e| e.into_inner());
        versions.get(user_id).copied()
    }

    fn write_versions(&self) -> RwLockWriteGuard<'_, HashMap<String, u32>> {
        self.versions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached version, else the stored one (cached on the way out).
    fn current(
        &self,
        versions: &mut HashMap<String, u32>,
        user_id: &str,
    ) -> KmsResult<Option<u32>> {
        if let Some(version) = versions.get(user_id) {
            return Ok(Some(*version));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let stored = store.load_version(user_id)?;
        if let Some(version) = stored {
            versions.insert(user_id.to_string(), version);
        }
        Ok(stored)
    }

    fn persist(&self, user_id: &str, version: u32) -> KmsResult<()> {
        if let Some(store) = &self.store {
            store.store_version(user_id, version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::{CryptoError, KEY_LEN};
    use serde_json::json;
    use std::sync::Mutex;

    fn keyring() -> LocalKeyring {
        LocalKeyring::new(DataKey::from_bytes([3u8; KEY_LEN]))
    }

    #[derive(Default)]
    struct MapStore(Mutex<HashMap<String, u32>>);

    impl KeyVersionStore for MapStore {
        fn load_version(&self, user_id: &str) -> StorageResult<Option<u32>> {
            Ok(self.0.lock().unwrap().get(user_id).copied())
        }
        fn store_version(&self, user_id: &str, version: u32) -> StorageResult<()> {
            self.0.lock().unwrap().insert(user_id.to_string(), version);
            Ok(())
        }
        fn remove_version(&self, user_id: &str) -> StorageResult<()> {
            self.0.lock().unwrap().remove(user_id);
            Ok(())
        }
    }

    #[test]
    fn ensure_starts_at_version_one() {
        let ring = keyring();
        assert_eq!(ring.peek("u1").unwrap(), None);
        assert_eq!(ring.ensure("u1").unwrap(), 1);
        assert_eq!(ring.ensure("u1").unwrap(), 1);
    }

    #[test]
    fn users_cannot_open_each_others_payloads() {
        let ring = keyring();
        let (version, payload) = ring.encrypt("alice", &json!({"idea": "x"})).unwrap();
        assert!(matches!(
            ring.decrypt("bob", version, &payload),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn rotation_is_lazy() {
        let ring = keyring();
        let (v1, old) = ring.encrypt("u1", &json!("before")).unwrap();
        assert_eq!(ring.rotate("u1").unwrap(), 2);
        let (v2, new) = ring.encrypt("u1", &json!("after")).unwrap();

        assert_eq!((v1, v2), (1, 2));
        assert_eq!(ring.decrypt("u1", 1, &old).unwrap(), json!("before"));
        assert_eq!(ring.decrypt("u1", 2, &new).unwrap(), json!("after"));
        assert!(ring.decrypt("u1", 2, &old).is_err());
    }

    #[test]
    fn same_master_key_reads_across_instances() {
        let (version, payload) = keyring().encrypt("u1", &json!({"a": 1})).unwrap();
        assert_eq!(keyring().decrypt("u1", version, &payload).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn rotated_version_survives_a_new_instance() {
        let store: Arc<MapStore> = Arc::new(MapStore::default());
        let first = keyring().with_version_store(store.clone());
        first.encrypt("u1", &json!(1)).unwrap();
        assert_eq!(first.rotate("u1").unwrap(), 2);

        let second = keyring().with_version_store(store.clone());
        assert_eq!(second.peek("u1").unwrap(), Some(2));
        let (version, _) = second.encrypt("u1", &json!(2)).unwrap();
        assert_eq!(version, 2);

        second.forget("u1").unwrap();
        assert_eq!(store.load_version("u1").unwrap(), None);
    }
}
