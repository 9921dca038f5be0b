// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Management Facade
//!
//! Per-user encryption for persistent project data without handing raw key
//! material to the rest of the application.
//!
//! ## Paths
//!
//! 1. **Remote**: the configured [`TransitBackend`] encrypts under the user's
//!    named key, with an encryption context naming the user and application.
//! 2. **Local**: when the remote call fails or times out, the value is sealed
//!    by the [`LocalKeyring`] instead.
//!
//! The path taken is recorded in the [`UserCiphertext`] discriminant so
//! decryption reverses exactly that path. If neither path succeeds the write
//! fails; plaintext is never returned as a stand-in for ciphertext.

pub mod backend;
pub mod keyring;
pub mod vault;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::envelope::{CryptoError, EncryptedPayload};
use crate::storage::StorageError;

pub use backend::{MemoryTransit, TransitBackend, TransitError};
pub use keyring::{KeyVersionStore, LocalKeyring};
pub use vault::VaultTransit;

/// Default bound on each remote call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Application name bound into every encryption context.
pub const APPLICATION_NAME: &str = "ventura";

const KEY_NAME_HASH_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    /// No encryption path is available; nothing was written.
    #[error("key management unavailable: {0}")]
    Unavailable(String),

    #[error("key management call timed out after {0:?}")]
    Timeout(Duration),

    /// The blob was produced for another user or application.
    #[error("encryption context does not match the requesting user")]
    ContextMismatch,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transit(#[from] TransitError),

    /// The local key version pointer could not be read or written.
    #[error("key version state: {0}")]
    KeyState(#[from] StorageError),
}

pub type KmsResult<T> = Result<T, KmsError>;

/// Context bound into remote ciphertexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub user_id: String,
    pub application: String,
}

impl EncryptionContext {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            application: APPLICATION_NAME.to_string(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{}|{}", self.application, self.user_id).into_bytes()
    }
}

/// Encrypted slot value as stored in the durable projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UserCiphertext {
    RemoteEncrypted {
        backend: String,
        key_name: String,
        ciphertext: String,
        context: EncryptionContext,
    },
    LocalEncrypted {
        user_id: String,
        key_version: u32,
        payload: EncryptedPayload,
    },
}

impl UserCiphertext {
    pub fn is_remote(&self) -> bool {
        matches!(self, UserCiphertext::RemoteEncrypted { .. })
    }
}

/// Where a user key lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLocation {
    Remote,
    Local,
}

/// Reference to a user key. Never contains key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    pub key_name: String,
    pub version: u32,
    pub location: KeyLocation,
}

/// Facade over the remote transit backend and the local fallback keyring.
pub struct KeyManager {
    remote: Option<Arc<dyn TransitBackend>>,
    local: Option<LocalKeyring>,
    key_prefix: String,
    timeout: Duration,
    provisioned: DashMap<String, u32>,
}

impl KeyManager {
    pub fn new(remote: Option<Arc<dyn TransitBackend>>, local: Option<LocalKeyring>) -> Self {
        Self {
            remote,
            local,
            key_prefix: APPLICATION_NAME.to_string(),
            timeout: DEFAULT_REMOTE_TIMEOUT,
            provisioned: DashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Name of the user's key in the remote backend.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced so the name is safe
    /// in a URL path segment. The suffix is a hash of the raw id, so ids that
    /// sanitize alike still get distinct keys.
    pub fn key_name_for(&self, user_id: &str) -> String {
        let sanitized: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let digest = Sha256::digest(user_id.as_bytes());
        let suffix: String = digest[..KEY_NAME_HASH_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("{}-{}-{}", self.key_prefix, sanitized, suffix)
    }

    /// Provision the user's key. Calling it again returns the existing key.
    pub async fn generate_user_key(&self, user_id: &str) -> KmsResult<KeyHandle> {
        let key_name = self.key_name_for(user_id);

        if let Some(remote) = &self.remote {
            match self.bounded(remote.ensure_key(&key_name)).await {
                Ok(version) => {
                    self.provisioned.insert(key_name.clone(), version);
                    return Ok(KeyHandle {
                        key_name,
                        version,
                        location: KeyLocation::Remote,
                    });
                }
                Err(e) => {
                    warn!(
                        backend = remote.name(),
                        error = %e,
                        "Remote key provisioning failed, using local keyring"
                    );
                }
            }
        }

        let local = self.local_or_unavailable()?;
        Ok(KeyHandle {
            key_name,
            version: local.ensure(user_id)?,
            location: KeyLocation::Local,
        })
    }

    /// Encrypt a value for the user, remote first, local on failure.
    pub async fn encrypt_user_data(
        &self,
        user_id: &str,
        value: &serde_json::Value,
    ) -> KmsResult<UserCiphertext> {
        if let Some(remote) = &self.remote {
            match self.remote_encrypt(remote.as_ref(), user_id, value).await {
                Ok(blob) => return Ok(blob),
                Err(e) => {
                    warn!(
                        backend = remote.name(),
                        error = %e,
                        "Remote encryption failed, falling back to local keyring"
                    );
                }
            }
        }

        let local = self.local_or_unavailable()?;
        let (key_version, payload) = local.encrypt(user_id, value)?;
        debug!(key_version, "Encrypted user data with local keyring");
        Ok(UserCiphertext::LocalEncrypted {
            user_id: user_id.to_string(),
            key_version,
            payload,
        })
    }

    /// Decrypt a blob for the requesting user.
    pub async fn decrypt_user_data(
        &self,
        user_id: &str,
        blob: &UserCiphertext,
    ) -> KmsResult<serde_json::Value> {
        match blob {
            UserCiphertext::LocalEncrypted {
                user_id: owner,
                key_version,
                payload,
            } => {
                if owner != user_id {
                    return Err(KmsError::ContextMismatch);
                }
                let local = self.local_or_unavailable()?;
                Ok(local.decrypt(user_id, *key_version, payload)?)
            }
            UserCiphertext::RemoteEncrypted {
                key_name,
                ciphertext,
                context,
                ..
            } => {
                let expected = EncryptionContext::for_user(user_id);
                if *context != expected || *key_name != self.key_name_for(user_id) {
                    return Err(KmsError::ContextMismatch);
                }
                let remote = self.remote.as_ref().ok_or_else(|| {
                    KmsError::Unavailable("remote ciphertext but no transit backend".to_string())
                })?;
                let plaintext = self
                    .bounded(remote.decrypt(key_name, ciphertext, &expected.to_bytes()))
                    .await
                    .map_err(|e| match e {
                        KmsError::Transit(TransitError::Rejected(_)) => {
                            KmsError::Crypto(CryptoError::DecryptionFailed)
                        }
                        other => other,
                    })?;
                serde_json::from_slice(&plaintext)
                    .map_err(|_| KmsError::Crypto(CryptoError::DecryptionFailed))
            }
        }
    }

    /// Start a new key version for the user.
    ///
    /// Existing ciphertexts stay readable under their recorded version;
    /// re-encrypting them is a separate batch job.
    pub async fn rotate_user_key(&self, user_id: &str) -> KmsResult<KeyHandle> {
        let key_name = self.key_name_for(user_id);

        let remote_version = match &self.remote {
            Some(remote) => {
                self.bounded(remote.ensure_key(&key_name)).await?;
                let version = self.bounded(remote.rotate_key(&key_name)).await?;
                self.provisioned.insert(key_name.clone(), version);
                Some(version)
            }
            None => None,
        };
        let local_version = self
            .local
            .as_ref()
            .map(|local| local.rotate(user_id))
            .transpose()?;

        match (remote_version, local_version) {
            (Some(version), _) => Ok(KeyHandle {
                key_name,
                version,
                location: KeyLocation::Remote,
            }),
            (None, Some(version)) => Ok(KeyHandle {
                key_name,
                version,
                location: KeyLocation::Local,
            }),
            (None, None) => Err(KmsError::Unavailable("no key backend configured".to_string())),
        }
    }

    /// Forget key state held for an erased account.
    pub fn forget_user(&self, user_id: &str) -> KmsResult<()> {
        self.provisioned.remove(&self.key_name_for(user_id));
        if let Some(local) = &self.local {
            local.forget(user_id)?;
        }
        Ok(())
    }

    async fn remote_encrypt(
        &self,
        remote: &dyn TransitBackend,
        user_id: &str,
        value: &serde_json::Value,
    ) -> KmsResult<UserCiphertext> {
        let key_name = self.key_name_for(user_id);
        if !self.provisioned.contains_key(&key_name) {
            let version = self.bounded(remote.ensure_key(&key_name)).await?;
            self.provisioned.insert(key_name.clone(), version);
        }

        let context = EncryptionContext::for_user(user_id);
        let plaintext = serde_json::to_vec(value).map_err(CryptoError::from)?;
        let ciphertext = self
            .bounded(remote.encrypt(&key_name, &plaintext, &context.to_bytes()))
            .await?;

        Ok(UserCiphertext::RemoteEncrypted {
            backend: remote.name().to_string(),
            key_name,
            ciphertext,
            context,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TransitError>>,
    ) -> KmsResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KmsError::Timeout(self.timeout)),
        }
    }

    fn local_or_unavailable(&self) -> KmsResult<&LocalKeyring> {
        self.local
            .as_ref()
            .ok_or_else(|| KmsError::Unavailable("no local keyring configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::{DataKey, KEY_LEN};
    use async_trait::async_trait;
    use serde_json::json;

    fn local() -> LocalKeyring {
        LocalKeyring::new(DataKey::from_bytes([11u8; KEY_LEN]))
    }

    fn with_memory_remote() -> (KeyManager, Arc<MemoryTransit>) {
        let transit = Arc::new(MemoryTransit::new());
        let manager = KeyManager::new(Some(transit.clone()), Some(local()));
        (manager, transit)
    }

    /// Backend that never answers.
    struct HangingTransit;

    #[async_trait]
    impl TransitBackend for HangingTransit {
        fn name(&self) -> &'static str {
            "hanging"
        }
        async fn ensure_key(&self, _key_name: &str) -> Result<u32, TransitError> {
            std::future::pending().await
        }
        async fn key_version(&self, _key_name: &str) -> Result<Option<u32>, TransitError> {
            std::future::pending().await
        }
        async fn encrypt(&self, _key_name: &str, _plaintext: &[u8], _context: &[u8]) -> Result<String, TransitError> {
            std::future::pending().await
        }
        async fn decrypt(&self, _key_name: &str, _ciphertext: &str, _context: &[u8]) -> Result<Vec<u8>, TransitError> {
            std::future::pending().await
        }
        async fn rotate_key(&self, _key_name: &str) -> Result<u32, TransitError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn remote_path_round_trips() {
        let (manager, transit) = with_memory_remote();
        let value = json!({"title": "X", "nested": {"n": [1, 2, 3]}});

        let blob = manager.encrypt_user_data("u1", &value).await.unwrap();
        assert!(blob.is_remote());
        assert_eq!(transit.encrypt_calls(), 1);
        assert_eq!(manager.decrypt_user_data("u1", &blob).await.unwrap(), value);
    }

    #[tokio::test]
    async fn outage_falls_back_to_local_and_records_path() {
        let (manager, transit) = with_memory_remote();
        transit.set_available(false);

        let blob = manager.encrypt_user_data("u1", &json!({"a": 1})).await.unwrap();
        assert!(matches!(blob, UserCiphertext::LocalEncrypted { .. }));

        // Local blobs stay readable after the backend recovers.
        transit.set_available(true);
        assert_eq!(
            manager.decrypt_user_data("u1", &blob).await.unwrap(),
            json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn remote_timeout_falls_back() {
        let manager = KeyManager::new(Some(Arc::new(HangingTransit)), Some(local()))
            .with_timeout(Duration::from_millis(20));
        let blob = manager.encrypt_user_data("u1", &json!("v")).await.unwrap();
        assert!(matches!(blob, UserCiphertext::LocalEncrypted { .. }));
    }

    #[tokio::test]
    async fn no_path_available_fails_instead_of_storing_plaintext() {
        let transit = Arc::new(MemoryTransit::new());
        transit.set_available(false);
        let manager = KeyManager::new(Some(transit), None);

        let result = manager.encrypt_user_data("u1", &json!({"secret": true})).await;
        assert!(matches!(result, Err(KmsError::Unavailable(_))));
    }

    #[tokio::test]
    async fn blobs_are_bound_to_their_user() {
        let (manager, transit) = with_memory_remote();
        let remote_blob = manager.encrypt_user_data("alice", &json!(1)).await.unwrap();
        assert!(matches!(
            manager.decrypt_user_data("bob", &remote_blob).await,
            Err(KmsError::ContextMismatch)
        ));

        transit.set_available(false);
        let local_blob = manager.encrypt_user_data("alice", &json!(2)).await.unwrap();
        assert!(matches!(
            manager.decrypt_user_data("bob", &local_blob).await,
            Err(KmsError::ContextMismatch)
        ));
    }

    #[tokio::test]
    async fn forged_context_cannot_redirect_decryption() {
        let (manager, _transit) = with_memory_remote();
        let blob = manager.encrypt_user_data("alice", &json!("x")).await.unwrap();

        let UserCiphertext::RemoteEncrypted { backend, ciphertext, .. } = blob else {
            panic!("expected remote blob");
        };
        let forged = UserCiphertext::RemoteEncrypted {
            backend,
            key_name: manager.key_name_for("bob"),
            ciphertext,
            context: EncryptionContext::for_user("bob"),
        };
        assert!(manager.decrypt_user_data("bob", &forged).await.is_err());
    }

    #[tokio::test]
    async fn generate_user_key_is_idempotent() {
        let (manager, _transit) = with_memory_remote();
        let first = manager.generate_user_key("u1").await.unwrap();
        let second = manager.generate_user_key("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.location, KeyLocation::Remote);
        assert_eq!(first.version, 1);
    }

    #[tokio::test]
    async fn rotation_keeps_existing_ciphertexts_readable() {
        let (manager, _transit) = with_memory_remote();
        let before = manager.encrypt_user_data("u1", &json!("old")).await.unwrap();

        let handle = manager.rotate_user_key("u1").await.unwrap();
        assert_eq!(handle.version, 2);

        let after = manager.encrypt_user_data("u1", &json!("new")).await.unwrap();
        assert_ne!(before, after);
        assert_eq!(manager.decrypt_user_data("u1", &before).await.unwrap(), json!("old"));
        assert_eq!(manager.decrypt_user_data("u1", &after).await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn local_only_manager_rotates_locally() {
        let manager = KeyManager::new(None, Some(local()));
        let before = manager.encrypt_user_data("u1", &json!("old")).await.unwrap();
        let handle = manager.rotate_user_key("u1").await.unwrap();
        assert_eq!(handle.location, KeyLocation::Local);
        assert_eq!(handle.version, 2);
        assert_eq!(manager.decrypt_user_data("u1", &before).await.unwrap(), json!("old"));
    }

    #[test]
    fn key_names_are_url_safe() {
        let manager = KeyManager::new(None, Some(local()));
        let name = manager.key_name_for("user_2a/b c");
        assert!(name.starts_with("ventura-user_2a_b_c-"));
        assert_eq!(name.len(), "ventura-user_2a_b_c-".len() + 8);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn ids_that_sanitize_alike_get_separate_keys() {
        let (manager, _transit) = with_memory_remote();
        assert_ne!(manager.key_name_for("a/b"), manager.key_name_for("a_b"));
        assert_eq!(manager.key_name_for("a/b"), manager.key_name_for("a/b"));

        manager.encrypt_user_data("a_b", &json!(1)).await.unwrap();
        manager.rotate_user_key("a/b").await.unwrap();
        let untouched = manager.generate_user_key("a_b").await.unwrap();
        assert_eq!(untouched.version, 1);
    }

    #[test]
    fn ciphertext_serializes_with_mode_tag() {
        let blob = UserCiphertext::LocalEncrypted {
            user_id: "u1".into(),
            key_version: 1,
            payload: EncryptedPayload {
                ciphertext: "c".into(),
                iv: "i".into(),
                auth_tag: "t".into(),
            },
        };
        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value["mode"], "local_encrypted");
        assert_eq!(value["payload"]["auth_tag"], "t");
    }
}
