// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secrets-transit backend abstraction.
//!
//! A transit backend holds named, non-exportable keys and performs
//! encrypt/decrypt on the caller's behalf. Raw key bytes never leave it.
//! Every call carries an encryption context; a ciphertext only decrypts when
//! the same context is supplied again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};

use crate::crypto::envelope::{self, DataKey, EncryptedPayload};

/// Errors reported by a transit backend.
#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    /// Network failure, timeout or 5xx. Callers may fall back.
    #[error("transit backend unavailable: {0}")]
    Unavailable(String),

    #[error("transit key not found: {0}")]
    KeyNotFound(String),

    /// The backend refused the request (bad context, bad ciphertext, auth).
    #[error("transit backend rejected the request: {0}")]
    Rejected(String),

    #[error("malformed transit response: {0}")]
    Malformed(String),
}

pub type TransitResult<T> = Result<T, TransitError>;

/// Remote key-management operations used by [`super::KeyManager`].
#[async_trait]
pub trait TransitBackend: Send + Sync {
    /// Short backend name for logs and key handles.
    fn name(&self) -> &'static str;

    /// Create the key if missing. Returns the latest key version.
    async fn ensure_key(&self, key_name: &str) -> TransitResult<u32>;

    /// Latest version of an existing key, `None` if it does not exist.
    async fn key_version(&self, key_name: &str) -> TransitResult<Option<u32>>;

    /// Encrypt `plaintext` bound to `context`. Returns an opaque ciphertext.
    async fn encrypt(&self, key_name: &str, plaintext: &[u8], context: &[u8])
        -> TransitResult<String>;

    /// Decrypt an opaque ciphertext under the same `context`.
    async fn decrypt(&self, key_name: &str, ciphertext: &str, context: &[u8])
        -> TransitResult<Vec<u8>>;

    /// Add a new key version. Older versions keep decrypting.
    async fn rotate_key(&self, key_name: &str) -> TransitResult<u32>;
}

/// In-process transit backend.
///
/// Behaves like a derived-key transit engine: each key version derives a
/// per-context sub-key, so a ciphertext produced for one context cannot be
/// opened under another. Availability can be switched off to exercise the
/// fallback path.
#[derive(Default)]
pub struct MemoryTransit {
    keys: Mutex<HashMap<String, Vec<DataKey>>>,
    unavailable: AtomicBool,
    encrypt_calls: AtomicUsize,
}

impl MemoryTransit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of encrypt calls that reached the backend while available.
    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> TransitResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TransitError::Unavailable("memory transit switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn context_key(&self, key_name: &str, version: u32, context: &[u8]) -> TransitResult<DataKey> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let versions = keys
            .get(key_name)
            .ok_or_else(|| TransitError::KeyNotFound(key_name.to_string()))?;
        let base = versions
            .get(version.saturating_sub(1) as usize)
            .ok_or_else(|| TransitError::Rejected(format!("unknown key version {version}")))?;
        base.derive(&Base64::encode_string(context))
            .map_err(|e| TransitError::Malformed(e.to_string()))
    }

    fn latest(&self, key_name: &str) -> Option<u32> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.get(key_name).map(|v| v.len() as u32)
    }
}

#[async_trait]
impl TransitBackend for MemoryTransit {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_key(&self, key_name: &str) -> TransitResult<u32> {
        self.check_available()?;
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(versions) = keys.get(key_name) {
            return Ok(versions.len() as u32);
        }
        let key = DataKey::generate().map_err(|e| TransitError::Unavailable(e.to_string()))?;
        keys.insert(key_name.to_string(), vec![key]);
        Ok(1)
    }

    async fn key_version(&self, key_name: &str) -> TransitResult<Option<u32>> {
        self.check_available()?;
        Ok(self.latest(key_name))
    }

    async fn encrypt(
        &self,
        key_name: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> TransitResult<String> {
        self.check_available()?;
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        let version = self
            .latest(key_name)
            .ok_or_else(|| TransitError::KeyNotFound(key_name.to_string()))?;
        let key = self.context_key(key_name, version, context)?;
        let payload = envelope::encrypt(&Base64::encode_string(plaintext), &key)
            .map_err(|e| TransitError::Malformed(e.to_string()))?;
        let body = serde_json::to_vec(&payload).map_err(|e| TransitError::Malformed(e.to_string()))?;
        Ok(format!("memory:v{version}:{}", Base64::encode_string(&body)))
    }

    async fn decrypt(
        &self,
        key_name: &str,
        ciphertext: &str,
        context: &[u8],
    ) -> TransitResult<Vec<u8>> {
        self.check_available()?;
        let (version, body) = parse_versioned(ciphertext, "memory")?;
        let key = self.context_key(key_name, version, context)?;
        let raw = Base64::decode_vec(body).map_err(|_| TransitError::Rejected("invalid ciphertext".into()))?;
        let payload: EncryptedPayload =
            serde_json::from_slice(&raw).map_err(|_| TransitError::Rejected("invalid ciphertext".into()))?;
        let encoded: String = envelope::decrypt_as(&payload, &key)
            .map_err(|_| TransitError::Rejected("invalid ciphertext".into()))?;
        Base64::decode_vec(&encoded).map_err(|_| TransitError::Rejected("invalid ciphertext".into()))
    }

    async fn rotate_key(&self, key_name: &str) -> TransitResult<u32> {
        self.check_available()?;
        let key = DataKey::generate().map_err(|e| TransitError::Unavailable(e.to_string()))?;
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let versions = keys
            .get_mut(key_name)
            .ok_or_else(|| TransitError::KeyNotFound(key_name.to_string()))?;
        versions.push(key);
        Ok(versions.len() as u32)
    }
}

/// Split a `prefix:v{n}:body` ciphertext.
pub(crate) fn parse_versioned<'a>(ciphertext: &'a str, prefix: &str) -> TransitResult<(u32, &'a str)> {
    let mut parts = ciphertext.splitn(3, ':');
    let (Some(head), Some(version), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TransitError::Rejected("invalid ciphertext".to_string()));
    };
    if head != prefix {
        return Err(TransitError::Rejected("invalid ciphertext".to_string()));
    }
    let version = version
        .strip_prefix('v')
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| TransitError::Rejected("invalid ciphertext".to_string()))?;
    Ok((version, body))
}
