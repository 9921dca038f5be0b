// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM envelope for project slot values.
//!
//! ## Format
//!
//! A slot value is serialized to canonical JSON (object keys sorted), sealed
//! with AES-256-GCM under a 96-bit random nonce, and split into three
//! independently base64-encoded parts:
//!
//! ```text
//! { "ciphertext": "...", "iv": "...", "auth_tag": "..." }
//! ```
//!
//! Every seal binds [`ASSOCIATED_DATA`] so a ciphertext produced by another
//! application or context fails authentication here.
//!
//! ## Failure Model
//!
//! Decryption is fail-closed. A wrong key, a flipped bit in any part, a
//! truncated part or malformed base64 all return the same
//! [`CryptoError::DecryptionFailed`]; callers never learn which part failed.

use std::fmt;

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use utoipa::ToSchema;

/// Associated data bound into every envelope.
pub const ASSOCIATED_DATA: &[u8] = b"ventura:project-data:v1";

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by the envelope.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Key material has the wrong length or encoding.
    #[error("invalid key material")]
    InvalidKey,

    /// The value could not be serialized before sealing.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The system random source failed.
    #[error("secure random source unavailable")]
    RandomUnavailable,

    /// Sealing failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Generic open failure. Intentionally carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    /// Generate a fresh random key.
    pub fn generate() -> CryptoResult<Self> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::RandomUnavailable)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from standard base64.
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let raw = Base64::decode_vec(encoded.trim()).map_err(|_| CryptoError::InvalidKey)?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Derive a sub-key as `HMAC-SHA256(self, label)`.
    pub fn derive(&self, label: &str) -> CryptoResult<Self> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKey)?;
        mac.update(label.as_bytes());
        let digest = mac.finalize().into_bytes();
        let bytes: [u8; KEY_LEN] = digest
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(bytes))
    }

    fn aead_key(&self) -> CryptoResult<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Sealed slot value, every part base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Seal a value under `key` with a fresh random nonce.
pub fn encrypt<T: Serialize + ?Sized>(value: &T, key: &DataKey) -> CryptoResult<EncryptedPayload> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    encrypt_with_nonce(value, key, nonce)
}

/// Seal a value with a caller-supplied nonce.
///
/// Deterministic for a given key and nonce. Production paths go through
/// [`encrypt`]; reusing a nonce under one key breaks GCM.
pub fn encrypt_with_nonce<T: Serialize + ?Sized>(
    value: &T,
    key: &DataKey,
    nonce: [u8; NONCE_LEN],
) -> CryptoResult<EncryptedPayload> {
    let mut in_out = canonical_json(value)?;
    let sealing_key = key.aead_key()?;
    let tag = sealing_key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(ASSOCIATED_DATA),
            &mut in_out,
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(EncryptedPayload {
        ciphertext: Base64::encode_string(&in_out),
        iv: Base64::encode_string(&nonce),
        auth_tag: Base64::encode_string(tag.as_ref()),
    })
}

/// Open a payload back into a JSON value.
pub fn decrypt(payload: &EncryptedPayload, key: &DataKey) -> CryptoResult<serde_json::Value> {
    decrypt_as(payload, key)
}

/// Open a payload and deserialize it into `T`.
pub fn decrypt_as<T: DeserializeOwned>(payload: &EncryptedPayload, key: &DataKey) -> CryptoResult<T> {
    let plaintext = open(payload, key)?;
    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

fn open(payload: &EncryptedPayload, key: &DataKey) -> CryptoResult<Vec<u8>> {
    let nonce_bytes = Base64::decode_vec(&payload.iv).map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let tag = Base64::decode_vec(&payload.auth_tag).map_err(|_| CryptoError::DecryptionFailed)?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut in_out =
        Base64::decode_vec(&payload.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    in_out.extend_from_slice(&tag);

    let opening_key = key.aead_key().map_err(|_| CryptoError::DecryptionFailed)?;
    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(ASSOCIATED_DATA), &mut in_out)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(plaintext.to_vec())
}

/// Serialize through `serde_json::Value` so object keys come out sorted.
fn canonical_json<T: Serialize + ?Sized>(value: &T) -> CryptoResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}
