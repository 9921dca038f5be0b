// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Encryption for Persistent Projects
//!
//! - `envelope` - AES-256-GCM sealing of JSON slot values
//! - `kms` - per-user key management over a transit backend with a local
//!   fallback keyring
//!
//! Memory-only projects never pass through this module: their data is never
//! written anywhere that would need encrypting.

pub mod envelope;
pub mod kms;

pub use envelope::{CryptoError, DataKey, EncryptedPayload};
pub use kms::{KeyHandle, KeyManager, KmsError, UserCiphertext};
