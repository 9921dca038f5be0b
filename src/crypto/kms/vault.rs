// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HTTP client for a Vault-compatible secrets-transit engine.
//!
//! ## Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create key | `POST /v1/{mount}/keys/{name}` |
//! | read key | `GET /v1/{mount}/keys/{name}` |
//! | encrypt | `POST /v1/{mount}/encrypt/{name}` |
//! | decrypt | `POST /v1/{mount}/decrypt/{name}` |
//! | rotate | `POST /v1/{mount}/keys/{name}/rotate` |
//!
//! Keys are created as `aes256-gcm96`, `derived = true` (the context is
//! mandatory and bound into every ciphertext) and `exportable = false`.

use std::time::Duration;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::backend::{TransitBackend, TransitError, TransitResult};

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct KeyInfo {
    latest_version: u32,
}

#[derive(Debug, Deserialize)]
struct CiphertextData {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct PlaintextData {
    plaintext: String,
}

/// Transit client for HashiCorp Vault (or an API-compatible service).
#[derive(Clone)]
pub struct VaultTransit {
    base_url: Url,
    mount: String,
    token: String,
    client: Client,
}

impl VaultTransit {
    /// Create a client.
    ///
    /// `timeout` bounds every request; a timeout surfaces as
    /// [`TransitError::Unavailable`].
    pub fn new(
        base_url: Url,
        token: impl Into<String>,
        mount: impl Into<String>,
        timeout: Duration,
    ) -> TransitResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransitError::Unavailable(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            base_url,
            mount: mount.into().trim_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> TransitResult<Url> {
        self.base_url
            .join(&format!("v1/{}/{}", self.mount, path))
            .map_err(|e| TransitError::Malformed(format!("invalid transit URL: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> TransitResult<reqwest::Response> {
        let response = request
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| TransitError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => TransitError::KeyNotFound(body),
            s if s.is_server_error() => TransitError::Unavailable(format!("HTTP {s}")),
            s => TransitError::Rejected(format!("HTTP {s}")),
        })
    }

    async fn read_key(&self, key_name: &str) -> TransitResult<u32> {
        let url = self.endpoint(&format!("keys/{key_name}"))?;
        let response = self.send(self.client.get(url)).await?;
        let info: DataEnvelope<KeyInfo> = response
            .json()
            .await
            .map_err(|e| TransitError::Malformed(e.to_string()))?;
        Ok(info.data.latest_version)
    }
}

#[async_trait]
impl TransitBackend for VaultTransit {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn ensure_key(&self, key_name: &str) -> TransitResult<u32> {
        match self.read_key(key_name).await {
            Ok(version) => return Ok(version),
            Err(TransitError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let url = self.endpoint(&format!("keys/{key_name}"))?;
        let body = json!({
            "type": "aes256-gcm96",
            "derived": true,
            "exportable": false,
            "allow_plaintext_backup": false,
        });
        self.send(self.client.post(url).json(&body)).await?;
        self.read_key(key_name).await
    }

    async fn key_version(&self, key_name: &str) -> TransitResult<Option<u32>> {
        match self.read_key(key_name).await {
            Ok(version) => Ok(Some(version)),
            Err(TransitError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn encrypt(
        &self,
        key_name: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> TransitResult<String> {
        let url = self.endpoint(&format!("encrypt/{key_name}"))?;
        let body = json!({
            "plaintext": Base64::encode_string(plaintext),
            "context": Base64::encode_string(context),
        });
        let response = self.send(self.client.post(url).json(&body)).await?;
        let data: DataEnvelope<CiphertextData> = response
            .json()
            .await
            .map_err(|e| TransitError::Malformed(e.to_string()))?;
        Ok(data.data.ciphertext)
    }

    async fn decrypt(
        &self,
        key_name: &str,
        ciphertext: &str,
        context: &[u8],
    ) -> TransitResult<Vec<u8>> {
        let url = self.endpoint(&format!("decrypt/{key_name}"))?;
        let body = json!({
            "ciphertext": ciphertext,
            "context": Base64::encode_string(context),
        });
        let response = self.send(self.client.post(url).json(&body)).await?;
        let data: DataEnvelope<PlaintextData> = response
            .json()
            .await
            .map_err(|e| TransitError::Malformed(e.to_string()))?;
        Base64::decode_vec(&data.data.plaintext)
            .map_err(|_| TransitError::Malformed("plaintext is not base64".to_string()))
    }

    async fn rotate_key(&self, key_name: &str) -> TransitResult<u32> {
        let url = self.endpoint(&format!("keys/{key_name}/rotate"))?;
        self.send(self.client.post(url)).await?;
        self.read_key(key_name).await
    }
}
