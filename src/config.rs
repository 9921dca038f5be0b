// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the application. Configuration is loaded from the environment
//! once at startup into [`AppConfig`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATA_DIR` | Directory holding the redb database | `./data` |
//! | `SESSION_TTL_HOURS` | Lifetime of memory-only projects | `24` |
//! | `PERSISTENT_TTL_DAYS` | Lifetime of persistent projects | `30` |
//! | `REAPER_INTERVAL_SECS` | Interval between expiry sweeps | `300` |
//! | `EXPIRED_GRACE_DAYS` | How long expired persistent projects stay listed before the sweep deletes them | `7` |
//! | `USAGE_RETENTION_DAYS` | Age after which usage records are purged | `365` |
//! | `INITIAL_CREDITS` | Credits a new user starts with | `11` |
//! | `KMS_BACKEND` | `vault`, `memory` or `none` | `vault` if `KMS_URL` is set, else `none` |
//! | `KMS_URL` | Transit backend base URL | Required for `vault` |
//! | `KMS_TOKEN` | Transit backend token | Required for `vault` |
//! | `KMS_MOUNT` | Transit secrets engine mount | `transit` |
//! | `KMS_TIMEOUT_MS` | Bound on each transit call | `5000` |
//! | `LOCAL_ENCRYPTION_KEY` | Base64 32-byte master key of the local keyring | Random per process |
//! | `AUTH_JWT_SECRET` | HS256 secret for session tokens | Required for production |
//! | `AUTH_ISSUER` | Expected JWT issuer claim | Optional |
//! | `GENERATOR_URL` | Text-generation endpoint | Generation disabled |
//! | `GENERATOR_API_KEY` | Text-generation API key | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use url::Url;

use crate::crypto::kms::DEFAULT_REMOTE_TIMEOUT;
use crate::crypto::DataKey;
use crate::session::reaper::{RetentionPolicy, DEFAULT_REAP_INTERVAL};
use crate::session::SessionTtl;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";

/// Environment variable name for the database directory.
///
/// Only persistent projects and the credit ledger are written here.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

pub const SESSION_TTL_HOURS_ENV: &str = "SESSION_TTL_HOURS";
pub const PERSISTENT_TTL_DAYS_ENV: &str = "PERSISTENT_TTL_DAYS";
pub const REAPER_INTERVAL_SECS_ENV: &str = "REAPER_INTERVAL_SECS";
pub const EXPIRED_GRACE_DAYS_ENV: &str = "EXPIRED_GRACE_DAYS";
pub const USAGE_RETENTION_DAYS_ENV: &str = "USAGE_RETENTION_DAYS";
pub const INITIAL_CREDITS_ENV: &str = "INITIAL_CREDITS";

pub const KMS_BACKEND_ENV: &str = "KMS_BACKEND";
pub const KMS_URL_ENV: &str = "KMS_URL";
pub const KMS_TOKEN_ENV: &str = "KMS_TOKEN";
pub const KMS_MOUNT_ENV: &str = "KMS_MOUNT";
pub const KMS_TIMEOUT_MS_ENV: &str = "KMS_TIMEOUT_MS";

/// Environment variable name for the local keyring master key.
///
/// When unset a random key is generated at startup. Locally encrypted data
/// then becomes unreadable after a restart, so production deployments must
/// set it.
pub const LOCAL_ENCRYPTION_KEY_ENV: &str = "LOCAL_ENCRYPTION_KEY";

pub const AUTH_JWT_SECRET_ENV: &str = "AUTH_JWT_SECRET";
pub const AUTH_ISSUER_ENV: &str = "AUTH_ISSUER";

pub const GENERATOR_URL_ENV: &str = "GENERATOR_URL";
pub const GENERATOR_API_KEY_ENV: &str = "GENERATOR_API_KEY";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_KMS_MOUNT: &str = "transit";
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";
pub const DEFAULT_EXPIRED_GRACE_DAYS: i64 = 7;
pub const DEFAULT_USAGE_RETENTION_DAYS: i64 = 365;

/// Enough for one full pipeline run at the default stage costs.
pub const DEFAULT_INITIAL_CREDITS: u64 = 11;

/// Database file name inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "ventura.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Which transit backend the key manager talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsBackend {
    Vault { url: Url, token: String, mount: String },
    /// In-process backend, for development.
    Memory,
    /// Local keyring only.
    None,
}

#[derive(Debug, Clone)]
pub struct KmsConfig {
    pub backend: KmsBackend,
    pub timeout: Duration,
    pub local_key: Option<DataKey>,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub url: Url,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub session_ttl: SessionTtl,
    pub reaper_interval: Duration,
    pub retention: RetentionPolicy,
    pub initial_credits: u64,
    pub kms: KmsConfig,
    pub jwt_secret: Option<String>,
    pub issuer: Option<String>,
    pub generator: Option<GeneratorConfig>,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let session_hours: i64 = parse_or(&get, SESSION_TTL_HOURS_ENV, 24)?;
        let persistent_days: i64 = parse_or(&get, PERSISTENT_TTL_DAYS_ENV, 30)?;
        if session_hours <= 0 {
            return Err(invalid(SESSION_TTL_HOURS_ENV, "must be positive"));
        }
        if persistent_days <= 0 {
            return Err(invalid(PERSISTENT_TTL_DAYS_ENV, "must be positive"));
        }

        let reaper_secs: u64 =
            parse_or(&get, REAPER_INTERVAL_SECS_ENV, DEFAULT_REAP_INTERVAL.as_secs())?;
        if reaper_secs == 0 {
            return Err(invalid(REAPER_INTERVAL_SECS_ENV, "must be positive"));
        }

        let grace_days: i64 = parse_or(&get, EXPIRED_GRACE_DAYS_ENV, DEFAULT_EXPIRED_GRACE_DAYS)?;
        if grace_days < 0 {
            return Err(invalid(EXPIRED_GRACE_DAYS_ENV, "must not be negative"));
        }
        let usage_days: i64 =
            parse_or(&get, USAGE_RETENTION_DAYS_ENV, DEFAULT_USAGE_RETENTION_DAYS)?;
        if usage_days <= 0 {
            return Err(invalid(USAGE_RETENTION_DAYS_ENV, "must be positive"));
        }

        let generator = match get(GENERATOR_URL_ENV) {
            Some(url) => Some(GeneratorConfig {
                url: parse_url(GENERATOR_URL_ENV, &url)?,
                api_key: get(GENERATOR_API_KEY_ENV),
            }),
            None => None,
        };

        let log_format = match get(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            host: get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&get, PORT_ENV, DEFAULT_PORT)?,
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            session_ttl: SessionTtl {
                memory_only: TimeDelta::hours(session_hours),
                persistent: TimeDelta::days(persistent_days),
            },
            reaper_interval: Duration::from_secs(reaper_secs),
            retention: RetentionPolicy {
                expired_grace: TimeDelta::days(grace_days),
                usage_retention: TimeDelta::days(usage_days),
            },
            initial_credits: parse_or(&get, INITIAL_CREDITS_ENV, DEFAULT_INITIAL_CREDITS)?,
            kms: kms_config(&get)?,
            jwt_secret: get(AUTH_JWT_SECRET_ENV),
            issuer: get(AUTH_ISSUER_ENV),
            generator,
            log_format,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn kms_config<G>(get: &G) -> Result<KmsConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let url = get(KMS_URL_ENV);
    let kind = get(KMS_BACKEND_ENV)
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_else(|| if url.is_some() { "vault" } else { "none" }.to_string());

    let backend = match kind.as_str() {
        "vault" => {
            let url = url.ok_or(ConfigError::Missing(KMS_URL_ENV))?;
            KmsBackend::Vault {
                url: parse_url(KMS_URL_ENV, &url)?,
                token: get(KMS_TOKEN_ENV).ok_or(ConfigError::Missing(KMS_TOKEN_ENV))?,
                mount: get(KMS_MOUNT_ENV).unwrap_or_else(|| DEFAULT_KMS_MOUNT.to_string()),
            }
        }
        "memory" => KmsBackend::Memory,
        "none" => KmsBackend::None,
        other => {
            return Err(invalid(
                KMS_BACKEND_ENV,
                &format!("unknown backend '{other}' (expected vault, memory or none)"),
            ))
        }
    };

    let timeout_ms: u64 = parse_or(
        get,
        KMS_TIMEOUT_MS_ENV,
        DEFAULT_REMOTE_TIMEOUT.as_millis() as u64,
    )?;

    let local_key = match get(LOCAL_ENCRYPTION_KEY_ENV) {
        Some(encoded) => Some(
            DataKey::from_base64(encoded.trim())
                .map_err(|e| invalid(LOCAL_ENCRYPTION_KEY_ENV, &e.to_string()))?,
        ),
        None => None,
    };

    Ok(KmsConfig {
        backend,
        timeout: Duration::from_millis(timeout_ms),
        local_key,
    })
}

fn parse_or<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &e.to_string())),
        None => Ok(default),
    }
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| invalid(name, &e.to_string()))
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.database_path(), PathBuf::from("./data/ventura.redb"));
        assert_eq!(config.session_ttl.memory_only, TimeDelta::hours(24));
        assert_eq!(config.session_ttl.persistent, TimeDelta::days(30));
        assert_eq!(config.reaper_interval, Duration::from_secs(300));
        assert_eq!(config.retention.expired_grace, TimeDelta::days(7));
        assert_eq!(config.retention.usage_retention, TimeDelta::days(365));
        assert_eq!(config.initial_credits, DEFAULT_INITIAL_CREDITS);
        assert_eq!(config.kms.backend, KmsBackend::None);
        assert_eq!(config.kms.timeout, Duration::from_secs(5));
        assert!(config.kms.local_key.is_none());
        assert!(config.generator.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn vault_is_selected_by_url() {
        let config = load(&[
            (KMS_URL_ENV, "https://vault.internal:8200"),
            (KMS_TOKEN_ENV, "s.token"),
        ])
        .unwrap();
        match config.kms.backend {
            KmsBackend::Vault { url, token, mount } => {
                assert_eq!(url.as_str(), "https://vault.internal:8200/");
                assert_eq!(token, "s.token");
                assert_eq!(mount, "transit");
            }
            other => panic!("expected vault backend, got {other:?}"),
        }
    }

    #[test]
    fn vault_requires_token() {
        let err = load(&[(KMS_URL_ENV, "https://vault.internal:8200")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(KMS_TOKEN_ENV)));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[(PORT_ENV, "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = load(&[(KMS_BACKEND_ENV, "hsm")]).unwrap_err();
        assert!(err.to_string().contains("hsm"));

        assert!(load(&[(SESSION_TTL_HOURS_ENV, "0")]).is_err());
        assert!(load(&[(USAGE_RETENTION_DAYS_ENV, "0")]).is_err());
        assert!(load(&[(EXPIRED_GRACE_DAYS_ENV, "-1")]).is_err());
        assert!(load(&[(INITIAL_CREDITS_ENV, "-5")]).is_err());
        assert!(load(&[(LOCAL_ENCRYPTION_KEY_ENV, "too-short")]).is_err());
    }

    #[test]
    fn explicit_settings_are_read() {
        let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [9u8; 32]);
        let config = load(&[
            (SESSION_TTL_HOURS_ENV, "2"),
            (REAPER_INTERVAL_SECS_ENV, "60"),
            (EXPIRED_GRACE_DAYS_ENV, "0"),
            (INITIAL_CREDITS_ENV, "0"),
            (KMS_BACKEND_ENV, "memory"),
            (KMS_TIMEOUT_MS_ENV, "250"),
            (LOCAL_ENCRYPTION_KEY_ENV, &key),
            (GENERATOR_URL_ENV, "https://llm.example/v1/generate"),
            (LOG_FORMAT_ENV, "json"),
            (AUTH_JWT_SECRET_ENV, "secret"),
        ])
        .unwrap();

        assert_eq!(config.session_ttl.memory_only, TimeDelta::hours(2));
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.retention.expired_grace, TimeDelta::zero());
        assert_eq!(config.initial_credits, 0);
        assert_eq!(config.kms.backend, KmsBackend::Memory);
        assert_eq!(config.kms.timeout, Duration::from_millis(250));
        assert_eq!(config.kms.local_key, Some(DataKey::from_bytes([9u8; 32])));
        assert!(config.generator.is_some());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.jwt_secret.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = load(&[(PORT_ENV, ""), (KMS_URL_ENV, "  ")]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.kms.backend, KmsBackend::None);
    }
}
