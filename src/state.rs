// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::crypto::KeyManager;
use crate::generation::{ContentGenerator, RetryPolicy};
use crate::projects::ProjectService;
use crate::session::SessionStore;
use crate::storage::{AppDatabase, CreditLedger, ProjectRepository};

/// Token verification settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// HS256 secret. `None` selects development mode.
    pub jwt_secret: Option<String>,
    pub issuer: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<ProjectService>,
    pub sessions: Arc<SessionStore>,
    pub ledger: Arc<CreditLedger>,
    pub keys: Arc<KeyManager>,
    pub db: Arc<AppDatabase>,
    pub auth_config: AuthConfig,
    /// `None` when no generator endpoint is configured.
    pub generator: Option<Arc<dyn ContentGenerator>>,
    pub retry: RetryPolicy,
}

impl AppState {
    /// Wire the service graph over one database and session store.
    pub fn new(db: Arc<AppDatabase>, sessions: Arc<SessionStore>, keys: Arc<KeyManager>) -> Self {
        let ledger = CreditLedger::new(db.clone());
        Self::with_ledger(db, sessions, keys, ledger)
    }

    /// Same as [`AppState::new`] with a preconfigured ledger.
    pub fn with_ledger(
        db: Arc<AppDatabase>,
        sessions: Arc<SessionStore>,
        keys: Arc<KeyManager>,
        ledger: CreditLedger,
    ) -> Self {
        let ledger = Arc::new(ledger);
        let durable = Arc::new(ProjectRepository::new(db.clone()));
        let projects = Arc::new(ProjectService::new(
            sessions.clone(),
            durable,
            keys.clone(),
            ledger.clone(),
        ));

        Self {
            projects,
            sessions,
            ledger,
            keys,
            db,
            auth_config: AuthConfig::default(),
            generator: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_auth_config(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ContentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// State over a temporary database with an in-memory transit backend.
#[cfg(test)]
pub(crate) fn test_state() -> (AppState, tempfile::TempDir) {
    use crate::session::SessionTtl;
    use crate::storage::database::temp_db;

    let (db, dir) = temp_db();
    let sessions = Arc::new(SessionStore::new(SessionTtl::default()));
    let keys = crate::projects::tests::key_manager();
    (AppState::new(db, sessions, keys), dir)
}
