// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Session Reaper
//!
//! Background task that evicts expired project sessions nobody reads again.
//! Reads already treat an expired record as gone; the reaper only reclaims
//! the memory.
//!
//! With [`SessionReaper::with_retention`] each sweep also applies the
//! durable retention rules:
//!
//! - persistent projects expired for longer than the grace period are
//!   deleted with their ciphertext slots
//! - usage records older than the usage retention are purged
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, like every other background
//! task in the server.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::store::SessionStore;
use crate::storage::{CreditLedger, DurableProjectStore};

/// Default interval between sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(300);

/// Retention rules for data that outlives the session map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long an expired persistent project stays listed for cleanup.
    pub expired_grace: TimeDelta,
    pub usage_retention: TimeDelta,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            expired_grace: TimeDelta::days(7),
            usage_retention: TimeDelta::days(365),
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub durable_projects: usize,
    pub usage_records: usize,
}

struct DurableRetention {
    projects: Arc<dyn DurableProjectStore>,
    ledger: Arc<CreditLedger>,
    policy: RetentionPolicy,
}

/// Periodic sweeper for a [`SessionStore`] and, optionally, durable data.
pub struct SessionReaper {
    store: Arc<SessionStore>,
    interval: Duration,
    retention: Option<DurableRetention>,
}

impl SessionReaper {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            interval: DEFAULT_REAP_INTERVAL,
            retention: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(
        mut self,
        projects: Arc<dyn DurableProjectStore>,
        ledger: Arc<CreditLedger>,
        policy: RetentionPolicy,
    ) -> Self {
        self.retention = Some(DurableRetention {
            projects,
            ledger,
            policy,
        });
        self
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(reaper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            durable_retention = self.retention.is_some(),
            "Session reaper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Session reaper shutting down");
                return;
            }

            self.sweep();

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Session reaper shutting down");
                    return;
                }
            }
        }
    }

    /// Run one sweep. Storage failures are logged and retried next sweep.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            sessions: self.store.reap_expired(),
            ..Default::default()
        };
        if report.sessions > 0 {
            info!(
                evicted = report.sessions,
                remaining = self.store.len(),
                "Reaped expired project sessions"
            );
        } else {
            debug!(remaining = self.store.len(), "Reaper sweep found nothing to evict");
        }

        let Some(retention) = &self.retention else {
            return report;
        };
        let now = self.store.now();

        match retention
            .projects
            .delete_expired_before(now - retention.policy.expired_grace)
        {
            Ok(0) => {}
            Ok(removed) => {
                report.durable_projects = removed;
                info!(removed, "Deleted expired persistent projects");
            }
            Err(e) => error!(error = %e, "Durable retention sweep failed"),
        }

        match retention
            .ledger
            .purge_usage_before(now - retention.policy.usage_retention)
        {
            Ok(purged) => report.usage_records = purged,
            Err(e) => error!(error = %e, "Usage retention sweep failed"),
        }

        report
    }
}
