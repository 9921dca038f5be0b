// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process project session store.
//!
//! ## Guarantees
//!
//! - **Ownership**: every operation takes the caller's user id. A record
//!   owned by someone else is reported exactly like a missing one.
//! - **Expiry**: every read re-checks `expires_at`. An expired record is
//!   evicted by the read that finds it ("read triggers reap"); the
//!   [`SessionReaper`](super::SessionReaper) sweeps the ones nobody reads.
//! - **Export-then-purge**: [`SessionStore::export_and_delete`] removes the
//!   record and hands back the removed value in one step, so no caller can
//!   see it both exported and still present.
//!
//! The backing [`DashMap`] locks per shard. Operations on one record never
//! block the whole map, and the sweep collects ids before removing them.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::record::{OwnedResource, ProjectRecord, ProjectSlots, SlotName, StorageMode};

/// Default lifetime of a memory-only project.
pub const DEFAULT_MEMORY_TTL: TimeDelta = TimeDelta::hours(24);

/// Default lifetime of a persistent project.
pub const DEFAULT_PERSISTENT_TTL: TimeDelta = TimeDelta::days(30);

/// Lifetimes applied when no explicit expiry is supplied.
#[derive(Debug, Clone, Copy)]
pub struct SessionTtl {
    pub memory_only: TimeDelta,
    pub persistent: TimeDelta,
}

impl Default for SessionTtl {
    fn default() -> Self {
        Self {
            memory_only: DEFAULT_MEMORY_TTL,
            persistent: DEFAULT_PERSISTENT_TTL,
        }
    }
}

impl SessionTtl {
    pub fn for_mode(&self, mode: StorageMode) -> TimeDelta {
        match mode {
            StorageMode::MemoryOnly => self.memory_only,
            StorageMode::Persistent => self.persistent,
        }
    }
}

/// Snapshot counters for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SessionStats {
    pub total: usize,
    pub memory_only: usize,
    pub persistent: usize,
    /// Past expiry but not yet evicted.
    pub awaiting_reap: usize,
}

/// Keyed map from project id to project record.
pub struct SessionStore {
    sessions: DashMap<String, ProjectRecord>,
    ttl: SessionTtl,
    clock: Arc<dyn Clock>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionTtl::default())
    }
}

impl SessionStore {
    pub fn new(ttl: SessionTtl) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: SessionTtl, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ttl(&self) -> SessionTtl {
        self.ttl
    }

    /// Number of records held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a record with all six slots empty. Returns its id.
    pub fn create_project_session(
        &self,
        owner_id: &str,
        name: &str,
        persistent: bool,
        custom_expiry: Option<DateTime<Utc>>,
    ) -> String {
        let now = self.clock.now();
        let storage_mode = StorageMode::from_persistent_flag(persistent);
        let id = format!("{}-{}", storage_mode.id_prefix(), Uuid::new_v4());
        let expires_at = custom_expiry.unwrap_or_else(|| now + self.ttl.for_mode(storage_mode));

        let record = ProjectRecord {
            id: id.clone(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            created_at: now,
            last_accessed_at: now,
            expires_at,
            slots: ProjectSlots::default(),
            storage_mode,
            durable_fields: Default::default(),
        };
        self.sessions.insert(id.clone(), record);

        debug!(project_id = %id, ?storage_mode, %expires_at, "Project session created");
        id
    }

    /// Fetch a live record owned by `owner_id` and refresh its access time.
    pub fn get_project_session(&self, id: &str, owner_id: &str) -> Option<ProjectRecord> {
        let now = self.clock.now();
        let mut entry = self.sessions.get_mut(id)?;
        if !entry.is_owned_by(owner_id) {
            return None;
        }
        if entry.is_expired_at(now) {
            drop(entry);
            self.evict_if_expired(id, now);
            return None;
        }
        entry.last_accessed_at = now;
        Some(entry.clone())
    }

    /// Write one slot. `false` when the record is missing, foreign or
    /// expired, or when the value is `null`.
    pub fn update_project_data(
        &self,
        id: &str,
        owner_id: &str,
        slot: SlotName,
        value: Value,
    ) -> bool {
        if value.is_null() {
            return false;
        }

        let now = self.clock.now();
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return false;
        };
        if !entry.is_owned_by(owner_id) {
            return false;
        }
        if entry.is_expired_at(now) {
            drop(entry);
            self.evict_if_expired(id, now);
            return false;
        }

        entry.slots.set(slot, value);
        entry.last_accessed_at = now;
        true
    }

    /// All live records of the owner, most recently accessed first.
    pub fn get_user_project_sessions(&self, owner_id: &str) -> Vec<ProjectRecord> {
        let now = self.clock.now();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            let record = entry.value();
            if !record.is_owned_by(owner_id) {
                continue;
            }
            if record.is_expired_at(now) {
                expired.push(record.id.clone());
            } else {
                live.push(record.clone());
            }
        }

        for id in expired {
            self.evict_if_expired(&id, now);
        }

        live.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        live
    }

    /// Remove a record after the ownership check.
    pub fn delete_project_session(&self, id: &str, owner_id: &str) -> bool {
        let now = self.clock.now();
        match self.sessions.remove_if(id, |_, record| record.is_owned_by(owner_id)) {
            Some((_, record)) => !record.is_expired_at(now),
            None => false,
        }
    }

    /// Remove the record and return what it held at removal time.
    ///
    /// The removal happens under the shard lock, so concurrent readers see
    /// either the full record or nothing.
    pub fn export_and_delete(&self, id: &str, owner_id: &str) -> Option<ProjectRecord> {
        let now = self.clock.now();
        let (_, record) = self
            .sessions
            .remove_if(id, |_, record| record.is_owned_by(owner_id))?;
        if record.is_expired_at(now) {
            return None;
        }
        debug!(project_id = %id, "Project session exported and removed");
        Some(record)
    }

    /// Put back a persistent record loaded from durable storage.
    ///
    /// Refuses memory-only records (they have no durable copy to come back
    /// from), expired records, and ids already present.
    pub fn restore_session(&self, record: ProjectRecord) -> bool {
        if record.is_memory_only() || record.is_expired_at(self.clock.now()) {
            return false;
        }
        match self.sessions.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Remove every record of the owner, expired or not.
    pub fn delete_user_sessions(&self, owner_id: &str) -> usize {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_owned_by(owner_id))
            .map(|entry| entry.key().clone())
            .collect();

        ids.iter()
            .filter(|id| {
                self.sessions
                    .remove_if(id.as_str(), |_, record| record.is_owned_by(owner_id))
                    .is_some()
            })
            .count()
    }

    /// Evict every expired record. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|id| self.evict_if_expired(id, now))
            .count()
    }

    pub fn stats(&self) -> SessionStats {
        let now = self.clock.now();
        let mut stats = SessionStats::default();
        for entry in self.sessions.iter() {
            let record = entry.value();
            stats.total += 1;
            match record.storage_mode {
                StorageMode::MemoryOnly => stats.memory_only += 1,
                StorageMode::Persistent => stats.persistent += 1,
            }
            if record.is_expired_at(now) {
                stats.awaiting_reap += 1;
            }
        }
        stats
    }

    /// Remove the record only if it is still expired at `now`.
    fn evict_if_expired(&self, id: &str, now: DateTime<Utc>) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, record| record.is_expired_at(now))
            .is_some();
        if removed {
            debug!(project_id = %id, "Expired project session evicted");
        }
        removed
    }
}
