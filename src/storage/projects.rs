// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable projection of persistent projects.
//!
//! One metadata row per project plus up to six slot entries, each holding the
//! [`UserCiphertext`] produced by the key manager. Nothing here decrypts.
//!
//! ## Privacy
//!
//! Every write takes a [`PersistentProjectId`], which can only be obtained
//! from a record whose storage mode is `PERSISTENT`. A memory-only record
//! therefore has no way to name a durable write target. The repository also
//! re-checks the stored metadata and answers any mismatch with
//! [`StorageError::PrivacyViolation`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::database::{
    AppDatabase, StorageError, StorageResult, OWNER_PROJECTS, PROJECTS, PROJECT_SLOTS,
};
use crate::crypto::UserCiphertext;
use crate::session::{ProjectRecord, ProjectSlots, SlotName, StorageMode};

/// Write capability for one persistent project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentProjectId {
    project_id: String,
    owner_id: String,
}

impl PersistentProjectId {
    /// `None` for memory-only records.
    pub fn for_record(record: &ProjectRecord) -> Option<Self> {
        match record.storage_mode {
            StorageMode::Persistent => Some(Self {
                project_id: record.id.clone(),
                owner_id: record.owner_id.clone(),
            }),
            StorageMode::MemoryOnly => None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

/// Non-sensitive metadata row of a persistent project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub storage_mode: StorageMode,
}

impl PersistedProject {
    pub fn from_record(record: &ProjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            name: record.name.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            storage_mode: record.storage_mode,
        }
    }

    /// Rebuild a session record around decrypted slot values.
    pub fn into_record(
        self,
        slots: ProjectSlots,
        durable_fields: BTreeSet<SlotName>,
        now: DateTime<Utc>,
    ) -> ProjectRecord {
        ProjectRecord {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            created_at: self.created_at,
            last_accessed_at: now,
            expires_at: self.expires_at,
            slots,
            storage_mode: self.storage_mode,
            durable_fields,
        }
    }
}

/// Durable storage boundary for persistent projects.
pub trait DurableProjectStore: Send + Sync {
    fn put_project(&self, id: &PersistentProjectId, meta: &PersistedProject) -> StorageResult<()>;

    fn put_slot(
        &self,
        id: &PersistentProjectId,
        slot: SlotName,
        blob: &UserCiphertext,
    ) -> StorageResult<()>;

    fn get_project(&self, project_id: &str) -> StorageResult<Option<PersistedProject>>;

    fn get_slots(&self, project_id: &str) -> StorageResult<BTreeMap<SlotName, UserCiphertext>>;

    /// Slots holding a value for `project_id`, regardless of its mode.
    fn populated_slots(&self, project_id: &str) -> StorageResult<BTreeSet<SlotName>>;

    fn list_by_owner(&self, owner_id: &str) -> StorageResult<Vec<PersistedProject>>;

    /// Remove metadata and every slot. `false` when nothing was stored.
    fn delete_project(&self, project_id: &str) -> StorageResult<bool>;

    /// Remove every project of the owner. Returns the number removed.
    fn delete_owner(&self, owner_id: &str) -> StorageResult<usize>;

    /// Remove every project whose expiry is before `cutoff`. Returns the
    /// number removed.
    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

/// redb-backed [`DurableProjectStore`].
pub struct ProjectRepository {
    db: Arc<AppDatabase>,
}

impl ProjectRepository {
    pub fn new(db: Arc<AppDatabase>) -> Self {
        Self { db }
    }

    fn check_capability(id: &PersistentProjectId, meta: &PersistedProject) -> StorageResult<()> {
        if meta.storage_mode != StorageMode::Persistent {
            warn!(project_id = %meta.id, "Blocked durable write for memory-only project");
            return Err(StorageError::PrivacyViolation(meta.id.clone()));
        }
        if meta.id != id.project_id || meta.owner_id != id.owner_id {
            return Err(StorageError::NotFound(format!("Project {}", id.project_id)));
        }
        Ok(())
    }
}

impl DurableProjectStore for ProjectRepository {
    fn put_project(&self, id: &PersistentProjectId, meta: &PersistedProject) -> StorageResult<()> {
        Self::check_capability(id, meta)?;
        let json = serde_json::to_vec(meta)?;

        let write_txn = self.db.inner().begin_write()?;
        {
            let mut projects = write_txn.open_table(PROJECTS)?;
            projects.insert(meta.id.as_str(), json.as_slice())?;

            let mut index = write_txn.open_table(OWNER_PROJECTS)?;
            index.insert((meta.owner_id.as_str(), meta.id.as_str()), ())?;
        }
        write_txn.commit()?;

        debug!(project_id = %meta.id, "Persisted project metadata");
        Ok(())
    }

    fn put_slot(
        &self,
        id: &PersistentProjectId,
        slot: SlotName,
        blob: &UserCiphertext,
    ) -> StorageResult<()> {
        let json = serde_json::to_vec(blob)?;

        let write_txn = self.db.inner().begin_write()?;
        {
            let projects = write_txn.open_table(PROJECTS)?;
            // Read existing metadata and deserialize before mutating
            let meta_bytes = {
                let existing = projects
                    .get(id.project_id())?
                    .ok_or_else(|| StorageError::NotFound(format!("Project {}", id.project_id)))?;
                existing.value().to_vec()
            };
            let meta: PersistedProject = serde_json::from_slice(&meta_bytes)?;
            Self::check_capability(id, &meta)?;

            let mut slots = write_txn.open_table(PROJECT_SLOTS)?;
            slots.insert((id.project_id(), slot.as_str()), json.as_slice())?;
        }
        write_txn.commit()?;

        debug!(project_id = %id.project_id, %slot, "Persisted encrypted slot");
        Ok(())
    }

    fn get_project(&self, project_id: &str) -> StorageResult<Option<PersistedProject>> {
        let read_txn = self.db.inner().begin_read()?;
        let table = read_txn.open_table(PROJECTS)?;
        match table.get(project_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn get_slots(&self, project_id: &str) -> StorageResult<BTreeMap<SlotName, UserCiphertext>> {
        let read_txn = self.db.inner().begin_read()?;
        let table = read_txn.open_table(PROJECT_SLOTS)?;

        let mut slots = BTreeMap::new();
        for slot in SlotName::ALL {
            if let Some(value) = table.get((project_id, slot.as_str()))? {
                slots.insert(slot, serde_json::from_slice(value.value())?);
            }
        }
        Ok(slots)
    }

    fn populated_slots(&self, project_id: &str) -> StorageResult<BTreeSet<SlotName>> {
        let read_txn = self.db.inner().begin_read()?;
        let table = read_txn.open_table(PROJECT_SLOTS)?;

        let mut populated = BTreeSet::new();
        for slot in SlotName::ALL {
            if table.get((project_id, slot.as_str()))?.is_some() {
                populated.insert(slot);
            }
        }
        Ok(populated)
    }

    fn list_by_owner(&self, owner_id: &str) -> StorageResult<Vec<PersistedProject>> {
        let read_txn = self.db.inner().begin_read()?;
        let index = read_txn.open_table(OWNER_PROJECTS)?;
        let projects = read_txn.open_table(PROJECTS)?;

        let mut results = Vec::new();
        for entry in index.range((owner_id, "")..)? {
            let (key, _) = entry?;
            let (owner, project_id) = key.value();
            if owner != owner_id {
                break;
            }
            if let Some(value) = projects.get(project_id)? {
                results.push(serde_json::from_slice::<PersistedProject>(value.value())?);
            }
        }
        Ok(results)
    }

    fn delete_project(&self, project_id: &str) -> StorageResult<bool> {
        let write_txn = self.db.inner().begin_write()?;
        let removed = {
            let mut projects = write_txn.open_table(PROJECTS)?;
            let meta_bytes = projects.remove(project_id)?.map(|v| v.value().to_vec());

            let mut slots = write_txn.open_table(PROJECT_SLOTS)?;
            let mut removed_slot = false;
            for slot in SlotName::ALL {
                removed_slot |= slots.remove((project_id, slot.as_str()))?.is_some();
            }

            if let Some(bytes) = &meta_bytes {
                let meta: PersistedProject = serde_json::from_slice(bytes)?;
                let mut index = write_txn.open_table(OWNER_PROJECTS)?;
                index.remove((meta.owner_id.as_str(), project_id))?;
            }
            meta_bytes.is_some() || removed_slot
        };
        write_txn.commit()?;

        if removed {
            debug!(project_id = %project_id, "Deleted durable project copy");
        }
        Ok(removed)
    }

    fn delete_owner(&self, owner_id: &str) -> StorageResult<usize> {
        let ids: Vec<String> = self
            .list_by_owner(owner_id)?
            .into_iter()
            .map(|meta| meta.id)
            .collect();

        let mut removed = 0;
        for id in &ids {
            if self.delete_project(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.inner().begin_read()?;
            let projects = read_txn.open_table(PROJECTS)?;
            let mut ids = Vec::new();
            for entry in projects.iter()? {
                let (_, value) = entry?;
                let meta: PersistedProject = serde_json::from_slice(value.value())?;
                if meta.expires_at < cutoff {
                    ids.push(meta.id);
                }
            }
            ids
        };

        let mut removed = 0;
        for id in &expired {
            if self.delete_project(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::envelope::EncryptedPayload;
    use crate::storage::database::temp_db;
    use chrono::TimeDelta;

    fn record(id: &str, owner: &str, mode: StorageMode) -> ProjectRecord {
        let now = Utc::now();
        ProjectRecord {
            id: id.into(),
            owner_id: owner.into(),
            name: "Test Co".into(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + TimeDelta::days(30),
            slots: ProjectSlots::default(),
            storage_mode: mode,
            durable_fields: BTreeSet::new(),
        }
    }

    fn blob(tag: &str) -> UserCiphertext {
        UserCiphertext::LocalEncrypted {
            user_id: "u1".into(),
            key_version: 1,
            payload: EncryptedPayload {
                ciphertext: tag.into(),
                iv: "iv".into(),
                auth_tag: "tag".into(),
            },
        }
    }

    fn persisted(repo: &ProjectRepository, record: &ProjectRecord) -> PersistentProjectId {
        let id = PersistentProjectId::for_record(record).unwrap();
        repo.put_project(&id, &PersistedProject::from_record(record)).unwrap();
        id
    }

    #[test]
    fn memory_only_records_have_no_write_capability() {
        let r = record("session-1", "u1", StorageMode::MemoryOnly);
        assert!(PersistentProjectId::for_record(&r).is_none());
    }

    #[test]
    fn metadata_and_slots_round_trip() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let r = record("persistent-1", "u1", StorageMode::Persistent);
        let id = persisted(&repo, &r);

        repo.put_slot(&id, SlotName::Idea, &blob("a")).unwrap();
        repo.put_slot(&id, SlotName::Pitch, &blob("b")).unwrap();
        repo.put_slot(&id, SlotName::Idea, &blob("c")).unwrap();

        let meta = repo.get_project("persistent-1").unwrap().unwrap();
        assert_eq!(meta, PersistedProject::from_record(&r));

        let slots = repo.get_slots("persistent-1").unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[&SlotName::Idea], blob("c"));
        assert_eq!(
            repo.populated_slots("persistent-1").unwrap(),
            BTreeSet::from([SlotName::Idea, SlotName::Pitch])
        );
    }

    #[test]
    fn slot_write_without_metadata_is_rejected() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let id = PersistentProjectId::for_record(&record("persistent-x", "u1", StorageMode::Persistent))
            .unwrap();
        assert!(matches!(
            repo.put_slot(&id, SlotName::Idea, &blob("a")),
            Err(StorageError::NotFound(_))
        ));
        assert!(repo.populated_slots("persistent-x").unwrap().is_empty());
    }

    #[test]
    fn metadata_claiming_memory_only_is_refused() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let r = record("persistent-2", "u1", StorageMode::Persistent);
        let id = PersistentProjectId::for_record(&r).unwrap();

        let mut meta = PersistedProject::from_record(&r);
        meta.storage_mode = StorageMode::MemoryOnly;
        assert!(matches!(
            repo.put_project(&id, &meta),
            Err(StorageError::PrivacyViolation(_))
        ));
        assert!(repo.get_project("persistent-2").unwrap().is_none());
    }

    #[test]
    fn capability_must_match_metadata_owner() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let mine = record("persistent-3", "u1", StorageMode::Persistent);
        persisted(&repo, &mine);

        let mut forged = mine.clone();
        forged.owner_id = "u2".into();
        let forged_id = PersistentProjectId::for_record(&forged).unwrap();
        assert!(repo.put_slot(&forged_id, SlotName::Idea, &blob("x")).is_err());
    }

    #[test]
    fn list_by_owner_is_scoped() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        persisted(&repo, &record("persistent-a", "u1", StorageMode::Persistent));
        persisted(&repo, &record("persistent-b", "u1", StorageMode::Persistent));
        persisted(&repo, &record("persistent-c", "u10", StorageMode::Persistent));

        let mut ids: Vec<String> = repo
            .list_by_owner("u1")
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["persistent-a", "persistent-b"]);
        assert_eq!(repo.list_by_owner("u10").unwrap().len(), 1);
        assert!(repo.list_by_owner("u").unwrap().is_empty());
    }

    #[test]
    fn delete_removes_everything() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let r = record("persistent-d", "u1", StorageMode::Persistent);
        let id = persisted(&repo, &r);
        repo.put_slot(&id, SlotName::Research, &blob("r")).unwrap();

        assert!(repo.delete_project("persistent-d").unwrap());
        assert!(repo.get_project("persistent-d").unwrap().is_none());
        assert!(repo.get_slots("persistent-d").unwrap().is_empty());
        assert!(repo.list_by_owner("u1").unwrap().is_empty());
        assert!(!repo.delete_project("persistent-d").unwrap());
    }

    #[test]
    fn delete_expired_before_keeps_live_projects() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        let mut stale = record("persistent-stale", "u1", StorageMode::Persistent);
        stale.expires_at = Utc::now() - TimeDelta::days(10);
        let id = persisted(&repo, &stale);
        repo.put_slot(&id, SlotName::Idea, &blob("i")).unwrap();
        persisted(&repo, &record("persistent-live", "u1", StorageMode::Persistent));

        assert_eq!(repo.delete_expired_before(Utc::now() - TimeDelta::days(20)).unwrap(), 0);
        assert_eq!(repo.delete_expired_before(Utc::now()).unwrap(), 1);
        assert!(repo.get_project("persistent-stale").unwrap().is_none());
        assert!(repo.get_slots("persistent-stale").unwrap().is_empty());
        assert!(repo.get_project("persistent-live").unwrap().is_some());
    }

    #[test]
    fn delete_owner_cascades() {
        let (db, _dir) = temp_db();
        let repo = ProjectRepository::new(db);
        for n in 0..3 {
            let r = record(&format!("persistent-{n}"), "u1", StorageMode::Persistent);
            let id = persisted(&repo, &r);
            repo.put_slot(&id, SlotName::Idea, &blob("i")).unwrap();
        }
        persisted(&repo, &record("persistent-other", "u2", StorageMode::Persistent));

        assert_eq!(repo.delete_owner("u1").unwrap(), 3);
        assert!(repo.list_by_owner("u1").unwrap().is_empty());
        assert_eq!(repo.list_by_owner("u2").unwrap().len(), 1);
    }
}
