// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Project Service
//!
//! The data-access API used by the six generation stages. It hides the two
//! storage regimes behind one set of calls:
//!
//! - **Memory-only** projects touch the session store and the ledger, and
//!   nothing else.
//! - **Persistent** projects are additionally encrypted per user by the key
//!   manager and written to the durable store. A persistent project missing
//!   from the session store (for example after a restart) is decrypted and
//!   restored on first access.
//!
//! ## Billing
//!
//! A stage write is charged before any storage mutation. If a later step
//! fails the charge is refunded, so a user is never billed for output that
//! was not stored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::crypto::{KeyManager, KmsError, UserCiphertext};
use crate::generation::{
    generate_with_retry, parse_stage_output, stage_prompt_context, ContentGenerator,
    GenerationError, RetryPolicy,
};
use crate::session::{ProjectRecord, ProjectSlots, SessionStore, SlotName, StorageMode};
use crate::storage::{
    ChargeRequest, CreditLedger, DurableProjectStore, LedgerError, PersistedProject,
    PersistentProjectId, StageCosts, StorageError, UsageAction, UsageRecord,
};
use crate::validation::{self, BatchValidation, DisplayDecision};

/// Version of the [`ProjectExport`] document layout.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// Unknown, foreign and expired projects are indistinguishable.
    #[error("project not found")]
    NotFound,

    #[error("stage {slot} requires {required} to be completed first")]
    MissingPredecessor { slot: SlotName, required: SlotName },

    #[error("slot value must not be null")]
    InvalidValue,

    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    #[error(transparent)]
    Crypto(#[from] KmsError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<LedgerError> for ProjectError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => ProjectError::InsufficientCredits {
                required,
                available,
            },
            other => ProjectError::Ledger(other),
        }
    }
}

pub type ProjectResult<T> = Result<T, ProjectError>;

/// A project together with its display gate.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProjectView {
    pub project: ProjectRecord,
    pub display: DisplayDecision,
}

/// Result of a billed stage write.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StageWrite {
    pub project: ProjectRecord,
    pub charge: UsageRecord,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExportedProjectMetadata {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub storage_mode: StorageMode,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Privacy statement attached to every export.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExportAttestation {
    /// The session record was removed as part of producing this export.
    pub record_deleted: bool,
    pub storage_mode: StorageMode,
    /// The encrypted durable copy was removed as well.
    pub durable_copy_deleted: bool,
    pub statement: String,
}

/// Self-contained export document with plaintext slot contents.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProjectExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub project: ExportedProjectMetadata,
    pub slots: ProjectSlots,
    pub attestation: ExportAttestation,
}

/// What an account erasure removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct AccountErasure {
    pub sessions_deleted: usize,
    pub durable_projects_deleted: usize,
    pub usage_records_deleted: usize,
}

/// Data-access facade over sessions, encryption, durable storage and billing.
pub struct ProjectService {
    sessions: Arc<SessionStore>,
    durable: Arc<dyn DurableProjectStore>,
    keys: Arc<KeyManager>,
    ledger: Arc<CreditLedger>,
    costs: StageCosts,
}

impl ProjectService {
    pub fn new(
        sessions: Arc<SessionStore>,
        durable: Arc<dyn DurableProjectStore>,
        keys: Arc<KeyManager>,
        ledger: Arc<CreditLedger>,
    ) -> Self {
        Self {
            sessions,
            durable,
            keys,
            ledger,
            costs: StageCosts::default(),
        }
    }

    pub fn with_costs(mut self, costs: StageCosts) -> Self {
        self.costs = costs;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn costs(&self) -> StageCosts {
        self.costs
    }

    /// Create a project. Persistent projects also get a user key and a
    /// durable metadata row; if either fails the session is removed again.
    pub async fn create_project(
        &self,
        owner_id: &str,
        name: &str,
        persistent: bool,
        custom_expiry: Option<DateTime<Utc>>,
    ) -> ProjectResult<ProjectRecord> {
        let id = self
            .sessions
            .create_project_session(owner_id, name, persistent, custom_expiry);
        let record = self
            .sessions
            .get_project_session(&id, owner_id)
            .ok_or(ProjectError::NotFound)?;

        if let Some(capability) = PersistentProjectId::for_record(&record) {
            if let Err(e) = self.provision_durable(&capability, &record).await {
                self.sessions.delete_project_session(&id, owner_id);
                return Err(e);
            }
        }

        info!(project_id = %id, storage_mode = ?record.storage_mode, "Project created");
        Ok(record)
    }

    async fn provision_durable(
        &self,
        capability: &PersistentProjectId,
        record: &ProjectRecord,
    ) -> ProjectResult<()> {
        self.keys.generate_user_key(&record.owner_id).await?;
        self.durable
            .put_project(capability, &PersistedProject::from_record(record))?;
        Ok(())
    }

    /// Store one stage's output, billed once.
    pub async fn write_stage_output(
        &self,
        owner_id: &str,
        project_id: &str,
        slot: SlotName,
        value: Value,
    ) -> ProjectResult<StageWrite> {
        if value.is_null() {
            return Err(ProjectError::InvalidValue);
        }
        let record = self
            .load_record(owner_id, project_id)
            .await?
            .ok_or(ProjectError::NotFound)?;
        check_predecessor(&record, slot)?;

        let charge = self.ledger.charge(ChargeRequest {
            user_id: owner_id.to_string(),
            action: UsageAction::for_stage(slot),
            credits: self.costs.cost_of(slot),
            project_id: Some(record.id.clone()),
            project_name: Some(record.name.clone()),
            metadata: json!({ "stage": slot.as_str(), "storage_mode": record.storage_mode }),
        })?;

        match self.store_slot(&record, slot, value).await {
            Ok(project) => Ok(StageWrite { project, charge }),
            Err(e) => {
                if let Err(refund_err) = self.ledger.refund(&charge, "stage output not stored") {
                    error!(
                        charge_id = %charge.id,
                        error = %refund_err,
                        "Failed to refund charge after storage failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn store_slot(
        &self,
        record: &ProjectRecord,
        slot: SlotName,
        value: Value,
    ) -> ProjectResult<ProjectRecord> {
        if let Some(capability) = PersistentProjectId::for_record(record) {
            let blob = self.keys.encrypt_user_data(&record.owner_id, &value).await?;
            self.durable.put_slot(&capability, slot, &blob)?;
        }

        if !self
            .sessions
            .update_project_data(&record.id, &record.owner_id, slot, value)
        {
            return Err(ProjectError::NotFound);
        }
        self.sessions
            .get_project_session(&record.id, &record.owner_id)
            .ok_or(ProjectError::NotFound)
    }

    /// Run the generator for a stage and store its parsed output.
    pub async fn generate_stage(
        &self,
        owner_id: &str,
        project_id: &str,
        slot: SlotName,
        user_prompt: &str,
        generator: &dyn ContentGenerator,
        policy: &RetryPolicy,
    ) -> ProjectResult<StageWrite> {
        let record = self
            .load_record(owner_id, project_id)
            .await?
            .ok_or(ProjectError::NotFound)?;
        check_predecessor(&record, slot)?;

        let required = self.costs.cost_of(slot);
        let available = self.ledger.balance(owner_id)?;
        if available < required {
            return Err(ProjectError::InsufficientCredits {
                required,
                available,
            });
        }

        let context = stage_prompt_context(slot, &record);
        let text = generate_with_retry(generator, policy, &context, user_prompt).await?;
        let value = parse_stage_output(&text)?;
        self.write_stage_output(owner_id, project_id, slot, value).await
    }

    /// Fetch a project with its display decision. Slot content is withheld
    /// when the project must not be displayed.
    pub async fn get_project(&self, owner_id: &str, project_id: &str) -> ProjectResult<ProjectView> {
        let mut record = self
            .load_record(owner_id, project_id)
            .await?
            .ok_or(ProjectError::NotFound)?;
        record.durable_fields = self.durable.populated_slots(&record.id)?;

        let decision = validation::should_display_data(&record, self.sessions.now());
        if !decision.should_display {
            let reason = decision.reason.as_deref().unwrap_or_default();
            warn!(project_id = %record.id, reason, "Withholding project data");
            record.slots = ProjectSlots::default();
        }
        Ok(ProjectView {
            project: record,
            display: decision,
        })
    }

    /// Every project of the owner, partitioned by validation.
    ///
    /// Expired durable projects are listed (without content) so they can be
    /// cleaned up instead of silently disappearing. A durable project that
    /// fails to decrypt is listed the same way and flagged unreadable; it
    /// never hides the rest of the listing.
    pub async fn list_projects(&self, owner_id: &str) -> ProjectResult<BatchValidation> {
        let now = self.sessions.now();
        let mut records = self.sessions.get_user_project_sessions(owner_id);
        let known: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut unreadable = BTreeSet::new();

        for meta in self.durable.list_by_owner(owner_id)? {
            if known.contains(&meta.id) {
                continue;
            }
            if now > meta.expires_at {
                records.push(meta.into_record(ProjectSlots::default(), BTreeSet::new(), now));
                continue;
            }
            match self.load_record(owner_id, &meta.id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(ProjectError::Crypto(e)) => {
                    warn!(project_id = %meta.id, error = %e, "Durable project could not be decrypted");
                    unreadable.insert(meta.id.clone());
                    records.push(meta.into_record(ProjectSlots::default(), BTreeSet::new(), now));
                }
                Err(e) => return Err(e),
            }
        }

        for record in &mut records {
            record.durable_fields = self.durable.populated_slots(&record.id)?;
            let withhold = !validation::should_display_data(record, now).should_display;
            if withhold {
                record.slots = ProjectSlots::default();
            }
        }
        Ok(validation::validate_listing(records, &unreadable, now))
    }

    /// Produce the export document, optionally deleting the project.
    ///
    /// With `delete`, the session record is removed before the document is
    /// built, and any durable copy (including one that should never have
    /// existed for a memory-only project) is removed too.
    ///
    /// An expired durable project can still be exported with `delete`. Its
    /// content is not decrypted: the document carries metadata only and the
    /// durable copy is removed.
    pub async fn export_project(
        &self,
        owner_id: &str,
        project_id: &str,
        delete: bool,
    ) -> ProjectResult<ProjectExport> {
        // Hydrates persistent projects missing from the session store.
        if self.load_record(owner_id, project_id).await?.is_none() {
            if !delete {
                return Err(ProjectError::NotFound);
            }
            return self.export_expired_durable(owner_id, project_id);
        }

        let record = if delete {
            self.sessions
                .export_and_delete(project_id, owner_id)
                .ok_or(ProjectError::NotFound)?
        } else {
            self.sessions
                .get_project_session(project_id, owner_id)
                .ok_or(ProjectError::NotFound)?
        };

        let durable_copy_deleted = if delete {
            self.durable.delete_project(&record.id)?
        } else {
            false
        };

        info!(
            project_id = %record.id,
            record_deleted = delete,
            durable_copy_deleted,
            "Project exported"
        );
        Ok(build_export(record, delete, durable_copy_deleted, self.sessions.now()))
    }

    fn export_expired_durable(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> ProjectResult<ProjectExport> {
        let now = self.sessions.now();
        let meta = self
            .durable
            .get_project(project_id)?
            .filter(|meta| meta.owner_id == owner_id && now > meta.expires_at)
            .ok_or(ProjectError::NotFound)?;

        let record = meta.into_record(ProjectSlots::default(), BTreeSet::new(), now);
        let durable_copy_deleted = self.durable.delete_project(&record.id)?;
        info!(
            project_id = %record.id,
            durable_copy_deleted,
            "Expired project exported without content"
        );
        Ok(build_export(record, true, durable_copy_deleted, now))
    }

    /// Delete a project from both regimes. `false` when nothing owned by
    /// the caller was found.
    pub fn delete_project(&self, owner_id: &str, project_id: &str) -> ProjectResult<bool> {
        let from_session = self.sessions.delete_project_session(project_id, owner_id);

        let owns_durable = match self.durable.get_project(project_id)? {
            Some(meta) => meta.owner_id == owner_id,
            // A durable copy without metadata can only be claimed through a
            // live session record.
            None => from_session,
        };
        let from_durable = owns_durable && self.durable.delete_project(project_id)?;

        Ok(from_session || from_durable)
    }

    /// Remove the durable copy of a memory-only project, keeping the
    /// session record.
    pub fn purge_durable_copy(&self, owner_id: &str, project_id: &str) -> ProjectResult<bool> {
        let record = self
            .sessions
            .get_project_session(project_id, owner_id)
            .ok_or(ProjectError::NotFound)?;
        if !record.is_memory_only() {
            return Ok(false);
        }
        let purged = self.durable.delete_project(&record.id)?;
        if purged {
            warn!(project_id = %record.id, "Purged durable copy of memory-only project");
        }
        Ok(purged)
    }

    /// Erase everything held for the user.
    pub fn delete_account(&self, owner_id: &str) -> ProjectResult<AccountErasure> {
        let erasure = AccountErasure {
            sessions_deleted: self.sessions.delete_user_sessions(owner_id),
            durable_projects_deleted: self.durable.delete_owner(owner_id)?,
            usage_records_deleted: self.ledger.erase_user(owner_id)?,
        };
        self.keys.forget_user(owner_id)?;

        info!(
            sessions = erasure.sessions_deleted,
            durable_projects = erasure.durable_projects_deleted,
            usage_records = erasure.usage_records_deleted,
            "Account erased"
        );
        Ok(erasure)
    }

    /// Session record, or the decrypted durable copy restored into the
    /// session store. `None` for unknown, foreign and expired projects.
    async fn load_record(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> ProjectResult<Option<ProjectRecord>> {
        if let Some(record) = self.sessions.get_project_session(project_id, owner_id) {
            return Ok(Some(record));
        }

        let Some(meta) = self.durable.get_project(project_id)? else {
            return Ok(None);
        };
        let now = self.sessions.now();
        if meta.owner_id != owner_id
            || meta.storage_mode != StorageMode::Persistent
            || now > meta.expires_at
        {
            return Ok(None);
        }

        let blobs = self.durable.get_slots(project_id)?;
        let slots = self.decrypt_slots(owner_id, &blobs).await?;
        let fields: BTreeSet<SlotName> = blobs.keys().copied().collect();
        let record = meta.into_record(slots, fields, now);

        if self.sessions.restore_session(record) {
            info!(project_id = %project_id, "Restored persistent project from durable storage");
        }
        Ok(self.sessions.get_project_session(project_id, owner_id))
    }

    async fn decrypt_slots(
        &self,
        owner_id: &str,
        blobs: &BTreeMap<SlotName, UserCiphertext>,
    ) -> ProjectResult<ProjectSlots> {
        let mut slots = ProjectSlots::default();
        for (slot, blob) in blobs {
            let value = self.keys.decrypt_user_data(owner_id, blob).await?;
            slots.set(*slot, value);
        }
        Ok(slots)
    }
}

fn check_predecessor(record: &ProjectRecord, slot: SlotName) -> ProjectResult<()> {
    match slot.predecessor() {
        Some(required) if !record.slots.is_filled(required) => {
            Err(ProjectError::MissingPredecessor { slot, required })
        }
        _ => Ok(()),
    }
}

fn build_export(
    record: ProjectRecord,
    record_deleted: bool,
    durable_copy_deleted: bool,
    now: DateTime<Utc>,
) -> ProjectExport {
    let expired = record.is_expired_at(now);
    let statement = match (record_deleted, record.storage_mode) {
        (false, _) => "This export is a copy. The project remains stored.".to_string(),
        (true, _) if expired => {
            "The project had expired. Its stored content was deleted without being exported."
                .to_string()
        }
        (true, StorageMode::MemoryOnly) => {
            "The project was held in memory only and was deleted when this export was produced."
                .to_string()
        }
        (true, StorageMode::Persistent) if durable_copy_deleted => {
            "The project and its encrypted stored copy were deleted when this export was produced."
                .to_string()
        }
        (true, StorageMode::Persistent) => {
            "The project was deleted when this export was produced. No encrypted stored copy remained."
                .to_string()
        }
    };

    ProjectExport {
        format_version: EXPORT_FORMAT_VERSION,
        exported_at: now,
        project: ExportedProjectMetadata {
            id: record.id,
            owner_id: record.owner_id,
            name: record.name,
            storage_mode: record.storage_mode,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
            expires_at: record.expires_at,
        },
        slots: record.slots,
        attestation: ExportAttestation {
            record_deleted,
            storage_mode: record.storage_mode,
            durable_copy_deleted,
            statement,
        },
    }
}
