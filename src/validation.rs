// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage-Mode Validation
//!
//! Classifies project records against the privacy and expiry rules:
//!
//! - **Privacy violation**: a memory-only record with any slot observed in
//!   durable storage. Only a write that bypassed the session store can cause
//!   this.
//! - **Expired data**: `now` is past `expires_at`, regardless of mode.
//! - **Unreadable data**: stored ciphertext that could not be decrypted, for
//!   example after the local master key changed. Only the caller knows this,
//!   so it is passed in to [`validate_listing`].
//!
//! Every function here is pure. The same record and `now` always give the
//! same answer, and nothing is mutated; remediation is a separate explicit
//! call into the session store or durable storage.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::session::{ProjectRecord, StorageMode};

/// Remediation a client should offer for a problematic project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Download the data, then remove the record.
    ExportAndDelete,
    /// Remove the durable copy of a memory-only project.
    PurgeDurableCopy,
    Delete,
}

/// Classification of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProjectValidation {
    pub project_id: String,
    pub is_valid: bool,
    pub has_privacy_violation: bool,
    pub has_expired_data: bool,
    pub has_unreadable_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
    pub recommended_actions: Vec<RecommendedAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub privacy_violations: usize,
    pub expired: usize,
    pub unreadable: usize,
}

/// Partition of a batch into valid and problematic records.
///
/// Problematic records stay in the result so they can be remediated.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct BatchValidation {
    pub valid_projects: Vec<ProjectRecord>,
    pub problematic_projects: Vec<ProblematicProject>,
    pub summary: ValidationSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ProblematicProject {
    pub project: ProjectRecord,
    pub validation: ProjectValidation,
}

/// Whether a project's content may be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DisplayDecision {
    pub should_display: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<RecommendedAction>,
}

fn has_privacy_violation(record: &ProjectRecord) -> bool {
    record.storage_mode == StorageMode::MemoryOnly && !record.durable_fields.is_empty()
}

/// Classify one record.
pub fn validate_project(record: &ProjectRecord, now: DateTime<Utc>) -> ProjectValidation {
    let privacy = has_privacy_violation(record);
    let expired = record.is_expired_at(now);

    let mut warnings = Vec::new();
    let mut actions = Vec::new();

    if privacy {
        let fields: Vec<&str> = record.durable_fields.iter().map(|f| f.as_str()).collect();
        warnings.push(format!(
            "Memory-only project has data in durable storage ({})",
            fields.join(", ")
        ));
        actions.push(RecommendedAction::ExportAndDelete);
        actions.push(RecommendedAction::PurgeDurableCopy);
    }
    if expired {
        warnings.push(format!("Project expired at {}", record.expires_at.to_rfc3339()));
        if !actions.contains(&RecommendedAction::ExportAndDelete) {
            actions.push(RecommendedAction::ExportAndDelete);
        }
        actions.push(RecommendedAction::Delete);
    }

    ProjectValidation {
        project_id: record.id.clone(),
        is_valid: !privacy && !expired,
        has_privacy_violation: privacy,
        has_expired_data: expired,
        has_unreadable_data: false,
        warning_message: (!warnings.is_empty()).then(|| warnings.join("; ")),
        recommended_actions: actions,
    }
}

/// Classify a batch, keeping every record.
pub fn validate_projects(records: Vec<ProjectRecord>, now: DateTime<Utc>) -> BatchValidation {
    validate_listing(records, &BTreeSet::new(), now)
}

/// Classify a batch where the ids in `unreadable` failed to decrypt.
///
/// Unreadable records are problematic and can only be deleted; their
/// content cannot be exported.
pub fn validate_listing(
    records: Vec<ProjectRecord>,
    unreadable: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> BatchValidation {
    let mut summary = ValidationSummary {
        total: records.len(),
        ..Default::default()
    };
    let mut valid_projects = Vec::new();
    let mut problematic_projects = Vec::new();

    for record in records {
        let mut validation = validate_project(&record, now);
        if unreadable.contains(&record.id) {
            mark_unreadable(&mut validation);
            summary.unreadable += 1;
        }
        if validation.has_privacy_violation {
            summary.privacy_violations += 1;
        }
        if validation.has_expired_data {
            summary.expired += 1;
        }
        if validation.is_valid {
            summary.valid += 1;
            valid_projects.push(record);
        } else {
            problematic_projects.push(ProblematicProject {
                project: record,
                validation,
            });
        }
    }

    BatchValidation {
        valid_projects,
        problematic_projects,
        summary,
    }
}

fn mark_unreadable(validation: &mut ProjectValidation) {
    const WARNING: &str = "Unable to access this data";
    validation.is_valid = false;
    validation.has_unreadable_data = true;
    validation.warning_message = Some(match validation.warning_message.take() {
        Some(existing) => format!("{WARNING}; {existing}"),
        None => WARNING.to_string(),
    });
    validation
        .recommended_actions
        .retain(|action| *action != RecommendedAction::ExportAndDelete);
    if !validation.recommended_actions.contains(&RecommendedAction::Delete) {
        validation.recommended_actions.push(RecommendedAction::Delete);
    }
}

/// Gate applied before rendering a project's slot content.
pub fn should_display_data(record: &ProjectRecord, now: DateTime<Utc>) -> DisplayDecision {
    let validation = validate_project(record, now);
    if validation.is_valid {
        return DisplayDecision {
            should_display: true,
            reason: None,
            recommended_action: None,
        };
    }

    let reason = if validation.has_privacy_violation {
        "Project data violates its storage mode and must be exported and deleted"
    } else {
        "Project has expired and must be exported and deleted"
    };
    DisplayDecision {
        should_display: false,
        reason: Some(reason.to_string()),
        recommended_action: Some(RecommendedAction::ExportAndDelete),
    }
}
