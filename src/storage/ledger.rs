// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credit ledger.
//!
//! Balance changes and usage records are written in one redb write
//! transaction, so the balance and the usage history can never disagree. A
//! charge against an insufficient balance returns before commit and leaves
//! both untouched.
//!
//! A user without a balance row is opened with the configured initial
//! allowance inside the first mutating transaction, recorded as an
//! `initial_allowance` usage entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::database::{
    AppDatabase, StorageError, CREDIT_BALANCES, LEDGER_STATE, USAGE_RECORDS,
};
use crate::session::SlotName;

const USAGE_SEQUENCE_KEY: &str = "usage_sequence";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("credit amount must be positive")]
    InvalidAmount,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

fn db_err<E: Into<StorageError>>(e: E) -> LedgerError {
    LedgerError::Storage(e.into())
}

/// Kind of metered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    IdeaGeneration,
    ResearchGeneration,
    BlueprintGeneration,
    FinancialGeneration,
    PitchGeneration,
    GtmGeneration,
    InitialAllowance,
    CreditPurchase,
    Refund,
}

impl UsageAction {
    pub fn for_stage(slot: SlotName) -> Self {
        match slot {
            SlotName::Idea => UsageAction::IdeaGeneration,
            SlotName::Research => UsageAction::ResearchGeneration,
            SlotName::Blueprint => UsageAction::BlueprintGeneration,
            SlotName::Financial => UsageAction::FinancialGeneration,
            SlotName::Pitch => UsageAction::PitchGeneration,
            SlotName::Gtm => UsageAction::GtmGeneration,
        }
    }

    /// `true` for actions that add credits.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            UsageAction::InitialAllowance | UsageAction::CreditPurchase | UsageAction::Refund
        )
    }
}

/// Credits charged per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCosts {
    pub idea: u64,
    pub later_stage: u64,
}

impl Default for StageCosts {
    fn default() -> Self {
        Self {
            idea: 1,
            later_stage: 2,
        }
    }
}

impl StageCosts {
    pub fn cost_of(&self, slot: SlotName) -> u64 {
        match slot {
            SlotName::Idea => self.idea,
            _ => self.later_stage,
        }
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub action: UsageAction,
    /// Amount moved; debit or credit per `action`.
    pub credits: u64,
    pub balance_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input to [`CreditLedger::charge`].
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub user_id: String,
    pub action: UsageAction,
    pub credits: u64,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub metadata: serde_json::Value,
}

/// redb-backed credit balances and usage history.
pub struct CreditLedger {
    db: Arc<AppDatabase>,
    initial_allowance: u64,
}

impl CreditLedger {
    pub fn new(db: Arc<AppDatabase>) -> Self {
        Self {
            db,
            initial_allowance: 0,
        }
    }

    /// Credits every new user starts with.
    pub fn with_initial_allowance(mut self, credits: u64) -> Self {
        self.initial_allowance = credits;
        self
    }

    pub fn initial_allowance(&self) -> u64 {
        self.initial_allowance
    }

    /// Debit credits and append the matching usage record atomically.
    pub fn charge(&self, request: ChargeRequest) -> LedgerResult<UsageRecord> {
        if request.credits == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let write_txn = self.db.inner().begin_write().map_err(db_err)?;
        let available = self.open_account(&write_txn, &request.user_id)?;
        if available < request.credits {
            write_txn.abort().map_err(db_err)?;
            return Err(LedgerError::InsufficientCredits {
                required: request.credits,
                available,
            });
        }

        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            action: request.action,
            credits: request.credits,
            balance_after: available - request.credits,
            project_id: request.project_id,
            project_name: request.project_name,
            metadata: request.metadata,
            created_at: Utc::now(),
        };
        append(&write_txn, &record)?;
        write_txn.commit().map_err(db_err)?;

        debug!(
            user_id = %record.user_id,
            action = ?record.action,
            credits = record.credits,
            balance_after = record.balance_after,
            "Credits charged"
        );
        Ok(record)
    }

    /// Add purchased credits.
    pub fn grant(&self, user_id: &str, credits: u64, reason: &str) -> LedgerResult<UsageRecord> {
        self.credit(
            user_id,
            UsageAction::CreditPurchase,
            credits,
            None,
            serde_json::json!({ "reason": reason }),
        )
    }

    /// Return credits for a charge whose work did not complete.
    pub fn refund(&self, charge: &UsageRecord, reason: &str) -> LedgerResult<UsageRecord> {
        let record = self.credit(
            &charge.user_id,
            UsageAction::Refund,
            charge.credits,
            charge.project_id.clone(),
            serde_json::json!({ "refunded_charge": charge.id, "reason": reason }),
        )?;
        info!(
            user_id = %charge.user_id,
            credits = charge.credits,
            charge_id = %charge.id,
            "Refunded charge"
        );
        Ok(record)
    }

    /// Current balance. A user never seen before reports the allowance
    /// their first charge would open with.
    pub fn balance(&self, user_id: &str) -> LedgerResult<u64> {
        let read_txn = self.db.inner().begin_read().map_err(db_err)?;
        let table = read_txn.open_table(CREDIT_BALANCES).map_err(db_err)?;
        Ok(table
            .get(user_id)
            .map_err(db_err)?
            .map(|v| v.value())
            .unwrap_or(self.initial_allowance))
    }

    /// Usage records of the user, newest first.
    pub fn usage_history(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<UsageRecord>> {
        let read_txn = self.db.inner().begin_read().map_err(db_err)?;
        let table = read_txn.open_table(USAGE_RECORDS).map_err(db_err)?;

        let mut records = Vec::with_capacity(limit.min(64));
        for entry in table
            .range((user_id, 0u64)..=(user_id, u64::MAX))
            .map_err(db_err)?
            .rev()
        {
            if records.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(db_err)?;
            records.push(serde_json::from_slice(value.value()).map_err(db_err)?);
        }
        Ok(records)
    }

    /// Delete usage records created before `cutoff`. Balances are untouched.
    pub fn purge_usage_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<usize> {
        let write_txn = self.db.inner().begin_write().map_err(db_err)?;
        let purged = {
            let mut table = write_txn.open_table(USAGE_RECORDS).map_err(db_err)?;

            let mut stale: Vec<(String, u64)> = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                let record: UsageRecord = serde_json::from_slice(value.value()).map_err(db_err)?;
                if record.created_at < cutoff {
                    let (user, seq) = key.value();
                    stale.push((user.to_string(), seq));
                }
            }

            for (user, seq) in &stale {
                table.remove((user.as_str(), *seq)).map_err(db_err)?;
            }
            stale.len()
        };
        write_txn.commit().map_err(db_err)?;

        if purged > 0 {
            info!(purged, %cutoff, "Purged old usage records");
        }
        Ok(purged)
    }

    /// Remove the user's balance and all usage records.
    pub fn erase_user(&self, user_id: &str) -> LedgerResult<usize> {
        let write_txn = self.db.inner().begin_write().map_err(db_err)?;
        let erased = {
            let mut balances = write_txn.open_table(CREDIT_BALANCES).map_err(db_err)?;
            balances.remove(user_id).map_err(db_err)?;

            let mut usage = write_txn.open_table(USAGE_RECORDS).map_err(db_err)?;
            let mut seqs = Vec::new();
            for entry in usage
                .range((user_id, 0u64)..=(user_id, u64::MAX))
                .map_err(db_err)?
            {
                let (key, _) = entry.map_err(db_err)?;
                seqs.push(key.value().1);
            }
            for seq in &seqs {
                usage.remove((user_id, *seq)).map_err(db_err)?;
            }
            seqs.len()
        };
        write_txn.commit().map_err(db_err)?;
        Ok(erased)
    }

    fn credit(
        &self,
        user_id: &str,
        action: UsageAction,
        credits: u64,
        project_id: Option<String>,
        metadata: serde_json::Value,
    ) -> LedgerResult<UsageRecord> {
        if credits == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let write_txn = self.db.inner().begin_write().map_err(db_err)?;
        let available = self.open_account(&write_txn, user_id)?;
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            action,
            credits,
            balance_after: available.saturating_add(credits),
            project_id,
            project_name: None,
            metadata,
            created_at: Utc::now(),
        };
        append(&write_txn, &record)?;
        write_txn.commit().map_err(db_err)?;
        Ok(record)
    }
}

impl CreditLedger {
    /// Balance inside `txn`, granting the initial allowance to a user
    /// without a balance row.
    fn open_account(&self, txn: &WriteTransaction, user_id: &str) -> LedgerResult<u64> {
        if let Some(balance) = read_balance(txn, user_id)? {
            return Ok(balance);
        }
        if self.initial_allowance == 0 {
            return Ok(0);
        }

        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            action: UsageAction::InitialAllowance,
            credits: self.initial_allowance,
            balance_after: self.initial_allowance,
            project_id: None,
            project_name: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        append(txn, &record)?;
        debug!(user_id = %user_id, credits = record.credits, "Opened account with initial allowance");
        Ok(record.balance_after)
    }
}

fn read_balance(txn: &WriteTransaction, user_id: &str) -> LedgerResult<Option<u64>> {
    let table = txn.open_table(CREDIT_BALANCES).map_err(db_err)?;
    let balance = table.get(user_id).map_err(db_err)?.map(|v| v.value());
    Ok(balance)
}

/// Set the balance to `record.balance_after` and append the record.
fn append(txn: &WriteTransaction, record: &UsageRecord) -> LedgerResult<()> {
    let json = serde_json::to_vec(record).map_err(db_err)?;

    let mut state = txn.open_table(LEDGER_STATE).map_err(db_err)?;
    let seq = state
        .get(USAGE_SEQUENCE_KEY)
        .map_err(db_err)?
        .map(|v| v.value())
        .unwrap_or(0)
        + 1;
    state.insert(USAGE_SEQUENCE_KEY, seq).map_err(db_err)?;

    let mut balances = txn.open_table(CREDIT_BALANCES).map_err(db_err)?;
    balances
        .insert(record.user_id.as_str(), record.balance_after)
        .map_err(db_err)?;

    let mut usage = txn.open_table(USAGE_RECORDS).map_err(db_err)?;
    usage
        .insert((record.user_id.as_str(), seq), json.as_slice())
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::temp_db;
    use chrono::TimeDelta;
    use serde_json::json;

    fn stage_charge(user: &str, slot: SlotName, credits: u64) -> ChargeRequest {
        ChargeRequest {
            user_id: user.into(),
            action: UsageAction::for_stage(slot),
            credits,
            project_id: Some("persistent-1".into()),
            project_name: Some("Test Co".into()),
            metadata: json!({ "stage": slot.as_str() }),
        }
    }

    #[test]
    fn charge_debits_and_records_together() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 5, "signup").unwrap();

        let record = ledger.charge(stage_charge("u1", SlotName::Idea, 1)).unwrap();
        assert_eq!(record.balance_after, 4);
        assert_eq!(record.action, UsageAction::IdeaGeneration);
        assert_eq!(ledger.balance("u1").unwrap(), 4);

        let history = ledger.usage_history("u1", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], record);
        assert_eq!(history[1].action, UsageAction::CreditPurchase);
    }

    #[test]
    fn insufficient_balance_changes_nothing() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 1, "signup").unwrap();

        let err = ledger.charge(stage_charge("u1", SlotName::Research, 2)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredits { required: 2, available: 1 }
        ));
        assert_eq!(ledger.balance("u1").unwrap(), 1);
        assert_eq!(ledger.usage_history("u1", 10).unwrap().len(), 1);
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        assert!(matches!(
            ledger.charge(stage_charge("u1", SlotName::Idea, 0)),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(ledger.grant("u1", 0, "x"), Err(LedgerError::InvalidAmount)));
    }

    #[test]
    fn refund_restores_balance_and_references_charge() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 3, "signup").unwrap();
        let charge = ledger.charge(stage_charge("u1", SlotName::Blueprint, 2)).unwrap();

        let refund = ledger.refund(&charge, "storage write failed").unwrap();
        assert_eq!(refund.action, UsageAction::Refund);
        assert_eq!(refund.balance_after, 3);
        assert_eq!(refund.metadata["refunded_charge"], json!(charge.id));
        assert_eq!(ledger.balance("u1").unwrap(), 3);
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 20, "signup").unwrap();
        ledger.grant("u2", 20, "signup").unwrap();
        for slot in SlotName::ALL {
            ledger.charge(stage_charge("u1", slot, 1)).unwrap();
        }

        let history = ledger.usage_history("u1", 3).unwrap();
        let actions: Vec<UsageAction> = history.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                UsageAction::GtmGeneration,
                UsageAction::PitchGeneration,
                UsageAction::FinancialGeneration
            ]
        );
        assert_eq!(ledger.usage_history("u2", 10).unwrap().len(), 1);
    }

    #[test]
    fn balance_always_matches_history() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 4, "signup").unwrap();
        let _ = ledger.charge(stage_charge("u1", SlotName::Idea, 1));
        let _ = ledger.charge(stage_charge("u1", SlotName::Research, 2));
        let _ = ledger.charge(stage_charge("u1", SlotName::Blueprint, 2));

        let history = ledger.usage_history("u1", 100).unwrap();
        let net: i64 = history
            .iter()
            .map(|r| {
                if r.action.is_credit() {
                    r.credits as i64
                } else {
                    -(r.credits as i64)
                }
            })
            .sum();
        assert_eq!(net, ledger.balance("u1").unwrap() as i64);
        assert_eq!(history[0].balance_after, ledger.balance("u1").unwrap());
    }

    #[test]
    fn purge_keeps_recent_records_and_balance() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 5, "signup").unwrap();
        ledger.charge(stage_charge("u1", SlotName::Idea, 1)).unwrap();

        assert_eq!(ledger.purge_usage_before(Utc::now() - TimeDelta::days(1)).unwrap(), 0);
        assert_eq!(ledger.purge_usage_before(Utc::now() + TimeDelta::seconds(1)).unwrap(), 2);
        assert!(ledger.usage_history("u1", 10).unwrap().is_empty());
        assert_eq!(ledger.balance("u1").unwrap(), 4);
    }

    #[test]
    fn erase_user_removes_only_that_user() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db);
        ledger.grant("u1", 5, "signup").unwrap();
        ledger.charge(stage_charge("u1", SlotName::Idea, 1)).unwrap();
        ledger.grant("u2", 5, "signup").unwrap();

        assert_eq!(ledger.erase_user("u1").unwrap(), 2);
        assert_eq!(ledger.balance("u1").unwrap(), 0);
        assert!(ledger.usage_history("u1", 10).unwrap().is_empty());
        assert_eq!(ledger.balance("u2").unwrap(), 5);
    }

    #[test]
    fn new_users_open_with_the_initial_allowance_once() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db).with_initial_allowance(3);
        assert_eq!(ledger.balance("fresh").unwrap(), 3);
        assert!(ledger.usage_history("fresh", 10).unwrap().is_empty());

        let charge = ledger.charge(stage_charge("fresh", SlotName::Idea, 1)).unwrap();
        assert_eq!(charge.balance_after, 2);
        ledger.charge(stage_charge("fresh", SlotName::Research, 2)).unwrap();
        assert_eq!(ledger.balance("fresh").unwrap(), 0);

        let history = ledger.usage_history("fresh", 10).unwrap();
        let allowances = history
            .iter()
            .filter(|r| r.action == UsageAction::InitialAllowance)
            .count();
        assert_eq!(allowances, 1);
        assert!(matches!(
            ledger.charge(stage_charge("fresh", SlotName::Blueprint, 2)),
            Err(LedgerError::InsufficientCredits { required: 2, available: 0 })
        ));
    }

    #[test]
    fn rejected_first_charge_does_not_keep_the_allowance_record() {
        let (db, _dir) = temp_db();
        let ledger = CreditLedger::new(db).with_initial_allowance(1);
        assert!(ledger.charge(stage_charge("u1", SlotName::Research, 2)).is_err());
        assert!(ledger.usage_history("u1", 10).unwrap().is_empty());
        assert_eq!(ledger.balance("u1").unwrap(), 1);
    }

    #[test]
    fn stage_costs_default_table() {
        let costs = StageCosts::default();
        assert_eq!(costs.cost_of(SlotName::Idea), 1);
        for slot in &SlotName::ALL[1..] {
            assert_eq!(costs.cost_of(*slot), 2);
        }
    }
}
