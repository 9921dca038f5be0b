// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Project record and its six pipeline slots.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// One output slot of the generation pipeline, in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SlotName {
    Idea,
    Research,
    Blueprint,
    Financial,
    Pitch,
    Gtm,
}

impl SlotName {
    /// All slots in pipeline order.
    pub const ALL: [SlotName; 6] = [
        SlotName::Idea,
        SlotName::Research,
        SlotName::Blueprint,
        SlotName::Financial,
        SlotName::Pitch,
        SlotName::Gtm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotName::Idea => "idea",
            SlotName::Research => "research",
            SlotName::Blueprint => "blueprint",
            SlotName::Financial => "financial",
            SlotName::Pitch => "pitch",
            SlotName::Gtm => "gtm",
        }
    }

    /// Parse a slot name (case-insensitive).
    pub fn parse(s: &str) -> Option<SlotName> {
        match s.to_lowercase().as_str() {
            "idea" => Some(SlotName::Idea),
            "research" => Some(SlotName::Research),
            "blueprint" => Some(SlotName::Blueprint),
            "financial" => Some(SlotName::Financial),
            "pitch" => Some(SlotName::Pitch),
            "gtm" => Some(SlotName::Gtm),
            _ => None,
        }
    }

    /// The stage that must be filled before this one.
    pub fn predecessor(&self) -> Option<SlotName> {
        match self {
            SlotName::Idea => None,
            SlotName::Research => Some(SlotName::Idea),
            SlotName::Blueprint => Some(SlotName::Research),
            SlotName::Financial => Some(SlotName::Blueprint),
            SlotName::Pitch => Some(SlotName::Financial),
            SlotName::Gtm => Some(SlotName::Pitch),
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a project's slot data physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMode {
    /// Process memory only. Lost on restart, deletion or expiry.
    MemoryOnly,
    /// Encrypted per user and written to the embedded database.
    Persistent,
}

impl StorageMode {
    pub fn from_persistent_flag(persistent: bool) -> Self {
        if persistent {
            StorageMode::Persistent
        } else {
            StorageMode::MemoryOnly
        }
    }

    /// Informational id prefix. Carries no security meaning.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            StorageMode::MemoryOnly => "session",
            StorageMode::Persistent => "persistent",
        }
    }
}

/// The six slot values of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectSlots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub idea: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub research: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub blueprint: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub financial: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub pitch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub gtm: Option<Value>,
}

impl ProjectSlots {
    pub fn get(&self, slot: SlotName) -> Option<&Value> {
        self.slot_ref(slot).as_ref()
    }

    pub fn set(&mut self, slot: SlotName, value: Value) {
        *self.slot_mut(slot) = Some(value);
    }

    pub fn is_filled(&self, slot: SlotName) -> bool {
        self.get(slot).is_some()
    }

    /// Slots holding a value, in pipeline order.
    pub fn filled(&self) -> Vec<SlotName> {
        SlotName::ALL
            .into_iter()
            .filter(|slot| self.is_filled(*slot))
            .collect()
    }

    fn slot_ref(&self, slot: SlotName) -> &Option<Value> {
        match slot {
            SlotName::Idea => &self.idea,
            SlotName::Research => &self.research,
            SlotName::Blueprint => &self.blueprint,
            SlotName::Financial => &self.financial,
            SlotName::Pitch => &self.pitch,
            SlotName::Gtm => &self.gtm,
        }
    }

    fn slot_mut(&mut self, slot: SlotName) -> &mut Option<Value> {
        match slot {
            SlotName::Idea => &mut self.idea,
            SlotName::Research => &mut self.research,
            SlotName::Blueprint => &mut self.blueprint,
            SlotName::Financial => &mut self.financial,
            SlotName::Pitch => &mut self.pitch,
            SlotName::Gtm => &mut self.gtm,
        }
    }
}

/// A project and its pipeline outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectRecord {
    /// `session-…` or `persistent-…`.
    pub id: String,
    /// Authenticated user who exclusively owns the record.
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Sole authority for liveness.
    pub expires_at: DateTime<Utc>,
    pub slots: ProjectSlots,
    pub storage_mode: StorageMode,
    /// Slots observed populated in durable storage for this id.
    ///
    /// Must stay empty for memory-only records; anything here means a write
    /// bypassed the session store.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub durable_fields: BTreeSet<SlotName>,
}

impl ProjectRecord {
    /// Expired once `now` is strictly past `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_memory_only(&self) -> bool {
        self.storage_mode == StorageMode::MemoryOnly
    }
}

/// Trait for resources that have an owner.
pub trait OwnedResource {
    fn owner_user_id(&self) -> &str;

    fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_user_id() == user_id
    }
}

impl OwnedResource for ProjectRecord {
    fn owner_user_id(&self) -> &str {
        &self.owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slot_order_and_predecessors() {
        assert_eq!(SlotName::Idea.predecessor(), None);
        for pair in SlotName::ALL.windows(2) {
            assert_eq!(pair[1].predecessor(), Some(pair[0]));
        }
    }

    #[test]
    fn slot_parse_is_case_insensitive() {
        assert_eq!(SlotName::parse("GTM"), Some(SlotName::Gtm));
        assert_eq!(SlotName::parse("Financial"), Some(SlotName::Financial));
        assert_eq!(SlotName::parse("financials"), None);
    }

    #[test]
    fn storage_mode_serializes_upper_snake() {
        assert_eq!(
            serde_json::to_value(StorageMode::MemoryOnly).unwrap(),
            json!("MEMORY_ONLY")
        );
        assert_eq!(
            serde_json::to_value(StorageMode::Persistent).unwrap(),
            json!("PERSISTENT")
        );
    }

    #[test]
    fn slots_set_and_list_filled() {
        let mut slots = ProjectSlots::default();
        assert!(slots.filled().is_empty());
        slots.set(SlotName::Pitch, json!({"deck": []}));
        slots.set(SlotName::Idea, json!("x"));
        assert_eq!(slots.filled(), vec![SlotName::Idea, SlotName::Pitch]);
        assert_eq!(slots.get(SlotName::Idea), Some(&json!("x")));
        assert!(!slots.is_filled(SlotName::Research));
    }

    #[test]
    fn empty_slots_are_omitted_when_serialized() {
        let mut slots = ProjectSlots::default();
        slots.set(SlotName::Idea, json!({"title": "X"}));
        assert_eq!(serde_json::to_value(&slots).unwrap(), json!({"idea": {"title": "X"}}));
    }
}
