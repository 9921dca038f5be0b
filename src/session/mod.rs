// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Project Sessions
//!
//! The in-process source of truth for project state.
//!
//! - `record` - the project record, its slots and storage mode
//! - `store` - the keyed session map with ownership and expiry checks
//! - `reaper` - background eviction of expired records
//! - `clock` - injectable time source
//!
//! Memory-only projects exist nowhere else. Persistent projects are also
//! written, encrypted, through [`crate::storage::projects`].

pub mod clock;
pub mod reaper;
pub mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use reaper::{RetentionPolicy, SessionReaper, SweepReport};
pub use record::{OwnedResource, ProjectRecord, ProjectSlots, SlotName, StorageMode};
pub use store::{SessionStats, SessionStore, SessionTtl};
