// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ventura Server - Privacy-Tiered Project Storage
//!
//! Stores the outputs of the six-stage venture pipeline (idea, research,
//! blueprint, financial, pitch, go-to-market) under one of two regimes:
//! memory-only projects that never touch disk, and persistent projects that
//! are encrypted per user before they reach the embedded database.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Bearer token authentication
//! - `crypto` - AES-256-GCM envelope and per-user key management
//! - `generation` - Text-generation client with retry
//! - `projects` - Data-access facade used by the pipeline stages
//! - `session` - In-memory session store and expiry reaper
//! - `storage` - Durable projects and the credit ledger (redb)
//! - `validation` - Storage-mode reconciliation and display gating

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod generation;
pub mod projects;
pub mod session;
pub mod state;
pub mod storage;
pub mod validation;
