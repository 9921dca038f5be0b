// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Every project and ledger entry belongs to the user named by the `sub`
//! claim of the request's bearer token. Identity is established upstream;
//! this module only verifies the token and exposes the user id.
//!
//! ## Auth Flow
//!
//! 1. The web client signs the user in and receives a session JWT
//! 2. The client sends `Authorization: Bearer <JWT>`
//! 3. The server:
//!    - Verifies the HS256 signature with `AUTH_JWT_SECRET`
//!    - Checks expiry and, if configured, the issuer
//!    - Uses `sub` as the canonical `user_id`
//!
//! ## Security
//!
//! - All non-health endpoints require authentication
//! - Without a secret, tokens are decoded unverified, and only in debug or
//!   `dev` builds; release builds reject every request instead
//! - Clock skew tolerance is 60 seconds

pub mod claims;
pub mod error;
pub mod extractor;

pub use claims::AuthenticatedUser;
pub use error::AuthError;
pub use extractor::Auth;
