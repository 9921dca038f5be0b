// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWT claims and authenticated user representation.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Claims read from a session token.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionClaims {
    /// Subject, the canonical user identifier.
    pub sub: String,

    #[serde(default)]
    pub exp: i64,

    #[serde(default)]
    pub iss: String,

    /// Upstream session id, if the identity provider sets one.
    #[serde(default)]
    pub sid: Option<String>,
}

/// The user making the request.
///
/// `user_id` is the owner key for every project, key and ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthenticatedUser {
    pub user_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip)]
    pub issuer: String,

    /// Unix timestamp.
    #[serde(skip)]
    pub expires_at: i64,
}

impl AuthenticatedUser {
    pub fn from_claims(claims: SessionClaims) -> Self {
        Self {
            user_id: claims.sub,
            session_id: claims.sid,
            issuer: claims.iss,
            expires_at: claims.exp,
        }
    }
}
