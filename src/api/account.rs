// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Account endpoints: credit balance, usage trail and full erasure.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::Auth,
    error::ApiError,
    projects::{AccountErasure, ProjectError},
    state::AppState,
    storage::UsageRecord,
};

const DEFAULT_USAGE_LIMIT: usize = 50;
const MAX_USAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditBalanceResponse {
    pub user_id: String,
    pub balance: u64,
    /// Cost of the idea stage.
    pub idea_cost: u64,
    /// Cost of every later stage.
    pub later_stage_cost: u64,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UsageQuery {
    /// Maximum number of records (default 50, max 500).
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageHistoryResponse {
    /// Newest first.
    pub records: Vec<UsageRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeleteAccountResponse {
    pub erased: AccountErasure,
    pub message: String,
}

#[utoipa::path(
    get,
    path = "/v1/account/credits",
    tag = "Account",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Current credit balance", body = CreditBalanceResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn get_credits(
    Auth(user): Auth,
    State(state): State<AppState>,
) -> Result<Json<CreditBalanceResponse>, ApiError> {
    let balance = state.ledger.balance(&user.user_id).map_err(ProjectError::from)?;
    let costs = state.projects.costs();
    Ok(Json(CreditBalanceResponse {
        user_id: user.user_id,
        balance,
        idea_cost: costs.idea,
        later_stage_cost: costs.later_stage,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/account/usage",
    tag = "Account",
    security(("bearer_auth" = [])),
    params(UsageQuery),
    responses(
        (status = 200, description = "Usage trail, newest first", body = UsageHistoryResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn get_usage(
    Auth(user): Auth,
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageHistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_USAGE_LIMIT)
        .clamp(1, MAX_USAGE_LIMIT);
    let records = state
        .ledger
        .usage_history(&user.user_id, limit)
        .map_err(ProjectError::from)?;
    Ok(Json(UsageHistoryResponse {
        total: records.len(),
        records,
    }))
}

/// Erase every project, durable copy, key reference and usage record of the
/// authenticated user.
#[utoipa::path(
    delete,
    path = "/v1/account",
    tag = "Account",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Account data erased", body = DeleteAccountResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn delete_account(
    Auth(user): Auth,
    State(state): State<AppState>,
) -> Result<Json<DeleteAccountResponse>, ApiError> {
    let erased = state.projects.delete_account(&user.user_id)?;
    Ok(Json(DeleteAccountResponse {
        erased,
        message: "Account data erased".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatedUser;
    use crate::state::test_state;
    use crate::storage::UsageAction;

    fn user(id: &str) -> Auth {
        Auth(AuthenticatedUser {
            user_id: id.to_string(),
            session_id: None,
            issuer: "test".to_string(),
            expires_at: 0,
        })
    }

    #[tokio::test]
    async fn credits_report_balance_and_costs() {
        let (state, _dir) = test_state();
        state.ledger.grant("u1", 12, "purchase").unwrap();

        let Json(response) = get_credits(user("u1"), State(state)).await.unwrap();
        assert_eq!(response.balance, 12);
        assert_eq!(response.idea_cost, 1);
        assert_eq!(response.later_stage_cost, 2);
    }

    #[tokio::test]
    async fn usage_is_limited_and_newest_first() {
        let (state, _dir) = test_state();
        for credits in 1..=3 {
            state.ledger.grant("u1", credits, "purchase").unwrap();
        }

        let Json(response) = get_usage(
            user("u1"),
            State(state),
            Query(UsageQuery { limit: Some(2) }),
        )
        .await
        .unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.records[0].credits, 3);
        assert_eq!(response.records[0].action, UsageAction::CreditPurchase);
    }

    #[tokio::test]
    async fn delete_account_erases_projects_and_usage() {
        let (state, _dir) = test_state();
        state.ledger.grant("u1", 5, "purchase").unwrap();
        state
            .projects
            .create_project("u1", "memory", false, None)
            .await
            .unwrap();
        state
            .projects
            .create_project("u1", "durable", true, None)
            .await
            .unwrap();

        let Json(response) = delete_account(user("u1"), State(state.clone())).await.unwrap();
        assert_eq!(response.erased.sessions_deleted, 2);
        assert_eq!(response.erased.durable_projects_deleted, 1);
        assert_eq!(response.erased.usage_records_deleted, 1);

        assert_eq!(state.ledger.balance("u1").unwrap(), 0);
        assert!(state.sessions.get_user_project_sessions("u1").is_empty());
    }
}
