// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::generation::GenerationError;
use crate::projects::ProjectError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYMENT_REQUIRED, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ProjectError> for ApiError {
    fn from(e: ProjectError) -> Self {
        match e {
            ProjectError::NotFound => ApiError::not_found("Project not found"),
            ProjectError::MissingPredecessor { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            ProjectError::InvalidValue => ApiError::unprocessable(e.to_string()),
            ProjectError::InsufficientCredits { .. } => ApiError::payment_required(e.to_string()),
            // Key and ciphertext problems never leak detail to the client.
            ProjectError::Crypto(inner) => {
                error!(error = %inner, "Encryption layer failure");
                ApiError::internal("Unable to access this data")
            }
            ProjectError::Generation(inner) => match inner {
                GenerationError::NotConfigured => {
                    ApiError::service_unavailable("Content generation is not configured")
                }
                GenerationError::RateLimited | GenerationError::Unavailable(_) => {
                    ApiError::service_unavailable("Content generation is temporarily unavailable")
                }
                GenerationError::Rejected(_) => {
                    error!(error = %inner, "Generator rejected the request");
                    ApiError::new(StatusCode::BAD_GATEWAY, "Content generation failed")
                }
                GenerationError::InvalidOutput(_) => {
                    warn!(error = %inner, "Generator output could not be used");
                    ApiError::new(
                        StatusCode::BAD_GATEWAY,
                        "Content generation returned unusable output",
                    )
                }
            },
            ProjectError::Storage(inner) => {
                error!(error = %inner, "Storage failure");
                ApiError::internal("Storage error")
            }
            ProjectError::Ledger(inner) => {
                error!(error = %inner, "Ledger failure");
                ApiError::internal("Billing error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}
