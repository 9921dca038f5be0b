// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for authenticated users.
//!
//! Use the `Auth` extractor in handlers to require authentication:
//!
//! ```rust,ignore
//! async fn my_handler(Auth(user): Auth) -> impl IntoResponse {
//!     // user is AuthenticatedUser
//! }
//! ```

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use tracing::warn;

use super::claims::SessionClaims;
use super::{AuthError, AuthenticatedUser};
use crate::state::{AppState, AuthConfig};

/// Clock skew tolerance (60 seconds).
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Extractor for authenticated users.
///
/// ## Authentication Modes
///
/// - **Production mode** (`AUTH_JWT_SECRET` set): HS256 signature, expiry
///   and optional issuer are verified
/// - **Development mode** (no secret, debug or `dev` build): structure and
///   expiry only, no signature check
///
/// # Example
///
/// ```rust,ignore
/// async fn list_projects(
///     Auth(user): Auth,
///     State(state): State<AppState>,
/// ) -> Result<Json<BatchValidation>, ApiError> {
///     // user.user_id owns every project returned
/// }
/// ```
pub struct Auth(pub AuthenticatedUser);

impl FromRequestParts<AppState> for Auth {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>().cloned() {
            return Ok(Auth(user));
        }

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::MissingAuthHeader)?
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthHeader)?;

        let user = verify_jwt(token, &state.auth_config)?;
        parts.extensions.insert(user.clone());
        Ok(Auth(user))
    }
}

fn verify_jwt(token: &str, auth_config: &AuthConfig) -> Result<AuthenticatedUser, AuthError> {
    match auth_config.jwt_secret {
        Some(ref secret) => verify_jwt_production(token, secret, auth_config.issuer.as_deref()),
        None if cfg!(any(feature = "dev", debug_assertions)) => verify_jwt_development(token),
        None => {
            warn!("Rejecting request: AUTH_JWT_SECRET is not set");
            Err(AuthError::NotConfigured)
        }
    }
}

fn verify_jwt_production(
    token: &str,
    secret: &str,
    issuer: Option<&str>,
) -> Result<AuthenticatedUser, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = CLOCK_SKEW_LEEWAY;
    validation.validate_aud = false;
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    let token_data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
        _ => AuthError::MalformedToken,
    })?;

    Ok(AuthenticatedUser::from_claims(token_data.claims))
}

/// Development JWT verification (no signature check).
///
/// WARNING: This should only be used in development environments.
fn verify_jwt_development(token: &str) -> Result<AuthenticatedUser, AuthError> {
    let token_data = jsonwebtoken::dangerous::insecure_decode::<SessionClaims>(token)
        .map_err(|_| AuthError::MalformedToken)?;
    let claims = token_data.claims;

    let now = Utc::now().timestamp();
    if claims.exp > 0 && claims.exp < now - CLOCK_SKEW_LEEWAY as i64 {
        return Err(AuthError::TokenExpired);
    }

    Ok(AuthenticatedUser::from_claims(claims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    /// Unsigned token, accepted only in development mode.
    fn create_test_jwt(user_id: &str) -> String {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let header = r#"{"alg":"HS256","typ":"JWT"}"#;
        let claims = format!(
            r#"{{"sub":"{}","iat":1609459200,"exp":9999999999,"iss":"test","sid":"sess_123"}}"#,
            user_id
        );

        let header_b64 = URL_SAFE_NO_PAD.encode(header.as_bytes());
        let claims_b64 = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        format!("{}.{}.fake_signature", header_b64, claims_b64)
    }

    fn signed_jwt(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn parts_with_token(token: &str) -> Parts {
        Request::builder()
            .uri("/test")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn auth_extractor_requires_auth_header() {
        let (state, _dir) = test_state();
        let mut parts = Request::builder()
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts()
            .0;

        let result = Auth::from_request_parts(&mut parts, &state).await;
        assert!(matches!(result, Err(AuthError::MissingAuthHeader)));
    }

    #[tokio::test]
    async fn auth_extractor_rejects_non_bearer_scheme() {
        let (state, _dir) = test_state();
        let mut parts = Request::builder()
            .uri("/test")
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(())
            .unwrap()
            .into_parts()
            .0;

        let result = Auth::from_request_parts(&mut parts, &state).await;
        assert!(matches!(result, Err(AuthError::InvalidAuthHeader)));
    }

    #[tokio::test]
    async fn development_mode_accepts_unsigned_jwt() {
        let (state, _dir) = test_state();
        let mut parts = parts_with_token(&create_test_jwt("user_123"));

        let Auth(user) = Auth::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.user_id, "user_123");
        assert_eq!(user.session_id.as_deref(), Some("sess_123"));
    }

    #[tokio::test]
    async fn production_mode_verifies_signature() {
        let (mut state, _dir) = test_state();
        state.auth_config = AuthConfig {
            jwt_secret: Some("top-secret".to_string()),
            issuer: Some("ventura".to_string()),
        };

        let good = signed_jwt(
            "top-secret",
            json!({ "sub": "u1", "exp": 9999999999i64, "iss": "ventura" }),
        );
        let Auth(user) = Auth::from_request_parts(&mut parts_with_token(&good), &state)
            .await
            .unwrap();
        assert_eq!(user.user_id, "u1");

        let forged = signed_jwt(
            "other-secret",
            json!({ "sub": "u1", "exp": 9999999999i64, "iss": "ventura" }),
        );
        let result = Auth::from_request_parts(&mut parts_with_token(&forged), &state).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));

        let unsigned = create_test_jwt("u1");
        let result = Auth::from_request_parts(&mut parts_with_token(&unsigned), &state).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn production_mode_checks_expiry_and_issuer() {
        let (mut state, _dir) = test_state();
        state.auth_config = AuthConfig {
            jwt_secret: Some("top-secret".to_string()),
            issuer: Some("ventura".to_string()),
        };

        let expired = signed_jwt(
            "top-secret",
            json!({ "sub": "u1", "exp": 1609459200i64, "iss": "ventura" }),
        );
        let result = Auth::from_request_parts(&mut parts_with_token(&expired), &state).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));

        let wrong_issuer = signed_jwt(
            "top-secret",
            json!({ "sub": "u1", "exp": 9999999999i64, "iss": "someone-else" }),
        );
        let result = Auth::from_request_parts(&mut parts_with_token(&wrong_issuer), &state).await;
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[tokio::test]
    async fn auth_extractor_prefers_extensions() {
        let (state, _dir) = test_state();
        let mut parts = Request::builder()
            .uri("/test")
            .body(())
            .unwrap()
            .into_parts()
            .0;

        parts.extensions.insert(AuthenticatedUser {
            user_id: "user_from_middleware".to_string(),
            session_id: None,
            issuer: "middleware".to_string(),
            expires_at: 0,
        });

        let Auth(user) = Auth::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.user_id, "user_from_middleware");
    }
}
