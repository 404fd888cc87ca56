//! Session auth.
//!
//! - Frontend posts an identity provider ID token to `/auth/firebase`
//! - Server verifies it, creates or refreshes the user, and returns a session JWT
//!   valid for `JWT_TTL_DAYS` (7 by default)
//! - Protected endpoints require `Authorization: Bearer <jwt>`: missing -> 401, invalid -> 403

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use super::error::ApiError;
use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse};
use crate::identity::AuthError;
use crate::store::{User, UserProfile};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// User id (identity provider uid)
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

/// Authenticated caller, inserted into request extensions by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

pub(crate) fn issue_session(
    secret: &str,
    ttl_days: i64,
    user: &User,
) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_session(token: &str, secret: &str) -> anyhow::Result<AuthUser> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(AuthUser {
        id: token_data.claims.sub,
        email: token_data.claims.email,
    })
}

fn bearer_token(req: &Request<Body>) -> &str {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("")
        .trim()
}

/// `POST /auth/firebase`
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let id_token = req
        .id_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Validation("ID token required".to_string()))?;

    let identity = state.verifier.verify(id_token).await.map_err(|e| match e {
        AuthError::Invalid(reason) => {
            tracing::warn!("Rejected ID token: {}", reason);
            ApiError::LoginRejected
        }
        AuthError::Upstream(cause) => ApiError::Upstream {
            message: "Authentication failed",
            cause,
        },
    })?;

    let user = state.service.login(&UserProfile::from(identity)).await?;

    let (session_token, expires_at) = issue_session(
        &state.config.auth.jwt_secret,
        state.config.auth.jwt_ttl_days,
        &user,
    )
    .map_err(|e| ApiError::Internal(format!("issuing session token: {}", e)))?;

    Ok(Json(LoginResponse {
        user,
        session_token,
        expires_at,
        message: "Authentication successful".to_string(),
    }))
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = bearer_token(&req);
    if token.is_empty() {
        return ApiError::Unauthenticated.into_response();
    }

    match verify_session(token, &state.config.auth.jwt_secret) {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!("Session token rejected: {}", e);
            ApiError::Forbidden.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> User {
        let now = Utc::now();
        User {
            id: id.to_string(),
            email: Some("a@example.com".to_string()),
            display_name: None,
            external_wallet_address: None,
            created_at: now,
            last_login_at: now,
        }
    }

    #[test]
    fn test_session_roundtrip_and_ttl() {
        let (token, exp) = issue_session("secret", 7, &user("u1")).unwrap();
        let auth = verify_session(&token, "secret").unwrap();
        assert_eq!(auth.id, "u1");
        assert_eq!(auth.email.as_deref(), Some("a@example.com"));

        let week = Duration::days(7).num_seconds();
        let remaining = exp - Utc::now().timestamp();
        assert!(remaining > week - 60 && remaining <= week);
    }

    #[test]
    fn test_session_wrong_secret_rejected() {
        let (token, _) = issue_session("secret", 7, &user("u1")).unwrap();
        assert!(verify_session(&token, "other").is_err());
        assert!(verify_session("garbage", "secret").is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let req = Request::builder()
            .header("Authorization", "Bearer abc.def")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), "abc.def");

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(bearer_token(&req), "");

        let req = Request::builder()
            .header("Authorization", "Basic xyz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), "");
    }
}
