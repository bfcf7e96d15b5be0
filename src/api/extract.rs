//! Request extractors: JSON bodies, bearer identities and the admin key.

use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::domain::{AppError, AuthUser, ValidationError};

/// Header carrying the admin shared secret
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// JSON body whose rejections are reported as validation errors (400)
/// instead of axum's default 415/422.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                debug!(error = %rejection.body_text(), "Rejected request body");
                Err(AppError::Validation(ValidationError::Multiple(
                    rejection.body_text(),
                )))
            }
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// A caller that presented a valid bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: AuthUser,
    pub access_token: String,
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if !state.accounts.is_auth_configured() {
            return Err(AppError::NotSupported(
                "Authentication is not configured".to_string(),
            ));
        }
        let access_token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::Authentication("Bearer token required".to_string()))?;
        let user = state.accounts.authenticate(&access_token).await?;
        Ok(Self { user, access_token })
    }
}

/// Identity when a bearer token is present; guests pass through as `None`.
/// An invalid token is still rejected.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<AuthUser>);

impl FromRequestParts<Arc<AppState>> for OptionalUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(access_token) = bearer_token(&parts.headers) else {
            return Ok(Self(None));
        };
        if !state.accounts.is_auth_configured() {
            debug!("Bearer token ignored, authentication is not configured");
            return Ok(Self(None));
        }
        let user = state.accounts.authenticate(&access_token).await?;
        Ok(Self(Some(user)))
    }
}

/// Gate for operator routes
#[derive(Debug, Clone, Copy)]
pub struct AdminKey;

impl FromRequestParts<Arc<AppState>> for AdminKey {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = state
            .admin_api_key
            .as_ref()
            .ok_or_else(|| AppError::NotSupported("Admin API is not configured".to_string()))?;

        let presented = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Authentication("Missing admin key".to_string()))?;

        if !digest_eq(expected.expose_secret().as_bytes(), presented.as_bytes()) {
            warn!("Rejected admin request with wrong key");
            return Err(AppError::Authorization("Invalid admin key".to_string()));
        }
        Ok(Self)
    }
}

fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("xyz"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_digest_eq() {
        assert!(digest_eq(b"secret", b"secret"));
        assert!(!digest_eq(b"secret", b"secret2"));
        assert!(!digest_eq(b"", b"secret"));
    }
}
