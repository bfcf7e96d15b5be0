//! Supabase GoTrue identity provider.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::domain::{AppError, AuthProvider, AuthUser, ExternalServiceError};

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

impl From<GoTrueUser> for AuthUser {
    fn from(user: GoTrueUser) -> Self {
        Self {
            id: user.id,
            email: user.email.filter(|e| !e.is_empty()),
            username: user.user_metadata.and_then(|m| m.username),
        }
    }
}

/// `/verify` answers with a session wrapping the user
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    user: GoTrueUser,
}

/// Auth provider backed by a Supabase project
pub struct SupabaseAuthProvider {
    http_client: Client,
    base_url: String,
    service_role_key: SecretString,
}

impl SupabaseAuthProvider {
    pub fn new(base_url: &str, service_role_key: SecretString) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ExternalServiceError::Configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: format!("{}/auth/v1", base_url.trim_end_matches('/')),
            service_role_key,
        })
    }

    fn with_user_token(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .header("apikey", self.service_role_key.expose_secret())
            .bearer_auth(access_token)
    }

    fn with_service_token(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.service_role_key.expose_secret();
        request.header("apikey", key).bearer_auth(key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Auth provider request failed");
            ExternalServiceError::from(e)
        })?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status(), "Auth provider rejected credentials");
                Err(AppError::Authentication(
                    "Invalid or expired access token".to_string(),
                ))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(ExternalServiceError::RateLimited(
                "Auth provider rate limit hit".to_string(),
            )
            .into()),
            status if status.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, "Auth provider refused request");
                Err(crate::domain::ValidationError::InvalidField {
                    field: "request".to_string(),
                    message: extract_message(&body),
                }
                .into())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "Auth provider returned error");
                Err(ExternalServiceError::ApiError {
                    status_code: status.as_u16(),
                    message: body,
                }
                .into())
            }
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, AppError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ExternalServiceError::ParseError(e.to_string()).into())
    }
}

/// GoTrue error bodies use `msg`, `message` or `error_description`
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["msg", "message", "error_description"]
                .iter()
                .find_map(|key| v.get(*key).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| "Request rejected by identity provider".to_string())
}

#[async_trait]
impl AuthProvider for SupabaseAuthProvider {
    #[instrument(skip_all)]
    async fn authenticate(&self, access_token: &str) -> Result<AuthUser, AppError> {
        let request = self.with_user_token(
            self.http_client.get(format!("{}/user", self.base_url)),
            access_token,
        );
        let user: GoTrueUser = Self::parse(self.send(request).await?).await?;
        Ok(user.into())
    }

    #[instrument(skip(self, email))]
    async fn update_email(&self, user_id: &str, email: &str) -> Result<AuthUser, AppError> {
        let request = self.with_service_token(
            self.http_client
                .put(format!("{}/admin/users/{}", self.base_url, user_id))
                .json(&json!({"email": email, "email_confirm": true})),
        );
        let user: GoTrueUser = Self::parse(self.send(request).await?).await?;
        Ok(user.into())
    }

    #[instrument(skip(self))]
    async fn update_username(&self, user_id: &str, username: &str) -> Result<AuthUser, AppError> {
        let request = self.with_service_token(
            self.http_client
                .put(format!("{}/admin/users/{}", self.base_url, user_id))
                .json(&json!({"user_metadata": {"username": username}})),
        );
        let user: GoTrueUser = Self::parse(self.send(request).await?).await?;
        Ok(user.into())
    }

    #[instrument(skip_all)]
    async fn request_email_change(
        &self,
        access_token: &str,
        new_email: &str,
    ) -> Result<(), AppError> {
        let request = self.with_user_token(
            self.http_client
                .put(format!("{}/user", self.base_url))
                .json(&json!({"email": new_email})),
            access_token,
        );
        self.send(request).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn complete_email_change(
        &self,
        new_email: &str,
        token: &str,
    ) -> Result<AuthUser, AppError> {
        let request = self.with_service_token(
            self.http_client
                .post(format!("{}/verify", self.base_url))
                .json(&json!({"type": "email_change", "email": new_email, "token": token})),
        );
        let verified: VerifyResponse = Self::parse(self.send(request).await?).await?;
        Ok(verified.user.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let provider =
            SupabaseAuthProvider::new("https://xyz.supabase.co/", SecretString::from("key"))
                .unwrap();
        assert_eq!(provider.base_url, "https://xyz.supabase.co/auth/v1");
    }

    #[test]
    fn test_user_conversion_reads_username_metadata() {
        let user: GoTrueUser = serde_json::from_value(json!({
            "id": "u-1",
            "email": "",
            "user_metadata": {"username": "alice"}
        }))
        .unwrap();
        let user = AuthUser::from(user);
        assert_eq!(user.email, None);
        assert_eq!(user.username.as_deref(), Some("alice"));
    }

    #[test]
    fn test_extract_message_variants() {
        assert_eq!(extract_message(r#"{"msg":"Email taken"}"#), "Email taken");
        assert_eq!(
            extract_message(r#"{"error_description":"Token expired"}"#),
            "Token expired"
        );
        assert_eq!(
            extract_message("not json"),
            "Request rejected by identity provider"
        );
    }
}
