//! Identity and dashboard operations.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, AuthProvider, AuthUser, CardView, DatabaseClient, EmailChangeCompleteRequest,
    EmailChangeRequest, UpdateEmailRequest, UpdateUsernameRequest, ValidationError,
};

/// Creator dashboard plus thin delegation to the identity provider
pub struct AccountService {
    db_client: Arc<dyn DatabaseClient>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl AccountService {
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        auth_provider: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        Self {
            db_client,
            auth_provider,
        }
    }

    fn provider(&self) -> Result<&Arc<dyn AuthProvider>, AppError> {
        self.auth_provider
            .as_ref()
            .ok_or_else(|| AppError::NotSupported("Authentication is not configured".to_string()))
    }

    #[must_use]
    pub fn is_auth_configured(&self) -> bool {
        self.auth_provider.is_some()
    }

    /// Resolve a bearer token to a user
    #[instrument(skip_all)]
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthUser, AppError> {
        if access_token.trim().is_empty() {
            return Err(AppError::Authentication("Bearer token required".to_string()));
        }
        self.provider()?.authenticate(access_token).await
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn list_user_cards(&self, user: &AuthUser) -> Result<Vec<CardView>, AppError> {
        let cards = self.db_client.list_cards_for_user(&user.id).await?;
        Ok(cards.iter().map(CardView::from).collect())
    }

    /// Remove a card from the owner's dashboard; the record itself stays
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn hide_card(&self, user: &AuthUser, public_id: &str) -> Result<(), AppError> {
        let card = self
            .db_client
            .get_card(public_id)
            .await?
            .ok_or_else(|| AppError::card_not_found(public_id))?;

        if card.user_id.as_deref() != Some(user.id.as_str()) {
            warn!(public_id = %public_id, "Hide requested by non-owner");
            return Err(AppError::Authorization("Card belongs to another user".to_string()));
        }

        if self.db_client.hide_card_for_user(public_id, &user.id).await? {
            info!(public_id = %public_id, "Card hidden from dashboard");
        }
        Ok(())
    }

    #[instrument(skip(self, user, request), fields(user_id = %user.id))]
    pub async fn update_email(
        &self,
        user: &AuthUser,
        request: &UpdateEmailRequest,
    ) -> Result<AuthUser, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        self.provider()?.update_email(&user.id, &request.email).await
    }

    #[instrument(skip(self, user, request), fields(user_id = %user.id))]
    pub async fn update_username(
        &self,
        user: &AuthUser,
        request: &UpdateUsernameRequest,
    ) -> Result<AuthUser, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        let username = request.username.trim();
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ValidationError::InvalidField {
                field: "username".to_string(),
                message: "Only letters, digits, '_' and '-' are allowed".to_string(),
            }
            .into());
        }
        self.provider()?.update_username(&user.id, username).await
    }

    #[instrument(skip_all)]
    pub async fn request_email_change(
        &self,
        access_token: &str,
        request: &EmailChangeRequest,
    ) -> Result<(), AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        self.provider()?
            .request_email_change(access_token, &request.new_email)
            .await
    }

    #[instrument(skip_all)]
    pub async fn complete_email_change(
        &self,
        request: &EmailChangeCompleteRequest,
    ) -> Result<AuthUser, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        self.provider()?
            .complete_email_change(&request.new_email, &request.token)
            .await
    }
}
