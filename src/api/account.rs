//! Creator dashboard and identity management handlers.
//!
//! Every route here requires a bearer token and answers 501 when no identity
//! provider is configured.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use crate::app::AppState;
use crate::domain::{
    AppError, AuthActionResponse, EmailChangeCompleteRequest, EmailChangeRequest, ErrorResponse,
    UpdateEmailRequest, UpdateUsernameRequest, UserCardsResponse,
};

use super::extract::{ApiJson, AuthenticatedUser};

/// List the caller's cards
///
/// GET /user/cards
#[utoipa::path(
    get,
    path = "/user/cards",
    tag = "account",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Cards created by the caller", body = UserCardsResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 501, description = "Authentication not configured", body = ErrorResponse)
    )
)]
pub async fn list_user_cards_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedUser,
) -> Result<Json<UserCardsResponse>, AppError> {
    let cards = state.accounts.list_user_cards(&auth.user).await?;
    Ok(Json(UserCardsResponse { cards }))
}

/// Hide a card from the caller's dashboard
///
/// DELETE /user/cards/{public_id}
#[utoipa::path(
    delete,
    path = "/user/cards/{public_id}",
    tag = "account",
    security(("bearer" = [])),
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (status = 204, description = "Card hidden"),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Card belongs to another user", body = ErrorResponse),
        (status = 404, description = "Card not found", body = ErrorResponse)
    )
)]
pub async fn hide_user_card_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedUser,
    Path(public_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.accounts.hide_card(&auth.user, &public_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Set the caller's email without a confirmation round-trip
#[utoipa::path(
    post,
    path = "/auth/update-email",
    tag = "account",
    security(("bearer" = [])),
    request_body = UpdateEmailRequest,
    responses(
        (status = 200, description = "Email updated", body = AuthActionResponse),
        (status = 400, description = "Invalid email", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    )
)]
pub async fn update_email_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedUser,
    ApiJson(payload): ApiJson<UpdateEmailRequest>,
) -> Result<Json<AuthActionResponse>, AppError> {
    let user = state.accounts.update_email(&auth.user, &payload).await?;
    info!(user_id = %user.id, "Email updated");
    Ok(Json(AuthActionResponse {
        success: true,
        user: Some(user),
    }))
}

#[utoipa::path(
    post,
    path = "/auth/update-username",
    tag = "account",
    security(("bearer" = [])),
    request_body = UpdateUsernameRequest,
    responses(
        (status = 200, description = "Username updated", body = AuthActionResponse),
        (status = 400, description = "Invalid username", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    )
)]
pub async fn update_username_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedUser,
    ApiJson(payload): ApiJson<UpdateUsernameRequest>,
) -> Result<Json<AuthActionResponse>, AppError> {
    let user = state.accounts.update_username(&auth.user, &payload).await?;
    Ok(Json(AuthActionResponse {
        success: true,
        user: Some(user),
    }))
}

/// Start a confirmed email change; the provider mails a one-time token
#[utoipa::path(
    post,
    path = "/auth/email-change-request",
    tag = "account",
    security(("bearer" = [])),
    request_body = EmailChangeRequest,
    responses(
        (status = 200, description = "Confirmation sent", body = AuthActionResponse),
        (status = 400, description = "Invalid email", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    )
)]
pub async fn email_change_request_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthenticatedUser,
    ApiJson(payload): ApiJson<EmailChangeRequest>,
) -> Result<Json<AuthActionResponse>, AppError> {
    state
        .accounts
        .request_email_change(&auth.access_token, &payload)
        .await?;
    Ok(Json(AuthActionResponse {
        success: true,
        user: None,
    }))
}

/// Finish an email change with the mailed token
#[utoipa::path(
    post,
    path = "/auth/email-change-complete",
    tag = "account",
    security(("bearer" = [])),
    request_body = EmailChangeCompleteRequest,
    responses(
        (status = 200, description = "Email changed", body = AuthActionResponse),
        (status = 400, description = "Invalid or expired token", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    )
)]
pub async fn email_change_complete_handler(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    ApiJson(payload): ApiJson<EmailChangeCompleteRequest>,
) -> Result<Json<AuthActionResponse>, AppError> {
    let user = state.accounts.complete_email_change(&payload).await?;
    Ok(Json(AuthActionResponse {
        success: true,
        user: Some(user),
    }))
}
