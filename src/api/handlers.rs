//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    ActivityItem, ActivityParams, AppError, BlockchainError, CardBalance, CardStatusResponse,
    CardView, ClaimCardRequest, ClaimCardResponse, CreateCardRequest, CreateCardResponse,
    DatabaseError, ErrorResponse, ExternalServiceError, HealthResponse, HealthStatus,
    LifecycleError, LockCardResponse, PublicMetrics, RateLimitResponse, SolPriceResponse,
    SyncFundingResponse, UpdateCardRequest,
};

use super::extract::{ApiJson, OptionalUser};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "CryptoCards API",
        version = "0.1.0",
        description = "Create, fund, lock and claim Solana gift cards",
        license(
            name = "MIT"
        )
    ),
    paths(
        create_card_handler,
        get_card_handler,
        update_card_handler,
        lock_card_handler,
        card_status_handler,
        card_balance_handler,
        sync_card_funding_handler,
        claim_card_handler,
        sol_price_handler,
        public_metrics_handler,
        public_activity_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
        super::account::list_user_cards_handler,
        super::account::hide_user_card_handler,
        super::account::update_email_handler,
        super::account::update_username_handler,
        super::account::email_change_request_handler,
        super::account::email_change_complete_handler,
        super::admin::admin_refund_handler,
        super::admin::admin_reconcile_handler,
    ),
    components(
        schemas(
            CreateCardRequest,
            CreateCardResponse,
            CardView,
            UpdateCardRequest,
            LockCardResponse,
            CardStatusResponse,
            CardBalance,
            SyncFundingResponse,
            ClaimCardRequest,
            ClaimCardResponse,
            SolPriceResponse,
            PublicMetrics,
            ActivityItem,
            ActivityParams,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            RateLimitResponse,
            crate::domain::CardStatus,
            crate::domain::CardEventKind,
            crate::domain::PricedHolding,
            crate::domain::TokenHolding,
            crate::domain::AuthUser,
            crate::domain::UpdateEmailRequest,
            crate::domain::UpdateUsernameRequest,
            crate::domain::EmailChangeRequest,
            crate::domain::EmailChangeCompleteRequest,
            crate::domain::AuthActionResponse,
            crate::domain::UserCardsResponse,
            crate::domain::RefundCardResponse,
            crate::domain::ReconciliationReport,
        )
    ),
    tags(
        (name = "cards", description = "Card lifecycle endpoints"),
        (name = "public", description = "Public storefront data"),
        (name = "account", description = "Creator dashboard and identity"),
        (name = "admin", description = "Operator endpoints"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Create a new card
///
/// Guests may create cards; a bearer token attaches the card to its creator.
/// The CVV is returned only in this response.
#[utoipa::path(
    post,
    path = "/cards",
    tag = "cards",
    request_body = CreateCardRequest,
    responses(
        (status = 200, description = "Card created", body = CreateCardResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Invalid bearer token", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_card_handler(
    State(state): State<Arc<AppState>>,
    OptionalUser(user): OptionalUser,
    ApiJson(payload): ApiJson<CreateCardRequest>,
) -> Result<Json<CreateCardResponse>, AppError> {
    let user_id = user.as_ref().map(|u| u.id.as_str());
    let created = state.service.create_card(&payload, user_id).await?;
    Ok(Json(created))
}

/// Get a card's public snapshot
#[utoipa::path(
    get,
    path = "/cards/{public_id}",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (status = 200, description = "Card found", body = CardView),
        (status = 404, description = "Card not found", body = ErrorResponse)
    )
)]
pub async fn get_card_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Result<Json<CardView>, AppError> {
    Ok(Json(state.service.get_card_view(&public_id).await?))
}

/// Edit card details while the card is unlocked
///
/// The owner authenticates with a bearer token; guest cards pass their CVV
/// in the body.
#[utoipa::path(
    patch,
    path = "/cards/{public_id}",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    request_body = UpdateCardRequest,
    responses(
        (status = 200, description = "Card updated", body = CardView),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Bearer token required", body = ErrorResponse),
        (status = 403, description = "Not the card owner", body = ErrorResponse),
        (status = 404, description = "Card not found", body = ErrorResponse),
        (status = 409, description = "Card is locked", body = ErrorResponse)
    )
)]
pub async fn update_card_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
    OptionalUser(user): OptionalUser,
    ApiJson(payload): ApiJson<UpdateCardRequest>,
) -> Result<Json<CardView>, AppError> {
    let view = state
        .service
        .update_metadata(&public_id, &payload, user.as_ref())
        .await?;
    Ok(Json(view))
}

/// Lock a card so it can be claimed
#[utoipa::path(
    post,
    path = "/cards/{public_id}/lock",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (status = 200, description = "Card locked (or already locked)", body = LockCardResponse),
        (status = 404, description = "Card not found", body = ErrorResponse),
        (status = 409, description = "Card is settled or unfunded", body = ErrorResponse)
    )
)]
pub async fn lock_card_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Result<Json<LockCardResponse>, AppError> {
    Ok(Json(state.service.lock_card(&public_id).await?))
}

/// Lifecycle flags, derived status and funding snapshot
#[utoipa::path(
    get,
    path = "/card-status/{public_id}",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (status = 200, description = "Card status", body = CardStatusResponse),
        (status = 404, description = "Card not found", body = ErrorResponse)
    )
)]
pub async fn card_status_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Result<Json<CardStatusResponse>, AppError> {
    Ok(Json(state.service.card_status(&public_id).await?))
}

/// Cached balance from the last funding sync
#[utoipa::path(
    get,
    path = "/card-balance/{public_id}",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (
            status = 200,
            description = "Balance snapshot; zeros with synced_at null before the first sync",
            body = CardBalance
        ),
        (status = 404, description = "Card not found", body = ErrorResponse)
    )
)]
pub async fn card_balance_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Result<Json<CardBalance>, AppError> {
    Ok(Json(state.service.card_balance(&public_id).await?))
}

/// Read the deposit address on chain and refresh the funding snapshot
#[utoipa::path(
    post,
    path = "/sync-card-funding/{public_id}",
    tag = "cards",
    params(
        ("public_id" = String, Path, description = "Card public id")
    ),
    responses(
        (status = 200, description = "Funding synced", body = SyncFundingResponse),
        (status = 404, description = "Card not found", body = ErrorResponse),
        (status = 409, description = "Card already settled", body = ErrorResponse),
        (status = 503, description = "Chain unavailable", body = ErrorResponse)
    )
)]
pub async fn sync_card_funding_handler(
    State(state): State<Arc<AppState>>,
    Path(public_id): Path<String>,
) -> Result<Json<SyncFundingResponse>, AppError> {
    Ok(Json(state.service.sync_funding(&public_id).await?))
}

/// Claim a locked card to a destination wallet
///
/// The claimable amount is re-read from the chain; a protocol tax is withheld.
/// A 504 means the transfer outcome is not yet known and the card stays
/// reserved until it is reconciled.
#[utoipa::path(
    post,
    path = "/claim-card",
    tag = "cards",
    request_body = ClaimCardRequest,
    responses(
        (status = 200, description = "Card claimed", body = ClaimCardResponse),
        (status = 400, description = "Invalid request or destination", body = ErrorResponse),
        (status = 404, description = "Card not found", body = ErrorResponse),
        (
            status = 409,
            description = "Wrong CVV, not locked, already settled or no balance",
            body = ErrorResponse
        ),
        (status = 504, description = "Transfer outcome unknown", body = ErrorResponse)
    )
)]
pub async fn claim_card_handler(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<ClaimCardRequest>,
) -> Result<Json<ClaimCardResponse>, AppError> {
    Ok(Json(state.service.claim_card(&payload).await?))
}

/// Current SOL/USD price
#[utoipa::path(
    get,
    path = "/sol-price",
    tag = "public",
    responses(
        (status = 200, description = "SOL price", body = SolPriceResponse),
        (status = 502, description = "Price feed unavailable", body = ErrorResponse)
    )
)]
pub async fn sol_price_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SolPriceResponse>, AppError> {
    Ok(Json(state.service.sol_price().await?))
}

/// Aggregate storefront counters
#[utoipa::path(
    get,
    path = "/public-metrics",
    tag = "public",
    responses(
        (status = 200, description = "Metrics", body = PublicMetrics)
    )
)]
pub async fn public_metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PublicMetrics>, AppError> {
    Ok(Json(state.service.public_metrics().await?))
}

/// Recent lifecycle events with masked card ids
#[utoipa::path(
    get,
    path = "/public-activity",
    tag = "public",
    params(
        (
            "limit" = Option<i64>,
            Query,
            description = "Maximum number of events to return (1-100, default: 20)"
        )
    ),
    responses(
        (status = 200, description = "Recent events", body = Vec<ActivityItem>),
        (status = 400, description = "Invalid limit", body = ErrorResponse)
    )
)]
pub async fn public_activity_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Vec<ActivityItem>>, AppError> {
    Ok(Json(state.service.public_activity(&params).await?))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness check
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness check
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Status and error tag for a lifecycle conflict
fn lifecycle_status(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::InvalidDestination => StatusCode::BAD_REQUEST,
        _ => StatusCode::CONFLICT,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                DatabaseError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", db_err.to_string())
                }
                DatabaseError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "duplicate", db_err.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Blockchain(bc_err) => match bc_err {
                BlockchainError::Connection(_) | BlockchainError::RpcError(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "blockchain_error",
                    self.to_string(),
                ),
                BlockchainError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                BlockchainError::InvalidAddress(_) => (
                    StatusCode::BAD_REQUEST,
                    "invalid_address",
                    bc_err.to_string(),
                ),
                BlockchainError::TransactionFailed(_) | BlockchainError::InsufficientFunds => (
                    StatusCode::BAD_GATEWAY,
                    "transaction_failed",
                    self.to_string(),
                ),
                BlockchainError::InvalidKey(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "blockchain_error",
                    self.to_string(),
                ),
            },
            AppError::ExternalService(ext_err) => match ext_err {
                ExternalServiceError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                ExternalServiceError::Unavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "external_service_error",
                    self.to_string(),
                ),
                ExternalServiceError::RateLimited(_) => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    ext_err.to_string(),
                ),
                _ => (
                    StatusCode::BAD_GATEWAY,
                    "external_service_error",
                    self.to_string(),
                ),
            },
            AppError::Lifecycle(lc_err) => {
                (lifecycle_status(lc_err), lc_err.code(), lc_err.to_string())
            }
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Validation(v_err) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                v_err.to_string(),
            ),
            AppError::Authentication(msg) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                msg.clone(),
            ),
            AppError::Authorization(msg) => (
                StatusCode::FORBIDDEN,
                "authorization_error",
                msg.clone(),
            ),
            AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
            AppError::NotSupported(msg) => (
                StatusCode::NOT_IMPLEMENTED,
                "not_supported",
                msg.clone(),
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".to_string(),
            ),
        };

        // Upstream details stay in the log
        let message = if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
            generic_message(status).to_string()
        } else {
            message
        };

        let body = Json(ErrorResponse {
            error: message,
            r#type: error_type.to_string(),
        });

        (status, body).into_response()
    }
}

fn generic_message(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_IMPLEMENTED => "This feature is not configured on this server",
        StatusCode::BAD_GATEWAY => "An upstream service returned an error",
        StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable",
        StatusCode::GATEWAY_TIMEOUT => {
            "The operation did not complete in time; check the card status before retrying"
        }
        _ => "Internal server error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: AppError) -> (StatusCode, ErrorResponse) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_lifecycle_errors_are_conflicts() {
        let (status, body) = render(LifecycleError::AlreadyClaimed.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.r#type, "already_claimed");
        assert_eq!(body.error, "Card has already been claimed");

        let (status, body) = render(LifecycleError::InvalidCvv.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.r#type, "invalid_cvv");
    }

    #[tokio::test]
    async fn test_invalid_destination_is_bad_request() {
        let (status, body) = render(LifecycleError::InvalidDestination.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.r#type, "invalid_destination");
    }

    #[tokio::test]
    async fn test_not_found() {
        let (status, body) = render(AppError::card_not_found("AB12CD34")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.r#type, "not_found");
    }

    #[tokio::test]
    async fn test_server_errors_hide_details() {
        let (status, body) =
            render(BlockchainError::RpcError("node http://secret-rpc failed".into()).into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.error.contains("secret-rpc"));

        let (status, body) = render(BlockchainError::Timeout("slow".into()).into()).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body.r#type, "timeout");
    }

    #[tokio::test]
    async fn test_auth_statuses() {
        let (status, _) = render(AppError::Authentication("Bearer token required".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = render(AppError::Authorization("no".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) =
            render(AppError::NotSupported("Authentication is not configured".into())).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body.r#type, "not_supported");
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let (status, body) = render(AppError::RateLimited).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.r#type, "rate_limited");
    }
}
