//! Admin API handlers for operator settlement actions.
//!
//! Guarded by the `x-admin-key` header; the routes answer 501 when no key is
//! configured.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::app::AppState;
use crate::domain::{
    AppError, ErrorResponse, ReconciliationReport, RefundCardResponse, ValidationError,
};

use super::extract::AdminKey;

const MAX_RECONCILE_BATCH: i64 = 500;

/// Query parameters for a manual reconciliation pass
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema, IntoParams)]
pub struct ReconcileParams {
    /// Pending settlements to examine (1-500, default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

fn default_batch_size() -> i64 {
    50
}

/// Refund an expired card to its creator
///
/// POST /admin/cards/{public_id}/refund
#[utoipa::path(
    post,
    path = "/admin/cards/{public_id}/refund",
    tag = "admin",
    params(
        ("public_id" = String, Path, description = "Card public id"),
        ("x-admin-key" = String, Header, description = "Admin API key")
    ),
    responses(
        (status = 200, description = "Card refunded", body = RefundCardResponse),
        (status = 401, description = "Missing admin key", body = ErrorResponse),
        (status = 403, description = "Wrong admin key", body = ErrorResponse),
        (status = 404, description = "Card not found", body = ErrorResponse),
        (status = 409, description = "Card not refundable", body = ErrorResponse),
        (status = 501, description = "Admin API not configured", body = ErrorResponse),
    )
)]
pub async fn admin_refund_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminKey,
    Path(public_id): Path<String>,
) -> Result<Json<RefundCardResponse>, AppError> {
    let refund = state.service.refund_card(&public_id).await?;
    info!(public_id = %public_id, signature = %refund.signature, "Admin refund completed");
    Ok(Json(refund))
}

/// Reconcile pending settlements now instead of waiting for the worker
///
/// POST /admin/settlements/reconcile
#[utoipa::path(
    post,
    path = "/admin/settlements/reconcile",
    tag = "admin",
    params(
        ReconcileParams,
        ("x-admin-key" = String, Header, description = "Admin API key")
    ),
    responses(
        (status = 200, description = "Pass completed", body = ReconciliationReport),
        (status = 400, description = "Invalid batch size", body = ErrorResponse),
        (status = 401, description = "Missing admin key", body = ErrorResponse),
        (status = 403, description = "Wrong admin key", body = ErrorResponse),
        (status = 501, description = "Admin API not configured", body = ErrorResponse),
    )
)]
pub async fn admin_reconcile_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminKey,
    Query(params): Query<ReconcileParams>,
) -> Result<Json<ReconciliationReport>, AppError> {
    if !(1..=MAX_RECONCILE_BATCH).contains(&params.batch_size) {
        return Err(ValidationError::InvalidField {
            field: "batch_size".to_string(),
            message: format!("must be between 1 and {}", MAX_RECONCILE_BATCH),
        }
        .into());
    }
    let report = state.service.run_reconciliation_pass(params.batch_size).await?;
    info!(
        examined = report.examined,
        completed = report.completed,
        released = report.released,
        "Admin reconciliation pass finished"
    );
    Ok(Json(report))
}
