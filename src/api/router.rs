//! Router assembly: API routes, middleware stack, Swagger UI and SPA fallback.

use std::env;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
};
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    services::{ServeDir, ServeFile},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::domain::RateLimitResponse;

use super::account::{
    email_change_complete_handler, email_change_request_handler, hide_user_card_handler,
    list_user_cards_handler, update_email_handler, update_username_handler,
};
use super::admin::{admin_reconcile_handler, admin_refund_handler};
use super::handlers::{
    ApiDoc, card_balance_handler, card_status_handler, claim_card_handler, create_card_handler,
    get_card_handler, health_check_handler, liveness_handler, lock_card_handler,
    public_activity_handler, public_metrics_handler, readiness_handler, sol_price_handler,
    sync_card_funding_handler, update_card_handler,
};

type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Global request rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Requests allowed in a burst above the sustained rate
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            burst_size: 40,
        }
    }
}

impl RateLimitConfig {
    /// Read `RATE_LIMIT_RPS` and `RATE_LIMIT_BURST`, falling back to defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests_per_second: env::var("RATE_LIMIT_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.requests_per_second),
            burst_size: env::var("RATE_LIMIT_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.burst_size),
        }
    }

    fn quota(&self) -> Quota {
        let rps = NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst_size.max(self.requests_per_second)).unwrap_or(rps);
        Quota::per_second(rps).allow_burst(burst)
    }
}

/// Middleware and static asset settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Directory holding the built single-page app
    pub static_dir: PathBuf,
    pub request_timeout: Duration,
    /// Maximum accepted request body in bytes
    pub body_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            static_dir: PathBuf::from("./public"),
            request_timeout: Duration::from_secs(90),
            body_limit: 64 * 1024,
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            static_dir: env::var("STATIC_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            request_timeout: env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            body_limit: defaults.body_limit,
        }
    }
}

/// Router with default middleware settings and no rate limiting
pub fn create_router(state: Arc<AppState>) -> Router {
    build_router(state, &RouterConfig::default(), None)
}

/// Router with default middleware settings and a global rate limit
pub fn create_router_with_rate_limit(state: Arc<AppState>, rate_limit: RateLimitConfig) -> Router {
    build_router(state, &RouterConfig::default(), Some(rate_limit))
}

pub fn build_router(
    state: Arc<AppState>,
    config: &RouterConfig,
    rate_limit: Option<RateLimitConfig>,
) -> Router {
    let api = Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/sol-price", get(sol_price_handler))
        .route("/public-metrics", get(public_metrics_handler))
        .route("/public-activity", get(public_activity_handler))
        .route("/cards", post(create_card_handler))
        .route(
            "/cards/{public_id}",
            get(get_card_handler).patch(update_card_handler),
        )
        .route("/cards/{public_id}/lock", post(lock_card_handler))
        .route("/card-status/{public_id}", get(card_status_handler))
        .route("/card-balance/{public_id}", get(card_balance_handler))
        .route(
            "/sync-card-funding/{public_id}",
            post(sync_card_funding_handler),
        )
        .route("/claim-card", post(claim_card_handler))
        .route("/user/cards", get(list_user_cards_handler))
        .route("/user/cards/{public_id}", delete(hide_user_card_handler))
        .route("/auth/update-email", post(update_email_handler))
        .route("/auth/update-username", post(update_username_handler))
        .route(
            "/auth/email-change-request",
            post(email_change_request_handler),
        )
        .route(
            "/auth/email-change-complete",
            post(email_change_complete_handler),
        )
        .route(
            "/admin/cards/{public_id}/refund",
            post(admin_refund_handler),
        )
        .route("/admin/settlements/reconcile", post(admin_reconcile_handler));

    let api = match rate_limit {
        Some(limits) => {
            let limiter = Arc::new(RateLimiter::direct(limits.quota()));
            api.layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        }
        None => api,
    };

    let index = config.static_dir.join("index.html");
    let spa = ServeDir::new(&config.static_dir).not_found_service(ServeFile::new(index));

    api.fallback_service(spa)
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(RequestBodyLimitLayer::new(config.body_limit))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn rate_limit_middleware(
    State(limiter): State<Arc<GlobalRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(request).await,
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after = wait.as_secs().max(1);
            warn!(path = %request.uri().path(), retry_after, "Rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after.to_string())],
                Json(RateLimitResponse {
                    error: "Too many requests".to_string(),
                    r#type: "rate_limited".to_string(),
                    retry_after,
                }),
            )
                .into_response()
        }
    }
}
