//! Additional integration tests for specific request flows.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use cryptocards_server::api::{
    RateLimitConfig, RouterConfig, build_router, create_router, create_router_with_rate_limit,
};
use cryptocards_server::app::AppState;
use cryptocards_server::domain::{AuthUser, CreateCardResponse, LifecyclePolicy};
use cryptocards_server::test_utils::{
    MOCK_EMAIL_OTP, MockAuthProvider, MockBlockchainClient, MockDatabaseClient,
    MockDepositProvider, MockNotifier, MockPriceOracle,
};

const ADMIN_KEY: &str = "admin-secret";
const ALICE_TOKEN: &str = "alice-token";
const BOB_TOKEN: &str = "bob-token";

fn wallet(seed: u8) -> String {
    bs58::encode([seed; 32]).into_string()
}

fn user(id: &str) -> AuthUser {
    AuthUser {
        id: id.to_string(),
        email: Some(format!("{}@example.com", id)),
        username: None,
    }
}

struct Mocks {
    db: Arc<MockDatabaseClient>,
    chain: Arc<MockBlockchainClient>,
}

fn base_state() -> (AppState, Mocks) {
    let db = Arc::new(MockDatabaseClient::new());
    let chain = Arc::new(MockBlockchainClient::new());
    let state = AppState::new(
        Arc::clone(&db) as _,
        Arc::clone(&chain) as _,
        Arc::new(MockPriceOracle::new()),
        Arc::new(MockNotifier::new()),
        Arc::new(MockDepositProvider::new()),
    )
    .with_policy(LifecyclePolicy::default().with_tax_collection_address(wallet(9)));
    (state, Mocks { db, chain })
}

fn create_test_router() -> (Router, Mocks) {
    let (state, mocks) = base_state();
    (create_router(Arc::new(state)), mocks)
}

fn create_full_router() -> (Router, Mocks) {
    let (state, mocks) = base_state();
    let auth = MockAuthProvider::new()
        .with_user(ALICE_TOKEN, user("alice"))
        .with_user(BOB_TOKEN, user("bob"));
    let state = state
        .with_auth_provider(Arc::new(auth))
        .with_admin_api_key(SecretString::from(ADMIN_KEY));
    (create_router(Arc::new(state)), mocks)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn bearer_request(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token));
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_card(router: &Router, body: Value) -> CreateCardResponse {
    let (status, body) = send(router, json_request("POST", "/cards", body)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body).unwrap()
}

#[tokio::test]
async fn test_create_card_malformed_json() {
    let (router, _) = create_test_router();

    let request = Request::builder()
        .method("POST")
        .uri("/cards")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "validation_error");
}

#[tokio::test]
async fn test_create_card_rejects_unknown_fields() {
    let (router, _) = create_test_router();
    let (status, _) = send(
        &router,
        json_request("POST", "/cards", json!({"currency": "USD", "cvv": "123456"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_card_validation() {
    let (router, _) = create_test_router();

    let (status, _) = send(&router, json_request("POST", "/cards", json!({"currency": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        json_request("POST", "/cards", json!({"currency": "USD", "amount_fiat": -5.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
    let (status, body) = send(
        &router,
        json_request("POST", "/cards", json!({"currency": "USD", "expires_at": past})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "validation_error");
}

#[tokio::test]
async fn test_get_card_hides_cvv() {
    let (router, _) = create_test_router();
    let card = create_card(&router, json!({"currency": "eur", "message": "Hi"})).await;

    let (status, body) = send(&router, get(&format!("/cards/{}", card.public_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["public_id"], card.public_id);
    assert_eq!(body["currency"], "EUR");
    assert_eq!(body["status"], "created");
    assert!(body.get("cvv").is_none());
    assert!(!body.to_string().contains(&format!("\"{}\"", card.cvv)));
}

#[tokio::test]
async fn test_unknown_card_is_not_found() {
    let (router, _) = create_test_router();
    for uri in ["/cards/NOPE2345", "/card-status/NOPE2345", "/card-balance/NOPE2345"] {
        let (status, body) = send(&router, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["type"], "not_found");
    }
}

#[tokio::test]
async fn test_balance_before_first_sync() {
    let (router, _) = create_test_router();
    let card = create_card(&router, json!({"currency": "USD"})).await;

    let (status, body) = send(&router, get(&format!("/card-balance/{}", card.public_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lamports"], 0);
    assert_eq!(body["total_value_sol"], 0.0);
    assert!(body["synced_at"].is_null());
    assert_eq!(body["deposit_address"], card.deposit_address.unwrap());
}

#[tokio::test]
async fn test_sync_without_deposit_address() {
    let state = AppState::new(
        Arc::new(MockDatabaseClient::new()),
        Arc::new(MockBlockchainClient::new()),
        Arc::new(MockPriceOracle::new()),
        Arc::new(MockNotifier::new()),
        Arc::new(MockDepositProvider::unconfigured()),
    );
    let router = create_router(Arc::new(state));
    let card = create_card(&router, json!({"currency": "USD"})).await;
    assert!(card.deposit_address.is_none());

    let (status, body) = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/sync-card-funding/{}", card.public_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "deposit_address_unassigned");
}

#[tokio::test]
async fn test_chain_outage_on_sync_is_unavailable() {
    let db = Arc::new(MockDatabaseClient::new());
    let state = AppState::new(
        db as _,
        Arc::new(MockBlockchainClient::failing("rpc down")),
        Arc::new(MockPriceOracle::new()),
        Arc::new(MockNotifier::new()),
        Arc::new(MockDepositProvider::new()),
    );
    let router = create_router(Arc::new(state));
    let card = create_card(&router, json!({"currency": "USD"})).await;

    let (status, body) = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/sync-card-funding/{}", card.public_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    // Internal details stay in the logs
    assert!(!body["error"].as_str().unwrap().contains("rpc down"));
}

#[tokio::test]
async fn test_guest_token_ignored_without_auth() {
    let (router, mocks) = create_test_router();
    let request = bearer_request("POST", "/cards", "whatever", Some(json!({"currency": "USD"})));
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(mocks.db.get_all_cards()[0].user_id.is_none());
}

#[tokio::test]
async fn test_account_routes_unconfigured() {
    let (router, _) = create_test_router();

    let (status, body) = send(
        &router,
        bearer_request("GET", "/user/cards", ALICE_TOKEN, None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["type"], "not_supported");

    let (status, _) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/update-username",
            ALICE_TOKEN,
            Some(json!({"username": "alice"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_account_routes_require_token() {
    let (router, _) = create_full_router();

    let (status, body) = send(&router, get("/user/cards")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "authentication_error");

    let (status, _) = send(&router, bearer_request("GET", "/user/cards", "stolen", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_owned_card_dashboard() {
    let (router, _) = create_full_router();

    let request = bearer_request("POST", "/cards", ALICE_TOKEN, Some(json!({"currency": "USD"})));
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    let owned: CreateCardResponse = serde_json::from_value(body).unwrap();
    let guest = create_card(&router, json!({"currency": "USD"})).await;

    let (status, body) = send(
        &router,
        bearer_request("GET", "/user/cards", ALICE_TOKEN, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cards = body["cards"].as_array().unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0]["public_id"], owned.public_id);

    // Someone else's card, and a guest card, cannot be hidden
    let uri = format!("/user/cards/{}", owned.public_id);
    let (status, _) = send(&router, bearer_request("DELETE", &uri, BOB_TOKEN, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let guest_uri = format!("/user/cards/{}", guest.public_id);
    let (status, _) = send(&router, bearer_request("DELETE", &guest_uri, ALICE_TOKEN, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let response = router
        .clone()
        .oneshot(bearer_request("DELETE", &uri, ALICE_TOKEN, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (_, body) = send(&router, bearer_request("GET", "/user/cards", ALICE_TOKEN, None)).await;
    assert!(body["cards"].as_array().unwrap().is_empty());

    // Hidden, not deleted
    let (status, _) = send(&router, get(&format!("/cards/{}", owned.public_id))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_owner_edits_metadata_without_cvv() {
    let (router, _) = create_full_router();
    let request = bearer_request("POST", "/cards", ALICE_TOKEN, Some(json!({"currency": "USD"})));
    let (_, body) = send(&router, request).await;
    let card: CreateCardResponse = serde_json::from_value(body).unwrap();
    let uri = format!("/cards/{}", card.public_id);

    let (status, body) = send(
        &router,
        bearer_request("PATCH", &uri, ALICE_TOKEN, Some(json!({"message": "From Alice"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "From Alice");

    let (status, _) = send(&router, json_request("PATCH", &uri, json!({"message": "anon"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &router,
        bearer_request("PATCH", &uri, BOB_TOKEN, Some(json!({"message": "From Bob"}))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_profile_updates() {
    let (router, _) = create_full_router();

    let (status, body) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/update-username",
            ALICE_TOKEN,
            Some(json!({"username": "alice_01"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["username"], "alice_01");

    let (status, _) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/update-username",
            ALICE_TOKEN,
            Some(json!({"username": "bad name!"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/update-email",
            ALICE_TOKEN,
            Some(json!({"email": "new@alice.io"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["email"], "new@alice.io");

    let (status, _) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/update-email",
            ALICE_TOKEN,
            Some(json!({"email": "not-an-email"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_email_change_flow() {
    let (router, _) = create_full_router();

    let (status, body) = send(
        &router,
        bearer_request(
            "POST",
            "/auth/email-change-request",
            BOB_TOKEN,
            Some(json!({"new_email": "bob@new.io"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["user"].is_null());

    let (status, _) = send(
        &router,
        json_request(
            "POST",
            "/auth/email-change-complete",
            json!({"new_email": "bob@new.io", "token": "000000"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        json_request(
            "POST",
            "/auth/email-change-complete",
            json!({"new_email": "bob@new.io", "token": MOCK_EMAIL_OTP}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["id"], "bob");
    assert_eq!(body["user"]["email"], "bob@new.io");
}

fn admin_request(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(key) = key {
        builder = builder.header("x-admin-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_admin_routes_disabled_without_key() {
    let (router, _) = create_test_router();
    let (status, _) = send(
        &router,
        admin_request("/admin/settlements/reconcile", Some(ADMIN_KEY)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_admin_key_checks() {
    let (router, _) = create_full_router();

    let (status, _) = send(&router, admin_request("/admin/settlements/reconcile", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &router,
        admin_request("/admin/settlements/reconcile", Some("guess")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &router,
        admin_request("/admin/settlements/reconcile", Some(ADMIN_KEY)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["examined"], 0);

    let (status, _) = send(
        &router,
        admin_request("/admin/settlements/reconcile?batch_size=0", Some(ADMIN_KEY)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_refund_of_expired_card() {
    let (router, mocks) = create_full_router();
    let refund_to = wallet(5);
    let card = create_card(&router, json!({"currency": "USD", "refund_address": refund_to})).await;
    let deposit = card.deposit_address.clone().unwrap();
    mocks.chain.set_lamports(&deposit, 1_000_000_000);
    let uri = format!("/admin/cards/{}/refund", card.public_id);

    // Not expired yet
    let (status, body) = send(&router, admin_request(&uri, Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "not_expired");

    // Locked but never claimed before expiry
    let lock = Request::builder()
        .method("POST")
        .uri(format!("/cards/{}/lock", card.public_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, lock).await;
    assert_eq!(status, StatusCode::OK);
    mocks.db.modify_card(&card.public_id, |c| {
        c.expires_at = Some(Utc::now() - Duration::minutes(5));
    });

    let (status, body) = send(&router, admin_request(&uri, Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["destination"], refund_to);
    assert_eq!(body["amount_sol"], 1.0);

    // Refunds carry no tax
    let plans = mocks.chain.get_prepared_payouts();
    assert_eq!(plans.len(), 1);
    assert!(plans[0].legs.iter().all(|leg| leg.tax == 0));

    let (_, status_body) = send(&router, get(&format!("/card-status/{}", card.public_id))).await;
    assert_eq!(status_body["status"], "refunded");

    // Refunded cards cannot be claimed
    let (status, body) = send(
        &router,
        json_request(
            "POST",
            "/claim-card",
            json!({"public_id": card.public_id, "cvv": card.cvv, "destination_wallet": wallet(7)}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "already_refunded");
}

#[tokio::test]
async fn test_admin_refund_without_address_flags_operator() {
    let (router, mocks) = create_full_router();
    let card = create_card(&router, json!({"currency": "USD"})).await;
    mocks.chain.set_lamports(card.deposit_address.as_deref().unwrap(), 1_000_000_000);
    mocks.db.modify_card(&card.public_id, |c| {
        c.expires_at = Some(Utc::now() - Duration::minutes(5));
    });

    let uri = format!("/admin/cards/{}/refund", card.public_id);
    let (status, body) = send(&router, admin_request(&uri, Some(ADMIN_KEY))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "refund_needs_operator");

    let (_, status_body) = send(&router, get(&format!("/card-status/{}", card.public_id))).await;
    assert_eq!(status_body["needs_operator"], true);
    assert!(mocks.chain.get_broadcasts().is_empty());
}

#[tokio::test]
async fn test_public_feeds() {
    let (router, _) = create_test_router();
    let card = create_card(&router, json!({"currency": "USD"})).await;

    let (status, body) = send(&router, get("/public-activity?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["kind"], "created");
    let masked = items[0]["card"].as_str().unwrap();
    assert_ne!(masked, card.public_id);
    assert!(masked.contains('*'));

    let (status, _) = send(&router, get("/public-activity?limit=1000")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&router, get("/public-metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_cards"], 1);
    assert_eq!(body["claimed_cards"], 0);

    let (status, body) = send(&router, get("/sol-price")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sol_usd"], 150.0);
}

#[tokio::test]
async fn test_price_feed_outage() {
    let state = AppState::new(
        Arc::new(MockDatabaseClient::new()),
        Arc::new(MockBlockchainClient::new()),
        Arc::new(MockPriceOracle::failing("feed down")),
        Arc::new(MockNotifier::new()),
        Arc::new(MockDepositProvider::new()),
    );
    let router = create_router(Arc::new(state));
    let (status, _) = send(&router, get("/sol-price")).await;
    assert!(status.is_server_error());
}

#[tokio::test]
async fn test_health_endpoints() {
    let (router, mocks) = create_test_router();

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = send(&router, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);

    mocks.db.set_healthy(false);
    let (status, _) = send(&router, get("/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rate_limiting_rejects_burst() {
    let (state, _) = base_state();
    let router = create_router_with_rate_limit(
        Arc::new(state),
        RateLimitConfig {
            requests_per_second: 1,
            burst_size: 1,
        },
    );

    let (status, _) = send(&router, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);

    let response = router.clone().oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["type"], "rate_limited");
    assert!(body["retry_after"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let (router, _) = create_test_router();
    let (status, body) = send(&router, get("/api-docs/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "CryptoCards API");
    assert!(body["paths"]["/claim-card"].is_object());
    assert!(body["paths"]["/cards/{public_id}/lock"].is_object());
}

#[tokio::test]
async fn test_spa_fallback_serves_index() {
    let dir = std::env::temp_dir().join(format!("cryptocards-spa-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("index.html"), "<html>cards</html>").unwrap();

    let (state, _) = base_state();
    let config = RouterConfig {
        static_dir: dir.clone(),
        ..RouterConfig::default()
    };
    let router = build_router(Arc::new(state), &config, None);

    for uri in ["/", "/claim/K7MX3QPA"] {
        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<html>cards</html>");
    }

    // API routes still win over the fallback
    let (status, _) = send(&router, get("/cards/NOPE2345")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    std::fs::remove_dir_all(&dir).ok();
}
