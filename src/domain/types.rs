//! Request/response types with validation support.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::card::{Card, CardMetadataUpdate, CardStatus, Settlement};
use super::funding::{FundingSnapshot, PricedHolding};

/// Request to create a new gift card
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateCardRequest {
    /// Greeting shown on the card
    #[validate(length(max = 500, message = "Message must be at most 500 characters"))]
    #[schema(example = "Happy birthday!")]
    pub message: Option<String>,
    /// Display currency for the fiat amount
    #[validate(length(min = 1, max = 10, message = "Currency is required"))]
    #[schema(example = "USD")]
    pub currency: String,
    #[validate(range(min = 0.0, message = "Amount must not be negative"))]
    #[schema(example = 20.0)]
    pub amount_fiat: Option<f64>,
    /// Mint the card is meant to be funded with (display only)
    #[validate(length(min = 32, max = 44, message = "Token mint must be a Solana address"))]
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[validate(url(message = "Template URL must be a valid URL"))]
    pub template_url: Option<String>,
    /// Creator wallet for expiry refunds
    #[validate(length(min = 32, max = 44, message = "Refund address must be a Solana address"))]
    pub refund_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateCardResponse {
    #[schema(example = "K7MX3QPA")]
    pub public_id: String,
    #[schema(example = "482913")]
    pub cvv: String,
    #[schema(example = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin")]
    pub deposit_address: Option<String>,
}

/// Public card snapshot; never carries the CVV
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CardView {
    pub public_id: String,
    pub deposit_address: Option<String>,
    pub message: Option<String>,
    pub currency: String,
    pub amount_fiat: Option<f64>,
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_url: Option<String>,
    pub status: CardStatus,
    pub funded: bool,
    pub locked: bool,
    pub claimed: bool,
    pub refunded: bool,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Card> for CardView {
    fn from(card: &Card) -> Self {
        Self {
            public_id: card.public_id.clone(),
            deposit_address: card.deposit_address.clone(),
            message: card.message.clone(),
            currency: card.currency.clone(),
            amount_fiat: card.amount_fiat,
            token_mint: card.token_mint.clone(),
            expires_at: card.expires_at,
            template_url: card.template_url.clone(),
            status: card.status(),
            funded: card.funded,
            locked: card.locked,
            claimed: card.claimed,
            refunded: card.refunded,
            token_amount: card.token_amount,
            sol_amount: card.sol_amount,
            created_at: card.created_at,
            updated_at: card.updated_at,
        }
    }
}

/// Metadata edit; guest cards authorise with their CVV
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateCardRequest {
    #[validate(length(max = 500, message = "Message must be at most 500 characters"))]
    pub message: Option<String>,
    #[validate(length(min = 1, max = 10, message = "Currency must not be empty"))]
    pub currency: Option<String>,
    #[validate(range(min = 0.0, message = "Amount must not be negative"))]
    pub amount_fiat: Option<f64>,
    #[validate(length(min = 32, max = 44, message = "Token mint must be a Solana address"))]
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[validate(url(message = "Template URL must be a valid URL"))]
    pub template_url: Option<String>,
    #[validate(length(min = 32, max = 44, message = "Refund address must be a Solana address"))]
    pub refund_address: Option<String>,
    pub cvv: Option<String>,
}

impl UpdateCardRequest {
    #[must_use]
    pub fn metadata(&self) -> CardMetadataUpdate {
        CardMetadataUpdate {
            message: self.message.clone(),
            currency: self.currency.clone(),
            amount_fiat: self.amount_fiat,
            token_mint: self.token_mint.clone(),
            expires_at: self.expires_at,
            template_url: self.template_url.clone(),
            refund_address: self.refund_address.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct LockCardResponse {
    pub success: bool,
    pub locked: bool,
    /// True when the card was locked before this call
    pub already_locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CardStatusResponse {
    pub public_id: String,
    pub status: CardStatus,
    pub funded: bool,
    pub locked: bool,
    pub claimed: bool,
    pub refunded: bool,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub expires_at: Option<DateTime<Utc>>,
    /// In-flight claim or refund, if any
    pub settlement: Option<Settlement>,
    pub needs_operator: bool,
    pub settled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Card> for CardStatusResponse {
    fn from(card: &Card) -> Self {
        Self {
            public_id: card.public_id.clone(),
            status: card.status(),
            funded: card.funded,
            locked: card.locked,
            claimed: card.claimed,
            refunded: card.refunded,
            token_amount: card.token_amount,
            sol_amount: card.sol_amount,
            expires_at: card.expires_at,
            settlement: card.settlement.clone(),
            needs_operator: card.needs_operator,
            settled_at: card.settled_at,
            updated_at: card.updated_at,
        }
    }
}

/// Row of the balances cache written by funding sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CardBalance {
    pub public_id: String,
    pub deposit_address: Option<String>,
    pub lamports: u64,
    pub sol_native: f64,
    pub tokens_total_value_sol: f64,
    pub total_value_sol: f64,
    pub token_amount: f64,
    pub primary_mint: Option<String>,
    pub tokens: Vec<PricedHolding>,
    /// `None` until the first successful sync
    pub synced_at: Option<DateTime<Utc>>,
}

impl CardBalance {
    #[must_use]
    pub fn empty(public_id: &str, deposit_address: Option<String>) -> Self {
        Self {
            public_id: public_id.to_string(),
            deposit_address,
            lamports: 0,
            sol_native: 0.0,
            tokens_total_value_sol: 0.0,
            total_value_sol: 0.0,
            token_amount: 0.0,
            primary_mint: None,
            tokens: Vec::new(),
            synced_at: None,
        }
    }

    #[must_use]
    pub fn from_snapshot(
        public_id: &str,
        deposit_address: Option<String>,
        snapshot: &FundingSnapshot,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            public_id: public_id.to_string(),
            deposit_address,
            lamports: snapshot.lamports,
            sol_native: snapshot.sol_native,
            tokens_total_value_sol: snapshot.tokens_total_value_sol,
            total_value_sol: snapshot.total_value_sol,
            token_amount: snapshot.token_amount,
            primary_mint: snapshot.primary_mint.clone(),
            tokens: snapshot.holdings.clone(),
            synced_at: Some(synced_at),
        }
    }
}

/// Funding sync result: lamports/SOL/token breakdown plus the funded flag
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncFundingResponse {
    pub public_id: String,
    pub deposit_address: String,
    pub lamports: u64,
    pub sol: f64,
    pub tokens: Vec<PricedHolding>,
    pub tokens_total_value_sol: f64,
    pub total_value_sol: f64,
    pub token_amount: f64,
    pub primary_mint: Option<String>,
    pub funded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ClaimCardRequest {
    #[validate(length(min = 1, message = "public_id is required"))]
    #[schema(example = "K7MX3QPA")]
    pub public_id: String,
    #[validate(length(min = 1, message = "cvv is required"))]
    #[schema(example = "482913")]
    pub cvv: String,
    #[validate(length(min = 1, message = "destination_wallet is required"))]
    #[schema(example = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T")]
    pub destination_wallet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClaimCardResponse {
    pub success: bool,
    #[schema(example = "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdpKuc147dw2N9d")]
    pub signature: String,
    /// SOL-equivalent value sent to the destination
    #[schema(example = 1.97)]
    pub amount_sol: f64,
    /// SOL-equivalent value withheld as protocol tax
    #[schema(example = 0.03)]
    pub tax_sol: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundCardResponse {
    pub success: bool,
    pub signature: String,
    pub amount_sol: f64,
    pub destination: String,
}

/// Outcome counts of one settlement reconciliation pass
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReconciliationReport {
    pub examined: u32,
    pub completed: u32,
    pub released: u32,
    pub pending: u32,
    pub errors: u32,
}

/// What became of a single pending settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Completed,
    Released,
    Pending,
    Nothing,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SolPriceResponse {
    #[schema(example = 142.37)]
    pub sol_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PublicMetrics {
    pub total_cards: i64,
    pub funded_cards: i64,
    pub locked_cards: i64,
    pub claimed_cards: i64,
    pub refunded_cards: i64,
    /// Sum of the last observed value of funded, unsettled cards
    pub total_value_sol: f64,
    pub claimed_value_sol: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardEventKind {
    Created,
    Funded,
    Locked,
    Claimed,
    Refunded,
}

impl CardEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::Locked => "locked",
            Self::Claimed => "claimed",
            Self::Refunded => "refunded",
        }
    }
}

impl std::str::FromStr for CardEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "funded" => Ok(Self::Funded),
            "locked" => Ok(Self::Locked),
            "claimed" => Ok(Self::Claimed),
            "refunded" => Ok(Self::Refunded),
            _ => Err(format!("Invalid card event kind: {}", s)),
        }
    }
}

impl std::fmt::Display for CardEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle event for the activity feed and the notifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CardEvent {
    pub public_id: String,
    pub kind: CardEventKind,
    pub amount_sol: Option<f64>,
    pub currency: Option<String>,
    pub signature: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl CardEvent {
    #[must_use]
    pub fn new(public_id: &str, kind: CardEventKind) -> Self {
        Self {
            public_id: public_id.to_string(),
            kind,
            amount_sol: None,
            currency: None,
            signature: None,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_amount(mut self, amount_sol: f64) -> Self {
        self.amount_sol = Some(amount_sol);
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_string());
        self
    }

    #[must_use]
    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }
}

/// Public feed entry; the card id is masked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ActivityItem {
    #[schema(example = "K7****PA")]
    pub card: String,
    pub kind: CardEventKind,
    pub amount_sol: Option<f64>,
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ActivityParams {
    /// Maximum number of items to return (1-100, default: 20)
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default = "default_limit")]
    #[schema(example = 20)]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl Default for ActivityParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
        }
    }
}

/// Identity resolved from a bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateEmailRequest {
    #[validate(email(message = "A valid email is required"))]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateUsernameRequest {
    #[validate(length(min = 3, max = 32, message = "Username must be between 3 and 32 characters"))]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct EmailChangeRequest {
    #[validate(email(message = "A valid email is required"))]
    pub new_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct EmailChangeCompleteRequest {
    #[validate(email(message = "A valid email is required"))]
    pub new_email: String,
    #[validate(length(min = 1, message = "token is required"))]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthActionResponse {
    pub success: bool,
    pub user: Option<AuthUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserCardsResponse {
    pub cards: Vec<CardView>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub blockchain: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, blockchain: HealthStatus) -> Self {
        // The chain is only needed for sync and settlement; reads keep working without it
        let status = match (&database, &blockchain) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            blockchain,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Short client-facing message
    #[schema(example = "Card has already been claimed")]
    pub error: String,
    /// Error type identifier
    #[schema(example = "already_claimed")]
    pub r#type: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    pub error: String,
    pub r#type: String,
    /// Seconds until a request will be admitted again
    #[schema(example = 1)]
    pub retry_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::card::NewCard;
    use std::str::FromStr;

    fn create_request() -> CreateCardRequest {
        CreateCardRequest {
            message: None,
            currency: "USD".to_string(),
            amount_fiat: Some(20.0),
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        }
    }

    #[test]
    fn test_create_request_validation() {
        assert!(create_request().validate().is_ok());

        let mut missing_currency = create_request();
        missing_currency.currency = String::new();
        assert!(missing_currency.validate().is_err());

        let mut negative = create_request();
        negative.amount_fiat = Some(-1.0);
        assert!(negative.validate().is_err());

        let mut bad_url = create_request();
        bad_url.template_url = Some("not a url".to_string());
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_create_request_rejects_unknown_fields() {
        let parsed: Result<CreateCardRequest, _> =
            serde_json::from_str(r#"{"currency":"USD","cvv":"000000"}"#);
        assert!(parsed.is_err());
        let parsed: Result<CreateCardRequest, _> = serde_json::from_str(r#"{"amount_fiat":20}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_card_view_omits_cvv() {
        let card = Card::from_new(
            "id".to_string(),
            &NewCard {
                public_id: "ABCD2345".to_string(),
                cvv: "987654".to_string(),
                deposit_address: None,
                user_id: None,
                message: None,
                currency: "EUR".to_string(),
                amount_fiat: None,
                token_mint: None,
                expires_at: None,
                template_url: None,
                refund_address: None,
            },
        );
        let json = serde_json::to_value(CardView::from(&card)).unwrap();
        assert!(json.get("cvv").is_none());
        assert!(!json.to_string().contains("987654"));
        assert_eq!(json["status"], "created");
    }

    #[test]
    fn test_empty_balance_has_no_sync_time() {
        let balance = CardBalance::empty("ABCD2345", None);
        assert!(balance.synced_at.is_none());
        assert_eq!(balance.lamports, 0);
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(CardEventKind::from_str("claimed").unwrap(), CardEventKind::Claimed);
        assert!(CardEventKind::from_str("burned").is_err());
        assert_eq!(CardEventKind::Funded.to_string(), "funded");
    }

    #[test]
    fn test_health_response_status() {
        let healthy = HealthResponse::new(HealthStatus::Healthy, HealthStatus::Healthy);
        assert_eq!(healthy.status, HealthStatus::Healthy);
        let degraded = HealthResponse::new(HealthStatus::Healthy, HealthStatus::Unhealthy);
        assert_eq!(degraded.status, HealthStatus::Degraded);
        let down = HealthResponse::new(HealthStatus::Unhealthy, HealthStatus::Healthy);
        assert_eq!(down.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_activity_params_default() {
        let params: ActivityParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.limit, 20);
        assert!(ActivityParams { limit: 500 }.validate().is_err());
    }

    #[test]
    fn test_email_validation() {
        assert!(UpdateEmailRequest { email: "a@b.io".to_string() }.validate().is_ok());
        assert!(UpdateEmailRequest { email: "nope".to_string() }.validate().is_err());
    }
}
