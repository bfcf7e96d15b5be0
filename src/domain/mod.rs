//! Domain layer containing core business types, traits, and error definitions.

pub mod card;
pub mod error;
pub mod funding;
pub mod lifecycle;
pub mod traits;
pub mod types;

pub use card::{Card, CardMetadataUpdate, CardStatus, NewCard, Settlement, SettlementKind};
pub use error::{
    AppError, BlockchainError, ConfigError, DatabaseError, ExternalServiceError, ValidationError,
};
pub use funding::{DepositBalance, FundingSnapshot, PricedHolding, TokenHolding, reconcile_funding};
pub use lifecycle::{LifecycleError, LifecyclePolicy, PayoutAsset, PayoutLeg, PayoutPlan};
pub use traits::{
    AuthProvider, BlockchainClient, DatabaseClient, DepositAddressProvider, Notifier, PriceOracle,
    SignedPayout, TransactionStatus,
};
pub use types::{
    ActivityItem, ActivityParams, AuthActionResponse, AuthUser, CardBalance, CardEvent,
    CardEventKind, CardStatusResponse, CardView, ClaimCardRequest, ClaimCardResponse,
    CreateCardRequest, CreateCardResponse, EmailChangeCompleteRequest, EmailChangeRequest,
    ErrorResponse, HealthResponse, HealthStatus, LockCardResponse, PublicMetrics,
    RateLimitResponse, ReconciliationReport, RefundCardResponse, SettlementOutcome,
    SolPriceResponse, SyncFundingResponse, UpdateCardRequest, UpdateEmailRequest,
    UpdateUsernameRequest, UserCardsResponse,
};
