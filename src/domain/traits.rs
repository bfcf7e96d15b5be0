//! Domain traits defining contracts for external systems.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::card::{Card, CardMetadataUpdate, NewCard, SettlementKind};
use super::error::{AppError, BlockchainError};
use super::funding::{DepositBalance, FundingSnapshot};
use super::lifecycle::PayoutPlan;
use super::types::{AuthUser, CardBalance, CardEvent, PublicMetrics};

/// Database client trait for persistence operations
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new card. A `public_id` collision surfaces as `DatabaseError::Duplicate`.
    async fn insert_card(&self, card: &NewCard) -> Result<Card, AppError>;

    async fn get_card(&self, public_id: &str) -> Result<Option<Card>, AppError>;

    /// Cards owned by a user, newest first, excluding hidden ones
    async fn list_cards_for_user(&self, user_id: &str) -> Result<Vec<Card>, AppError>;

    /// Remove a card from its owner's dashboard. Returns false when the card
    /// does not belong to the user.
    async fn hide_card_for_user(&self, public_id: &str, user_id: &str) -> Result<bool, AppError>;

    /// Apply a metadata edit only while the card is unlocked.
    /// Returns `None` when the card was locked in the meantime.
    async fn update_metadata(
        &self,
        public_id: &str,
        update: &CardMetadataUpdate,
    ) -> Result<Option<Card>, AppError>;

    /// Persist a funding snapshot: `funded` is OR-ed with the observation,
    /// balances are overwritten, and the balances cache row is upserted.
    /// Settled cards are left untouched and `None` is returned.
    async fn apply_funding_snapshot(
        &self,
        public_id: &str,
        snapshot: &FundingSnapshot,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<Card>, AppError>;

    async fn get_balance_snapshot(&self, public_id: &str) -> Result<Option<CardBalance>, AppError>;

    /// Set `locked` if it is not set yet. Returns true only for the caller
    /// that performed the transition.
    async fn lock_card(&self, public_id: &str, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// Compare-and-set on the settlement reservation.
    ///
    /// Succeeds only when the card is unsettled, carries no reservation and,
    /// for claims, is locked. Exactly one concurrent caller gets `true`.
    async fn reserve_settlement(
        &self,
        public_id: &str,
        kind: SettlementKind,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Attach the signed transaction's signature to the reservation
    async fn record_settlement_signature(
        &self,
        public_id: &str,
        signature: &str,
    ) -> Result<(), AppError>;

    /// Turn a confirmed reservation into the terminal flag for its kind.
    /// Returns false if there was no reservation to complete.
    async fn complete_settlement(
        &self,
        public_id: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Drop a reservation whose transaction definitely did not land
    async fn release_settlement(&self, public_id: &str) -> Result<(), AppError>;

    /// Cards holding a reservation that has not completed, oldest first
    async fn list_pending_settlements(&self, limit: i64) -> Result<Vec<Card>, AppError>;

    /// Expired, unsettled, funded cards without a reservation
    async fn list_refund_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Card>, AppError>;

    /// Mark a card as needing manual operator action
    async fn flag_for_operator(&self, public_id: &str) -> Result<(), AppError>;

    /// Record a failed sweep refund and hide the card from the sweep until
    /// `retry_at`. Returns the failed attempt count.
    async fn defer_refund(
        &self,
        public_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, AppError>;

    async fn record_event(&self, event: &CardEvent) -> Result<(), AppError>;

    async fn list_recent_events(&self, limit: i64) -> Result<Vec<CardEvent>, AppError>;

    async fn get_public_metrics(&self) -> Result<PublicMetrics, AppError>;
}

/// Signed, not yet broadcast settlement transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayout {
    pub signature: String,
    /// Base64 of the serialized transaction
    pub wire_transaction: String,
}

/// On-chain state of a previously signed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TransactionStatus {
    Confirmed,
    Failed(String),
    Pending,
    NotFound,
}

/// Blockchain client trait for chain operations
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// Check blockchain RPC connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Native balance plus token accounts owned by `address`
    async fn get_deposit_balance(&self, address: &str) -> Result<DepositBalance, AppError>;

    /// Build and sign the settlement transaction for a payout plan
    async fn prepare_payout(&self, plan: &PayoutPlan) -> Result<SignedPayout, AppError> {
        let _ = plan;
        Err(AppError::NotSupported(
            "prepare_payout not implemented".to_string(),
        ))
    }

    /// Send a signed transaction. Returns its signature.
    async fn broadcast_payout(&self, payout: &SignedPayout) -> Result<String, AppError> {
        let _ = payout;
        Err(AppError::NotSupported(
            "broadcast_payout not implemented".to_string(),
        ))
    }

    async fn get_transaction_status(&self, signature: &str) -> Result<TransactionStatus, AppError> {
        let _ = signature;
        Err(AppError::NotSupported(
            "get_transaction_status not implemented".to_string(),
        ))
    }

    /// Poll until the transaction is confirmed, fails, or the timeout elapses.
    ///
    /// Elapsing the timeout is an unknown outcome and yields
    /// `BlockchainError::Timeout`.
    async fn wait_for_confirmation(
        &self,
        signature: &str,
        timeout_secs: u64,
    ) -> Result<TransactionStatus, AppError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            match self.get_transaction_status(signature).await? {
                TransactionStatus::Confirmed => return Ok(TransactionStatus::Confirmed),
                TransactionStatus::Failed(reason) => return Ok(TransactionStatus::Failed(reason)),
                TransactionStatus::Pending | TransactionStatus::NotFound => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BlockchainError::Timeout(format!(
                    "Transaction {} not confirmed within {}s",
                    signature, timeout_secs
                ))
                .into());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Price feed for SOL and SPL tokens
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn sol_usd(&self) -> Result<f64, AppError>;

    /// Prices in SOL per token for the given mints. Mints the feed does not
    /// know are absent from the map.
    async fn token_prices_in_sol(&self, mints: &[String]) -> Result<HashMap<String, f64>, AppError>;
}

/// Operational notifications; callers treat failures as non-fatal
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CardEvent) -> Result<(), AppError>;
}

/// Hosted identity provider
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve a bearer token to a user
    async fn authenticate(&self, access_token: &str) -> Result<AuthUser, AppError>;

    async fn update_email(&self, user_id: &str, email: &str) -> Result<AuthUser, AppError>;

    async fn update_username(&self, user_id: &str, username: &str) -> Result<AuthUser, AppError>;

    /// Start a confirmed email change for the token's user
    async fn request_email_change(
        &self,
        access_token: &str,
        new_email: &str,
    ) -> Result<(), AppError>;

    /// Finish an email change with the one-time token the user received
    async fn complete_email_change(
        &self,
        new_email: &str,
        token: &str,
    ) -> Result<AuthUser, AppError>;
}

/// Assigns a deposit address to a new card
pub trait DepositAddressProvider: Send + Sync {
    /// `None` when deposit provisioning is not configured
    fn assign_deposit_address(&self, public_id: &str) -> Result<Option<String>, AppError>;
}
