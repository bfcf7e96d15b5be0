//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::{
    AppError, AuthProvider, AuthUser, BlockchainClient, BlockchainError, Card, CardBalance,
    CardEvent, CardMetadataUpdate, DatabaseClient, DatabaseError, DepositAddressProvider,
    DepositBalance, ExternalServiceError, FundingSnapshot, NewCard, Notifier, PayoutPlan,
    PriceOracle, PublicMetrics, Settlement, SettlementKind, SignedPayout, TransactionStatus,
    ValidationError,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// In-memory database with the same conditional-update rules as Postgres
pub struct MockDatabaseClient {
    cards: Arc<Mutex<HashMap<String, Card>>>,
    balances: Arc<Mutex<HashMap<String, CardBalance>>>,
    events: Arc<Mutex<Vec<CardEvent>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    duplicate_failures: AtomicUsize,
}

impl MockDatabaseClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            cards: Arc::new(Mutex::new(HashMap::new())),
            balances: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            config,
            is_healthy: AtomicBool::new(true),
            duplicate_failures: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make the next `count` inserts fail with a public id collision
    pub fn fail_inserts_with_duplicate(&self, count: usize) {
        self.duplicate_failures.store(count, Ordering::SeqCst);
    }

    /// Edit a stored card directly, bypassing the lifecycle rules
    pub fn modify_card(&self, public_id: &str, edit: impl FnOnce(&mut Card)) {
        if let Some(card) = self.cards.lock().unwrap().get_mut(public_id) {
            edit(card);
        }
    }

    pub fn get_all_cards(&self) -> Vec<Card> {
        self.cards.lock().unwrap().values().cloned().collect()
    }

    pub fn get_events(&self) -> Vec<CardEvent> {
        self.events.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.message(),
            )));
        }
        Ok(())
    }

    fn take_duplicate_failure(&self) -> bool {
        self.duplicate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn insert_card(&self, card: &NewCard) -> Result<Card, AppError> {
        self.check_should_fail()?;
        if self.take_duplicate_failure() {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "public_id {}",
                card.public_id
            ))));
        }
        let mut cards = self.cards.lock().unwrap();
        if cards.contains_key(&card.public_id) {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "public_id {}",
                card.public_id
            ))));
        }
        let stored = Card::from_new(Uuid::new_v4().to_string(), card);
        cards.insert(card.public_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_card(&self, public_id: &str) -> Result<Option<Card>, AppError> {
        self.check_should_fail()?;
        Ok(self.cards.lock().unwrap().get(public_id).cloned())
    }

    async fn list_cards_for_user(&self, user_id: &str) -> Result<Vec<Card>, AppError> {
        self.check_should_fail()?;
        let cards = self.cards.lock().unwrap();
        let mut owned: Vec<Card> = cards
            .values()
            .filter(|c| c.user_id.as_deref() == Some(user_id) && !c.hidden_by_owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn hide_card_for_user(&self, public_id: &str, user_id: &str) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        match cards.get_mut(public_id) {
            Some(card) if card.user_id.as_deref() == Some(user_id) => {
                card.hidden_by_owner = true;
                card.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_metadata(
        &self,
        public_id: &str,
        update: &CardMetadataUpdate,
    ) -> Result<Option<Card>, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        match cards.get_mut(public_id) {
            Some(card) if !card.locked && !card.is_terminal() => {
                update.apply_to(card);
                card.updated_at = Utc::now();
                Ok(Some(card.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn apply_funding_snapshot(
        &self,
        public_id: &str,
        snapshot: &FundingSnapshot,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<Card>, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        let Some(card) = cards.get_mut(public_id) else {
            return Ok(None);
        };
        if card.is_terminal() {
            return Ok(None);
        }
        card.funded = card.funded || snapshot.observed_funded;
        card.token_amount = snapshot.token_amount;
        card.sol_amount = snapshot.total_value_sol;
        card.updated_at = synced_at;
        let updated = card.clone();

        self.balances.lock().unwrap().insert(
            public_id.to_string(),
            CardBalance::from_snapshot(
                public_id,
                updated.deposit_address.clone(),
                snapshot,
                synced_at,
            ),
        );
        Ok(Some(updated))
    }

    async fn get_balance_snapshot(&self, public_id: &str) -> Result<Option<CardBalance>, AppError> {
        self.check_should_fail()?;
        Ok(self.balances.lock().unwrap().get(public_id).cloned())
    }

    async fn lock_card(&self, public_id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        match cards.get_mut(public_id) {
            Some(card) if !card.locked && !card.is_terminal() => {
                card.locked = true;
                card.locked_at = Some(now);
                card.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reserve_settlement(
        &self,
        public_id: &str,
        kind: SettlementKind,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        let Some(card) = cards.get_mut(public_id) else {
            return Ok(false);
        };
        if card.is_terminal()
            || card.settlement.is_some()
            || (kind == SettlementKind::Claim && !card.locked)
        {
            return Ok(false);
        }
        card.settlement = Some(Settlement {
            kind,
            destination: destination.to_string(),
            reserved_at: now,
            signature: None,
        });
        card.updated_at = now;
        Ok(true)
    }

    async fn record_settlement_signature(
        &self,
        public_id: &str,
        signature: &str,
    ) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        match cards.get_mut(public_id) {
            Some(card) if !card.is_terminal() && card.settlement.is_some() => {
                if let Some(settlement) = card.settlement.as_mut() {
                    settlement.signature = Some(signature.to_string());
                }
                Ok(())
            }
            _ => Err(AppError::Database(DatabaseError::NotFound(format!(
                "Settlement reservation for card {}",
                public_id
            )))),
        }
    }

    async fn complete_settlement(
        &self,
        public_id: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        let Some(card) = cards.get_mut(public_id) else {
            return Ok(false);
        };
        if card.is_terminal() {
            return Ok(false);
        }
        let Some(settlement) = card.settlement.as_mut() else {
            return Ok(false);
        };
        settlement.signature = Some(signature.to_string());
        let kind = settlement.kind;
        card.claimed = kind == SettlementKind::Claim;
        card.refunded = kind == SettlementKind::Refund;
        card.settled_at = Some(now);
        card.updated_at = now;
        Ok(true)
    }

    async fn release_settlement(&self, public_id: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        if let Some(card) = cards.get_mut(public_id) {
            if !card.is_terminal() {
                card.settlement = None;
                card.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_pending_settlements(&self, limit: i64) -> Result<Vec<Card>, AppError> {
        self.check_should_fail()?;
        let cards = self.cards.lock().unwrap();
        let mut pending: Vec<Card> = cards
            .values()
            .filter(|c| c.has_pending_settlement())
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.settlement.as_ref().map(|s| s.reserved_at));
        Ok(pending.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn list_refund_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Card>, AppError> {
        self.check_should_fail()?;
        let cards = self.cards.lock().unwrap();
        let mut candidates: Vec<Card> = cards
            .values()
            .filter(|c| {
                c.is_expired_at(now)
                    && c.funded
                    && !c.is_terminal()
                    && c.settlement.is_none()
                    && !c.needs_operator
                    && c.next_refund_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.expires_at);
        Ok(candidates.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn flag_for_operator(&self, public_id: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        if let Some(card) = self.cards.lock().unwrap().get_mut(public_id) {
            card.needs_operator = true;
        }
        Ok(())
    }

    async fn defer_refund(
        &self,
        public_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, AppError> {
        self.check_should_fail()?;
        let mut cards = self.cards.lock().unwrap();
        let card = cards
            .get_mut(public_id)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(public_id.to_string())))?;
        card.refund_attempts += 1;
        card.next_refund_at = Some(retry_at);
        Ok(card.refund_attempts)
    }

    async fn record_event(&self, event: &CardEvent) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn list_recent_events(&self, limit: i64) -> Result<Vec<CardEvent>, AppError> {
        self.check_should_fail()?;
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_public_metrics(&self) -> Result<PublicMetrics, AppError> {
        self.check_should_fail()?;
        let cards = self.cards.lock().unwrap();
        let count = |pred: fn(&Card) -> bool| cards.values().filter(|c| pred(c)).count() as i64;
        Ok(PublicMetrics {
            total_cards: cards.len() as i64,
            funded_cards: count(|c| c.funded),
            locked_cards: count(|c| c.locked),
            claimed_cards: count(|c| c.claimed),
            refunded_cards: count(|c| c.refunded),
            total_value_sol: cards
                .values()
                .filter(|c| c.funded && !c.is_terminal())
                .map(|c| c.sol_amount)
                .sum(),
            claimed_value_sol: cards
                .values()
                .filter(|c| c.claimed)
                .map(|c| c.sol_amount)
                .sum(),
        })
    }
}

/// What a broadcast does in the mock chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BroadcastBehavior {
    /// Accepted; the source balance is drained
    #[default]
    Accept,
    /// The node never answered; the transfer may or may not land
    Timeout,
    /// Rejected at preflight; nothing moved
    Reject(String),
}

/// Mock blockchain client with scripted balances and settlement outcomes
pub struct MockBlockchainClient {
    balances: Arc<Mutex<HashMap<String, DepositBalance>>>,
    prepared: Arc<Mutex<Vec<PayoutPlan>>>,
    broadcasts: Arc<Mutex<Vec<String>>>,
    sources: Arc<Mutex<HashMap<String, String>>>,
    broadcast_behavior: Mutex<BroadcastBehavior>,
    confirmation_status: Mutex<TransactionStatus>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MockBlockchainClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            balances: Arc::new(Mutex::new(HashMap::new())),
            prepared: Arc::new(Mutex::new(Vec::new())),
            broadcasts: Arc::new(Mutex::new(Vec::new())),
            sources: Arc::new(Mutex::new(HashMap::new())),
            broadcast_behavior: Mutex::new(BroadcastBehavior::Accept),
            confirmation_status: Mutex::new(TransactionStatus::Confirmed),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Put `lamports` of native SOL on an address
    pub fn set_lamports(&self, address: &str, lamports: u64) {
        let mut balances = self.balances.lock().unwrap();
        let entry = balances
            .entry(address.to_string())
            .or_insert_with(|| DepositBalance {
                address: address.to_string(),
                ..Default::default()
            });
        entry.lamports = lamports;
    }

    pub fn set_balance(&self, balance: DepositBalance) {
        self.balances
            .lock()
            .unwrap()
            .insert(balance.address.clone(), balance);
    }

    pub fn set_broadcast_behavior(&self, behavior: BroadcastBehavior) {
        *self.broadcast_behavior.lock().unwrap() = behavior;
    }

    /// Status reported for every signature from now on
    pub fn set_confirmation_status(&self, status: TransactionStatus) {
        *self.confirmation_status.lock().unwrap() = status;
    }

    pub fn get_prepared_payouts(&self) -> Vec<PayoutPlan> {
        self.prepared.lock().unwrap().clone()
    }

    /// Signatures of every broadcast attempt
    pub fn get_broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Blockchain(BlockchainError::RpcError(
                self.config.message(),
            )));
        }
        Ok(())
    }

    fn drain(&self, signature: &str) {
        let source = self.sources.lock().unwrap().get(signature).cloned();
        if let Some(source) = source {
            if let Some(balance) = self.balances.lock().unwrap().get_mut(&source) {
                balance.lamports = 0;
                balance.tokens.clear();
            }
        }
    }
}

impl Default for MockBlockchainClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockchainClient for MockBlockchainClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn get_deposit_balance(&self, address: &str) -> Result<DepositBalance, AppError> {
        self.check_should_fail()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_else(|| DepositBalance {
                address: address.to_string(),
                ..Default::default()
            }))
    }

    async fn prepare_payout(&self, plan: &PayoutPlan) -> Result<SignedPayout, AppError> {
        self.check_should_fail()?;
        let mut prepared = self.prepared.lock().unwrap();
        prepared.push(plan.clone());
        let signature = format!("sig_{}_{}_{}", plan.kind, plan.public_id, prepared.len());
        self.sources
            .lock()
            .unwrap()
            .insert(signature.clone(), plan.source_address.clone());
        Ok(SignedPayout {
            wire_transaction: format!("wire_{}", signature),
            signature,
        })
    }

    async fn broadcast_payout(&self, payout: &SignedPayout) -> Result<String, AppError> {
        self.check_should_fail()?;
        self.broadcasts
            .lock()
            .unwrap()
            .push(payout.signature.clone());
        let behavior = self.broadcast_behavior.lock().unwrap().clone();
        match behavior {
            BroadcastBehavior::Accept => {
                if *self.confirmation_status.lock().unwrap() == TransactionStatus::Confirmed {
                    self.drain(&payout.signature);
                }
                Ok(payout.signature.clone())
            }
            BroadcastBehavior::Timeout => Err(AppError::Blockchain(BlockchainError::Timeout(
                "sendTransaction timed out".to_string(),
            ))),
            BroadcastBehavior::Reject(reason) => Err(AppError::Blockchain(
                BlockchainError::TransactionFailed(reason),
            )),
        }
    }

    async fn get_transaction_status(&self, signature: &str) -> Result<TransactionStatus, AppError> {
        self.check_should_fail()?;
        let status = self.confirmation_status.lock().unwrap().clone();
        if status == TransactionStatus::Confirmed {
            self.drain(signature);
        }
        Ok(status)
    }

    async fn wait_for_confirmation(
        &self,
        signature: &str,
        _timeout_secs: u64,
    ) -> Result<TransactionStatus, AppError> {
        self.get_transaction_status(signature).await
    }
}

/// Fixed-price feed
pub struct MockPriceOracle {
    sol_usd: Mutex<f64>,
    token_prices: Mutex<HashMap<String, f64>>,
    config: MockConfig,
}

impl MockPriceOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            sol_usd: Mutex::new(150.0),
            token_prices: Mutex::new(HashMap::new()),
            config,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_sol_usd(&self, price: f64) {
        *self.sol_usd.lock().unwrap() = price;
    }

    /// Price of one token of `mint`, in SOL
    pub fn set_token_price(&self, mint: &str, price_sol: f64) {
        self.token_prices
            .lock()
            .unwrap()
            .insert(mint.to_string(), price_sol);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Unavailable(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockPriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn sol_usd(&self) -> Result<f64, AppError> {
        self.check_should_fail()?;
        Ok(*self.sol_usd.lock().unwrap())
    }

    async fn token_prices_in_sol(
        &self,
        mints: &[String],
    ) -> Result<HashMap<String, f64>, AppError> {
        self.check_should_fail()?;
        let prices = self.token_prices.lock().unwrap();
        Ok(mints
            .iter()
            .filter_map(|mint| prices.get(mint).map(|p| (mint.clone(), *p)))
            .collect())
    }
}

/// Notifier that records what it was asked to send
#[derive(Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<CardEvent>>>,
    config: MockConfig,
}

impl MockNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            config: MockConfig::failure(message),
        }
    }

    pub fn get_sent(&self) -> Vec<CardEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, event: &CardEvent) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Unavailable(
                self.config.message(),
            )));
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// One-time token accepted by [`MockAuthProvider::complete_email_change`]
pub const MOCK_EMAIL_OTP: &str = "123456";

/// Identity provider backed by a token table
#[derive(Default)]
pub struct MockAuthProvider {
    users: Mutex<HashMap<String, AuthUser>>,
    pending_email_changes: Mutex<HashMap<String, String>>,
}

impl MockAuthProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `access_token` as `user`
    #[must_use]
    pub fn with_user(self, access_token: &str, user: AuthUser) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(access_token.to_string(), user);
        self
    }

    fn update_user(
        &self,
        user_id: &str,
        edit: impl Fn(&mut AuthUser),
    ) -> Result<AuthUser, AppError> {
        let mut users = self.users.lock().unwrap();
        let mut updated = None;
        for user in users.values_mut().filter(|u| u.id == user_id) {
            edit(user);
            updated = Some(user.clone());
        }
        updated.ok_or_else(|| AppError::Authentication("Unknown user".to_string()))
    }
}

#[async_trait]
impl AuthProvider for MockAuthProvider {
    async fn authenticate(&self, access_token: &str) -> Result<AuthUser, AppError> {
        self.users
            .lock()
            .unwrap()
            .get(access_token)
            .cloned()
            .ok_or_else(|| AppError::Authentication("Invalid or expired access token".to_string()))
    }

    async fn update_email(&self, user_id: &str, email: &str) -> Result<AuthUser, AppError> {
        self.update_user(user_id, |u| u.email = Some(email.to_string()))
    }

    async fn update_username(&self, user_id: &str, username: &str) -> Result<AuthUser, AppError> {
        self.update_user(user_id, |u| u.username = Some(username.to_string()))
    }

    async fn request_email_change(
        &self,
        access_token: &str,
        new_email: &str,
    ) -> Result<(), AppError> {
        let user = self.authenticate(access_token).await?;
        self.pending_email_changes
            .lock()
            .unwrap()
            .insert(new_email.to_string(), user.id);
        Ok(())
    }

    async fn complete_email_change(
        &self,
        new_email: &str,
        token: &str,
    ) -> Result<AuthUser, AppError> {
        let user_id = self
            .pending_email_changes
            .lock()
            .unwrap()
            .get(new_email)
            .cloned();
        match user_id {
            Some(user_id) if token == MOCK_EMAIL_OTP => {
                self.pending_email_changes.lock().unwrap().remove(new_email);
                self.update_user(&user_id, |u| u.email = Some(new_email.to_string()))
            }
            _ => Err(ValidationError::InvalidField {
                field: "token".to_string(),
                message: "Token has expired or is invalid".to_string(),
            }
            .into()),
        }
    }
}

/// Deterministic deposit addresses (base58 of sha256(public_id))
pub struct MockDepositProvider {
    enabled: bool,
}

impl MockDepositProvider {
    #[must_use]
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Provider that never assigns an address
    #[must_use]
    pub fn unconfigured() -> Self {
        Self { enabled: false }
    }

    #[must_use]
    pub fn address_for(public_id: &str) -> String {
        bs58::encode(Sha256::digest(public_id.as_bytes())).into_string()
    }
}

impl Default for MockDepositProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DepositAddressProvider for MockDepositProvider {
    fn assign_deposit_address(&self, public_id: &str) -> Result<Option<String>, AppError> {
        Ok(self.enabled.then(|| Self::address_for(public_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CardEventKind;
    use crate::domain::funding::LAMPORTS_PER_SOL;

    fn new_card(public_id: &str) -> NewCard {
        NewCard {
            public_id: public_id.to_string(),
            cvv: "123456".to_string(),
            deposit_address: Some(MockDepositProvider::address_for(public_id)),
            user_id: Some("user-1".to_string()),
            message: None,
            currency: "USD".to_string(),
            amount_fiat: None,
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        }
    }

    #[tokio::test]
    async fn test_mock_database_duplicate_failures() {
        let db = MockDatabaseClient::new();
        db.fail_inserts_with_duplicate(1);
        assert!(db.insert_card(&new_card("AAAA2222")).await.is_err());
        assert!(db.insert_card(&new_card("AAAA2222")).await.is_ok());
        assert!(matches!(
            db.insert_card(&new_card("AAAA2222")).await,
            Err(AppError::Database(DatabaseError::Duplicate(_)))
        ));
    }

    #[tokio::test]
    async fn test_mock_database_reservation_is_exclusive() {
        let db = MockDatabaseClient::new();
        db.insert_card(&new_card("BBBB3333")).await.unwrap();
        let now = Utc::now();

        // Claims need a lock first
        assert!(!db.reserve_settlement("BBBB3333", SettlementKind::Claim, "d", now).await.unwrap());
        assert!(db.lock_card("BBBB3333", now).await.unwrap());
        assert!(!db.lock_card("BBBB3333", now).await.unwrap());

        assert!(db.reserve_settlement("BBBB3333", SettlementKind::Claim, "d", now).await.unwrap());
        assert!(
            !db.reserve_settlement("BBBB3333", SettlementKind::Refund, "d", now)
                .await
                .unwrap()
        );

        assert!(db.complete_settlement("BBBB3333", "sig", now).await.unwrap());
        assert!(!db.complete_settlement("BBBB3333", "sig", now).await.unwrap());
        let card = db.get_card("BBBB3333").await.unwrap().unwrap();
        assert!(card.claimed && !card.refunded);
    }

    #[tokio::test]
    async fn test_mock_database_events_newest_first() {
        let db = MockDatabaseClient::new();
        db.record_event(&CardEvent::new("A", CardEventKind::Created)).await.unwrap();
        db.record_event(&CardEvent::new("A", CardEventKind::Funded)).await.unwrap();
        let events = db.list_recent_events(1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CardEventKind::Funded);
    }

    #[tokio::test]
    async fn test_mock_blockchain_drains_on_confirmed_broadcast() {
        let chain = MockBlockchainClient::new();
        chain.set_lamports("src", LAMPORTS_PER_SOL);
        let plan = PayoutPlan {
            public_id: "CCCC4444".to_string(),
            source_address: "src".to_string(),
            kind: SettlementKind::Claim,
            destination: "dst".to_string(),
            tax_collector: None,
            legs: Vec::new(),
            gross_value_sol: 1.0,
            tax_value_sol: 0.0,
            net_value_sol: 1.0,
        };
        let signed = chain.prepare_payout(&plan).await.unwrap();
        chain.broadcast_payout(&signed).await.unwrap();
        assert_eq!(chain.get_deposit_balance("src").await.unwrap().lamports, 0);
        assert_eq!(chain.get_broadcasts(), vec![signed.signature]);
    }

    #[tokio::test]
    async fn test_mock_auth_email_change_flow() {
        let user = AuthUser {
            id: "u1".to_string(),
            email: Some("old@example.com".to_string()),
            username: None,
        };
        let auth = MockAuthProvider::new().with_user("tok", user);
        auth.request_email_change("tok", "new@example.com").await.unwrap();
        assert!(auth.complete_email_change("new@example.com", "000000").await.is_err());
        let updated = auth
            .complete_email_change("new@example.com", MOCK_EMAIL_OTP)
            .await
            .unwrap();
        assert_eq!(updated.email.as_deref(), Some("new@example.com"));
    }
}
