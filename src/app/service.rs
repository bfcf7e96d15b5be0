//! Card lifecycle orchestration.
//!
//! `CardService` loads state, asks the lifecycle engine what is allowed, and
//! drives the persistence and chain collaborators accordingly. The only
//! cross-request coordination is the settlement compare-and-set in the
//! database; everything else is a plain read-decide-write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use crate::domain::card::{generate_cvv, generate_public_id, mask_public_id};
use crate::domain::funding::mints_to_price;
use crate::domain::lifecycle::{
    LockDecision, check_claimable, check_refund_eligibility, compute_payout,
    ensure_metadata_editable, evaluate_lock, is_settlement_stale, next_refund_attempt_at,
    refund_destination, validate_claim_credentials, validate_destination,
};
use crate::domain::{
    ActivityItem, ActivityParams, AppError, AuthUser, BlockchainClient, BlockchainError, Card,
    CardBalance, CardEvent, CardEventKind, CardStatusResponse, CardView, ClaimCardRequest,
    ClaimCardResponse, CreateCardRequest, CreateCardResponse, DatabaseClient, DatabaseError,
    DepositAddressProvider, FundingSnapshot, HealthResponse, HealthStatus, LifecycleError,
    LifecyclePolicy, LockCardResponse, NewCard, Notifier, PayoutPlan, PriceOracle, PublicMetrics,
    ReconciliationReport, RefundCardResponse, SettlementKind, SettlementOutcome, SolPriceResponse,
    SyncFundingResponse, TransactionStatus, UpdateCardRequest, ValidationError, reconcile_funding,
};

/// Upper bound on a single notification delivery
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Application service for the card lifecycle
pub struct CardService {
    db_client: Arc<dyn DatabaseClient>,
    blockchain_client: Arc<dyn BlockchainClient>,
    price_oracle: Arc<dyn PriceOracle>,
    notifier: Arc<dyn Notifier>,
    deposits: Arc<dyn DepositAddressProvider>,
    policy: LifecyclePolicy,
}

impl CardService {
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        blockchain_client: Arc<dyn BlockchainClient>,
        price_oracle: Arc<dyn PriceOracle>,
        notifier: Arc<dyn Notifier>,
        deposits: Arc<dyn DepositAddressProvider>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            db_client,
            blockchain_client,
            price_oracle,
            notifier,
            deposits,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Create a card with fresh credentials, retrying on id collisions
    #[instrument(skip(self, request, user_id), fields(currency = %request.currency))]
    pub async fn create_card(
        &self,
        request: &CreateCardRequest,
        user_id: Option<&str>,
    ) -> Result<CreateCardResponse, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let currency = request.currency.trim();
        if currency.is_empty() {
            return Err(ValidationError::MissingField("currency".to_string()).into());
        }
        ensure_future_expiry(request.expires_at)?;
        ensure_refund_wallet(request.refund_address.as_deref(), None)?;

        for attempt in 1..=self.policy.max_id_attempts {
            let public_id = generate_public_id(&mut OsRng, self.policy.public_id_length);
            let cvv = generate_cvv(&mut OsRng, self.policy.cvv_length);
            let deposit_address = self.deposits.assign_deposit_address(&public_id)?;

            let new_card = NewCard {
                public_id,
                cvv,
                deposit_address,
                user_id: user_id.map(str::to_string),
                message: request.message.clone(),
                currency: currency.to_uppercase(),
                amount_fiat: request.amount_fiat,
                token_mint: request.token_mint.clone(),
                expires_at: request.expires_at,
                template_url: request.template_url.clone(),
                refund_address: request.refund_address.clone(),
            };

            match self.db_client.insert_card(&new_card).await {
                Ok(card) => {
                    info!(
                        public_id = %card.public_id,
                        guest = card.user_id.is_none(),
                        "Card created"
                    );
                    self.emit(
                        CardEvent::new(&card.public_id, CardEventKind::Created)
                            .with_currency(&card.currency),
                    )
                    .await;
                    return Ok(CreateCardResponse {
                        public_id: card.public_id,
                        cvv: card.cvv,
                        deposit_address: card.deposit_address,
                    });
                }
                Err(AppError::Database(DatabaseError::Duplicate(msg))) => {
                    warn!(attempt, error = %msg, "Public id collision, regenerating");
                }
                Err(e) => {
                    error!(error = ?e, "Failed to persist card");
                    return Err(e);
                }
            }
        }

        Err(AppError::Internal(format!(
            "Could not allocate a unique card id after {} attempts",
            self.policy.max_id_attempts
        )))
    }

    async fn load_card(&self, public_id: &str) -> Result<Card, AppError> {
        self.db_client
            .get_card(public_id)
            .await?
            .ok_or_else(|| AppError::card_not_found(public_id))
    }

    #[instrument(skip(self))]
    pub async fn get_card_view(&self, public_id: &str) -> Result<CardView, AppError> {
        let card = self.load_card(public_id).await?;
        Ok(CardView::from(&card))
    }

    /// Edit creator metadata while the card is unlocked.
    ///
    /// Owned cards require the owner's identity; guest cards require the CVV.
    #[instrument(skip(self, request, caller))]
    pub async fn update_metadata(
        &self,
        public_id: &str,
        request: &UpdateCardRequest,
        caller: Option<&AuthUser>,
    ) -> Result<CardView, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let card = self.load_card(public_id).await?;

        let is_owner = matches!(
            (&card.user_id, caller),
            (Some(owner), Some(user)) if *owner == user.id
        );
        let has_cvv = request.cvv.as_deref().is_some_and(|cvv| card.cvv_matches(cvv));
        if !is_owner && !has_cvv {
            if card.user_id.is_some() && caller.is_none() && request.cvv.is_none() {
                return Err(AppError::Authentication("Bearer token required".to_string()));
            }
            warn!(public_id = %public_id, "Rejected metadata edit from non-owner");
            return Err(AppError::Authorization(
                "Not allowed to edit this card".to_string(),
            ));
        }

        ensure_metadata_editable(&card)?;
        ensure_future_expiry(request.expires_at)?;
        ensure_refund_wallet(
            request.refund_address.as_deref(),
            card.deposit_address.as_deref(),
        )?;

        let mut update = request.metadata();
        if let Some(currency) = update.currency.as_mut() {
            let trimmed = currency.trim().to_uppercase();
            if trimmed.is_empty() {
                return Err(ValidationError::MissingField("currency".to_string()).into());
            }
            *currency = trimmed;
        }
        if update.is_empty() {
            return Ok(CardView::from(&card));
        }

        match self.db_client.update_metadata(public_id, &update).await? {
            Some(updated) => {
                info!(public_id = %public_id, "Card metadata updated");
                Ok(CardView::from(&updated))
            }
            None => Err(LifecycleError::MetadataLocked.into()),
        }
    }

    /// Lock the card. Re-locking succeeds without side effects.
    #[instrument(skip(self))]
    pub async fn lock_card(&self, public_id: &str) -> Result<LockCardResponse, AppError> {
        let card = self.load_card(public_id).await?;

        let already_locked = match evaluate_lock(&card, &self.policy)? {
            LockDecision::AlreadyLocked => true,
            LockDecision::Lock => {
                let won = self.db_client.lock_card(public_id, Utc::now()).await?;
                if won {
                    info!(public_id = %public_id, funded = card.funded, "Card locked");
                    self.emit(
                        CardEvent::new(public_id, CardEventKind::Locked)
                            .with_amount(card.sol_amount)
                            .with_currency(&card.currency),
                    )
                    .await;
                }
                !won
            }
        };

        Ok(LockCardResponse {
            success: true,
            locked: true,
            already_locked,
        })
    }

    #[instrument(skip(self))]
    pub async fn card_status(&self, public_id: &str) -> Result<CardStatusResponse, AppError> {
        let card = self.load_card(public_id).await?;
        Ok(CardStatusResponse::from(&card))
    }

    /// Cached balances; zeros with no sync time before the first sync
    #[instrument(skip(self))]
    pub async fn card_balance(&self, public_id: &str) -> Result<CardBalance, AppError> {
        let card = self.load_card(public_id).await?;
        Ok(self
            .db_client
            .get_balance_snapshot(public_id)
            .await?
            .unwrap_or_else(|| CardBalance::empty(public_id, card.deposit_address.clone())))
    }

    /// Read the deposit address and price what it holds.
    ///
    /// A price feed failure degrades to "unpriced"; a chain failure is
    /// returned as-is.
    async fn read_funding(&self, address: &str) -> Result<FundingSnapshot, AppError> {
        let balance = self.blockchain_client.get_deposit_balance(address).await?;

        let mints = mints_to_price(&balance);
        let prices = if mints.is_empty() {
            HashMap::new()
        } else {
            match self.price_oracle.token_prices_in_sol(&mints).await {
                Ok(prices) => prices,
                Err(e) => {
                    warn!(
                        error = ?e,
                        mints = mints.len(),
                        "Token price lookup failed, treating tokens as unpriced"
                    );
                    HashMap::new()
                }
            }
        };

        Ok(reconcile_funding(&balance, &prices))
    }

    /// Persist a fresh snapshot; `None` from storage means the card settled
    /// concurrently, which is reported as the matching conflict.
    async fn store_snapshot(
        &self,
        card: &Card,
        snapshot: &FundingSnapshot,
    ) -> Result<Card, AppError> {
        match self
            .db_client
            .apply_funding_snapshot(&card.public_id, snapshot, Utc::now())
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                let current = self.load_card(&card.public_id).await?;
                Err(terminal_conflict(&current).into())
            }
        }
    }

    /// Refresh the cached funding snapshot from the chain
    #[instrument(skip(self))]
    pub async fn sync_funding(&self, public_id: &str) -> Result<SyncFundingResponse, AppError> {
        let card = self.load_card(public_id).await?;
        if card.is_terminal() {
            return Err(terminal_conflict(&card).into());
        }
        let address = card
            .deposit_address
            .clone()
            .ok_or(LifecycleError::DepositAddressUnassigned)?;

        let snapshot = self.read_funding(&address).await.map_err(|e| {
            error!(public_id = %public_id, error = ?e, "Deposit balance read failed");
            e
        })?;

        let updated = self.store_snapshot(&card, &snapshot).await?;

        if !card.funded && updated.funded {
            info!(
                public_id = %public_id,
                total_value_sol = snapshot.total_value_sol,
                "Card funded"
            );
            self.emit(
                CardEvent::new(public_id, CardEventKind::Funded)
                    .with_amount(snapshot.total_value_sol)
                    .with_currency(&updated.currency),
            )
            .await;
        }

        Ok(SyncFundingResponse {
            public_id: updated.public_id,
            deposit_address: address,
            lamports: snapshot.lamports,
            sol: snapshot.sol_native,
            tokens: snapshot.holdings,
            tokens_total_value_sol: snapshot.tokens_total_value_sol,
            total_value_sol: snapshot.total_value_sol,
            token_amount: snapshot.token_amount,
            primary_mint: snapshot.primary_mint,
            funded: updated.funded,
        })
    }

    /// Claim a locked card into the destination wallet, withholding the
    /// protocol tax.
    #[instrument(skip(self, request), fields(public_id = %request.public_id))]
    pub async fn claim_card(
        &self,
        request: &ClaimCardRequest,
    ) -> Result<ClaimCardResponse, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let mut card = self.load_card(&request.public_id).await?;

        validate_claim_credentials(&card, &request.cvv).inspect_err(|e| {
            warn!(public_id = %card.public_id, reason = e.code(), "Claim rejected");
        })?;

        if card.settlement.is_some() {
            self.reconcile_settlement(&card).await?;
            card = self.load_card(&request.public_id).await?;
            validate_claim_credentials(&card, &request.cvv)?;
            if card.settlement.is_some() {
                return Err(LifecycleError::SettlementInProgress.into());
            }
        }

        let address = card.deposit_address.clone().ok_or(LifecycleError::NoBalance)?;
        let snapshot = self.read_funding(&address).await?;
        let card = self.store_snapshot(&card, &snapshot).await?;
        check_claimable(&card, &snapshot)?;

        validate_destination(&request.destination_wallet, card.deposit_address.as_deref())?;

        let plan = compute_payout(
            &card,
            &snapshot,
            SettlementKind::Claim,
            &request.destination_wallet,
            &self.policy,
        )?;

        let signature = self.settle(&card, &plan).await?;

        Ok(ClaimCardResponse {
            success: true,
            signature,
            amount_sol: plan.net_value_sol,
            tax_sol: plan.tax_value_sol,
        })
    }

    /// Return an expired card's balance to its creator
    #[instrument(skip(self))]
    pub async fn refund_card(&self, public_id: &str) -> Result<RefundCardResponse, AppError> {
        let mut card = self.load_card(public_id).await?;
        check_refund_eligibility(&card, Utc::now())?;

        if card.settlement.is_some() {
            self.reconcile_settlement(&card).await?;
            card = self.load_card(public_id).await?;
            check_refund_eligibility(&card, Utc::now())?;
            if card.settlement.is_some() {
                return Err(LifecycleError::SettlementInProgress.into());
            }
        }

        let address = card.deposit_address.clone().ok_or(LifecycleError::NoBalance)?;
        let snapshot = self.read_funding(&address).await?;
        let card = self.store_snapshot(&card, &snapshot).await?;
        if !snapshot.has_claimable_value() {
            return Err(LifecycleError::NoBalance.into());
        }

        let destination = match refund_destination(&card) {
            Ok(destination) => destination.to_string(),
            Err(e) => {
                if !card.needs_operator {
                    warn!(
                        public_id = %public_id,
                        "Expired card has no usable refund address, flagging for operator"
                    );
                    self.db_client.flag_for_operator(public_id).await?;
                }
                return Err(e.into());
            }
        };

        let plan = compute_payout(
            &card,
            &snapshot,
            SettlementKind::Refund,
            &destination,
            &self.policy,
        )?;
        let signature = self.settle(&card, &plan).await?;

        Ok(RefundCardResponse {
            success: true,
            signature,
            amount_sol: plan.net_value_sol,
            destination,
        })
    }

    /// Reserve, sign, broadcast and confirm a payout.
    ///
    /// The reservation is released whenever the transfer definitely did not
    /// happen and kept (with its signature) whenever the outcome is unknown.
    async fn settle(&self, card: &Card, plan: &PayoutPlan) -> Result<String, AppError> {
        let public_id = card.public_id.as_str();

        let won = self
            .db_client
            .reserve_settlement(public_id, plan.kind, &plan.destination, Utc::now())
            .await?;
        if !won {
            let current = self.load_card(public_id).await?;
            warn!(public_id = %public_id, kind = %plan.kind, "Lost settlement reservation race");
            return Err(reservation_conflict(&current, plan.kind).into());
        }

        let signed = match self.blockchain_client.prepare_payout(plan).await {
            Ok(signed) => signed,
            Err(e) => {
                error!(
                    public_id = %public_id,
                    error = ?e,
                    "Failed to build settlement transaction"
                );
                self.release(public_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .db_client
            .record_settlement_signature(public_id, &signed.signature)
            .await
        {
            self.release(public_id).await;
            return Err(e);
        }

        match self.blockchain_client.broadcast_payout(&signed).await {
            Ok(_) => {}
            Err(AppError::Blockchain(e)) if e.is_outcome_unknown() => {
                warn!(
                    public_id = %public_id,
                    signature = %signed.signature,
                    error = %e,
                    "Broadcast outcome unknown, keeping reservation"
                );
                return Err(outcome_unknown(&signed.signature));
            }
            Err(e) => {
                error!(public_id = %public_id, error = ?e, "Settlement broadcast rejected");
                self.release(public_id).await;
                return Err(e);
            }
        }

        info!(
            public_id = %public_id,
            signature = %signed.signature,
            kind = %plan.kind,
            "Settlement broadcast"
        );

        match self
            .blockchain_client
            .wait_for_confirmation(&signed.signature, self.policy.confirmation_timeout_secs)
            .await
        {
            Ok(TransactionStatus::Confirmed) => {
                self.complete(card, plan.kind, &signed.signature, plan.net_value_sol)
                    .await?;
                Ok(signed.signature)
            }
            Ok(TransactionStatus::Failed(reason)) => {
                error!(
                    public_id = %public_id,
                    reason = %reason,
                    "Settlement transaction failed on chain"
                );
                self.release(public_id).await;
                Err(BlockchainError::TransactionFailed(reason).into())
            }
            Ok(TransactionStatus::Pending | TransactionStatus::NotFound) => {
                Err(outcome_unknown(&signed.signature))
            }
            Err(e) => {
                warn!(
                    public_id = %public_id,
                    error = ?e,
                    "Confirmation wait failed, keeping reservation"
                );
                Err(outcome_unknown(&signed.signature))
            }
        }
    }

    async fn complete(
        &self,
        card: &Card,
        kind: SettlementKind,
        signature: &str,
        amount_sol: f64,
    ) -> Result<(), AppError> {
        let completed = self
            .db_client
            .complete_settlement(&card.public_id, signature, Utc::now())
            .await?;
        if !completed {
            return Ok(());
        }
        info!(
            public_id = %card.public_id,
            signature = %signature,
            kind = %kind,
            "Settlement confirmed"
        );
        let event_kind = match kind {
            SettlementKind::Claim => CardEventKind::Claimed,
            SettlementKind::Refund => CardEventKind::Refunded,
        };
        self.emit(
            CardEvent::new(&card.public_id, event_kind)
                .with_amount(amount_sol)
                .with_currency(&card.currency)
                .with_signature(signature),
        )
        .await;
        Ok(())
    }

    async fn release(&self, public_id: &str) {
        if let Err(e) = self.db_client.release_settlement(public_id).await {
            error!(public_id = %public_id, error = ?e, "Failed to release settlement reservation");
        }
    }

    /// Resolve a pending settlement by asking the chain what happened
    #[instrument(skip(self, card), fields(public_id = %card.public_id))]
    pub async fn reconcile_settlement(&self, card: &Card) -> Result<SettlementOutcome, AppError> {
        let Some(settlement) = card.settlement.as_ref() else {
            return Ok(SettlementOutcome::Nothing);
        };
        if card.is_terminal() {
            return Ok(SettlementOutcome::Nothing);
        }

        let now = Utc::now();
        let stale = is_settlement_stale(settlement.reserved_at, now, &self.policy);

        let Some(signature) = settlement.signature.as_deref() else {
            if stale {
                info!("Releasing unsigned stale reservation");
                self.db_client.release_settlement(&card.public_id).await?;
                return Ok(SettlementOutcome::Released);
            }
            return Ok(SettlementOutcome::Pending);
        };

        match self.blockchain_client.get_transaction_status(signature).await? {
            TransactionStatus::Confirmed => {
                self.complete(card, settlement.kind, signature, card.sol_amount)
                    .await?;
                Ok(SettlementOutcome::Completed)
            }
            TransactionStatus::Failed(reason) => {
                info!(signature = %signature, reason = %reason, "Releasing failed settlement");
                self.db_client.release_settlement(&card.public_id).await?;
                Ok(SettlementOutcome::Released)
            }
            TransactionStatus::Pending => Ok(SettlementOutcome::Pending),
            TransactionStatus::NotFound if stale => {
                info!(signature = %signature, "Settlement never landed, releasing");
                self.db_client.release_settlement(&card.public_id).await?;
                Ok(SettlementOutcome::Released)
            }
            TransactionStatus::NotFound => Ok(SettlementOutcome::Pending),
        }
    }

    /// Reconcile a batch of pending settlements (called by the worker and the admin route)
    #[instrument(skip(self))]
    pub async fn run_reconciliation_pass(
        &self,
        batch_size: i64,
    ) -> Result<ReconciliationReport, AppError> {
        let pending = self.db_client.list_pending_settlements(batch_size).await?;
        let mut report = ReconciliationReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        info!(count = pending.len(), "Reconciling pending settlements");
        for card in &pending {
            report.examined += 1;
            match self.reconcile_settlement(card).await {
                Ok(SettlementOutcome::Completed) => report.completed += 1,
                Ok(SettlementOutcome::Released) => report.released += 1,
                Ok(SettlementOutcome::Pending) => report.pending += 1,
                Ok(SettlementOutcome::Nothing) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(
                        public_id = %card.public_id,
                        error = ?e,
                        "Failed to reconcile settlement"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Refund a batch of expired cards. Returns how many were refunded.
    #[instrument(skip(self))]
    pub async fn run_refund_sweep(&self, batch_size: i64) -> Result<usize, AppError> {
        let candidates = self
            .db_client
            .list_refund_candidates(Utc::now(), batch_size)
            .await?;
        let mut refunded = 0;
        for card in &candidates {
            match self.refund_card(&card.public_id).await {
                Ok(_) => refunded += 1,
                Err(AppError::Lifecycle(LifecycleError::RefundNeedsOperator)) => {
                    info!(public_id = %card.public_id, "Refund handed to operator");
                }
                Err(e) => {
                    warn!(public_id = %card.public_id, error = ?e, "Sweep refund failed");
                    if let Err(e) = self.back_off_refund(&card.public_id).await {
                        error!(public_id = %card.public_id, error = ?e, "Failed to defer refund");
                    }
                }
            }
        }
        Ok(refunded)
    }

    /// Push a failed sweep refund back so later candidates get their turn.
    ///
    /// A card left with a pending settlement is reconciled instead. After
    /// `max_refund_attempts` failures the card goes to an operator.
    async fn back_off_refund(&self, public_id: &str) -> Result<(), AppError> {
        let card = self.load_card(public_id).await?;
        if card.is_terminal() || card.settlement.is_some() || card.needs_operator {
            return Ok(());
        }

        let failed = card.refund_attempts.saturating_add(1);
        if failed >= self.policy.max_refund_attempts {
            warn!(
                public_id = %public_id,
                attempts = failed,
                "Refund keeps failing, flagging for operator"
            );
            self.db_client.flag_for_operator(public_id).await?;
            return Ok(());
        }

        let retry_at = next_refund_attempt_at(failed, Utc::now(), &self.policy);
        let attempts = self.db_client.defer_refund(public_id, retry_at).await?;
        info!(public_id = %public_id, attempts, retry_at = %retry_at, "Refund deferred");
        Ok(())
    }

    /// Perform health check on all dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let db_health = match self.db_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let blockchain_health = match self.blockchain_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(db_health, blockchain_health)
    }

    pub async fn sol_price(&self) -> Result<SolPriceResponse, AppError> {
        let sol_usd = self.price_oracle.sol_usd().await?;
        Ok(SolPriceResponse { sol_usd })
    }

    pub async fn public_metrics(&self) -> Result<PublicMetrics, AppError> {
        self.db_client.get_public_metrics().await
    }

    /// Recent lifecycle events with masked card ids
    pub async fn public_activity(
        &self,
        params: &ActivityParams,
    ) -> Result<Vec<ActivityItem>, AppError> {
        params
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        let events = self.db_client.list_recent_events(params.limit).await?;
        Ok(events
            .into_iter()
            .map(|event| ActivityItem {
                card: mask_public_id(&event.public_id),
                kind: event.kind,
                amount_sol: event.amount_sol,
                currency: event.currency,
                occurred_at: event.occurred_at,
            })
            .collect())
    }

    /// Record an event and notify in the background; never fails the caller
    async fn emit(&self, event: CardEvent) {
        if let Err(e) = self.db_client.record_event(&event).await {
            warn!(
                public_id = %event.public_id,
                kind = %event.kind,
                error = ?e,
                "Failed to record card event"
            );
        }

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind = %event.kind, error = ?e, "Notification failed"),
                Err(_) => warn!(kind = %event.kind, "Notification timed out"),
            }
        });
    }
}

fn terminal_conflict(card: &Card) -> LifecycleError {
    if card.claimed {
        LifecycleError::AlreadyClaimed
    } else {
        LifecycleError::AlreadyRefunded
    }
}

/// Why a settlement reservation could not be taken
fn reservation_conflict(card: &Card, kind: SettlementKind) -> LifecycleError {
    if card.claimed {
        LifecycleError::AlreadyClaimed
    } else if card.refunded {
        LifecycleError::AlreadyRefunded
    } else if kind == SettlementKind::Claim && !card.locked {
        LifecycleError::NotLocked
    } else {
        LifecycleError::SettlementInProgress
    }
}

fn ensure_future_expiry(expires_at: Option<DateTime<Utc>>) -> Result<(), AppError> {
    if expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
        return Err(ValidationError::InvalidField {
            field: "expires_at".to_string(),
            message: "Expiry must be in the future".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Refund wallets must be payable when the card expires
fn ensure_refund_wallet(
    address: Option<&str>,
    deposit_address: Option<&str>,
) -> Result<(), AppError> {
    match address {
        Some(address) if validate_destination(address, deposit_address).is_err() => {
            Err(ValidationError::InvalidField {
                field: "refund_address".to_string(),
                message: "Refund address must be a Solana public key other than the deposit address"
                    .to_string(),
            }
            .into())
        }
        _ => Ok(()),
    }
}

fn outcome_unknown(signature: &str) -> AppError {
    BlockchainError::Timeout(format!(
        "Settlement {} is not confirmed yet; it will be reconciled",
        signature
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::card::NewCard;
    use crate::test_utils::{
        MockBlockchainClient, MockDatabaseClient, MockDepositProvider, MockNotifier,
        MockPriceOracle,
    };

    fn service_with(db: Arc<MockDatabaseClient>) -> CardService {
        CardService::new(
            db,
            Arc::new(MockBlockchainClient::new()),
            Arc::new(MockPriceOracle::new()),
            Arc::new(MockNotifier::new()),
            Arc::new(MockDepositProvider::new()),
            LifecyclePolicy::default(),
        )
    }

    fn stored_card(public_id: &str) -> NewCard {
        NewCard {
            public_id: public_id.to_string(),
            cvv: "123456".to_string(),
            deposit_address: None,
            user_id: None,
            message: None,
            currency: "USD".to_string(),
            amount_fiat: None,
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        }
    }

    #[test]
    fn test_reservation_conflict_mapping() {
        let mut card = Card::from_new("id".to_string(), &stored_card("ABCD2345"));
        assert_eq!(reservation_conflict(&card, SettlementKind::Claim), LifecycleError::NotLocked);
        assert_eq!(
            reservation_conflict(&card, SettlementKind::Refund),
            LifecycleError::SettlementInProgress
        );
        card.refunded = true;
        assert_eq!(
            reservation_conflict(&card, SettlementKind::Claim),
            LifecycleError::AlreadyRefunded
        );
        card.refunded = false;
        card.claimed = true;
        assert_eq!(
            reservation_conflict(&card, SettlementKind::Claim),
            LifecycleError::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn test_create_retries_on_collision() {
        let db = Arc::new(MockDatabaseClient::new());
        db.fail_inserts_with_duplicate(2);
        let service = service_with(Arc::clone(&db));
        let request = CreateCardRequest {
            message: None,
            currency: "usd".to_string(),
            amount_fiat: Some(20.0),
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        };
        let response = service.create_card(&request, None).await.unwrap();
        assert_eq!(response.public_id.len(), 8);
        let stored = db.get_card(&response.public_id).await.unwrap().unwrap();
        assert_eq!(stored.currency, "USD");
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let db = Arc::new(MockDatabaseClient::new());
        db.fail_inserts_with_duplicate(10);
        let service = service_with(db);
        let request = CreateCardRequest {
            message: None,
            currency: "USD".to_string(),
            amount_fiat: None,
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        };
        let err = service.create_card(&request, None).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_currency() {
        let service = service_with(Arc::new(MockDatabaseClient::new()));
        let request = CreateCardRequest {
            message: None,
            currency: "   ".to_string(),
            amount_fiat: None,
            token_mint: None,
            expires_at: None,
            template_url: None,
            refund_address: None,
        };
        let err = service.create_card(&request, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::MissingField(_))));
    }

    #[tokio::test]
    async fn test_unsigned_fresh_reservation_stays_pending() {
        let db = Arc::new(MockDatabaseClient::new());
        db.insert_card(&stored_card("PEND2345")).await.unwrap();
        db.lock_card("PEND2345", Utc::now()).await.unwrap();
        db.reserve_settlement("PEND2345", SettlementKind::Claim, "dest", Utc::now())
            .await
            .unwrap();
        let service = service_with(Arc::clone(&db));
        let card = db.get_card("PEND2345").await.unwrap().unwrap();
        assert_eq!(
            service.reconcile_settlement(&card).await.unwrap(),
            SettlementOutcome::Pending
        );
    }

    #[tokio::test]
    async fn test_unsigned_stale_reservation_is_released() {
        let db = Arc::new(MockDatabaseClient::new());
        db.insert_card(&stored_card("STAL2345")).await.unwrap();
        db.lock_card("STAL2345", Utc::now()).await.unwrap();
        db.reserve_settlement(
            "STAL2345",
            SettlementKind::Claim,
            "dest",
            Utc::now() - chrono::Duration::seconds(600),
        )
        .await
        .unwrap();
        let service = service_with(Arc::clone(&db));
        let card = db.get_card("STAL2345").await.unwrap().unwrap();
        assert_eq!(
            service.reconcile_settlement(&card).await.unwrap(),
            SettlementOutcome::Released
        );
        assert!(db.get_card("STAL2345").await.unwrap().unwrap().settlement.is_none());
    }
}
