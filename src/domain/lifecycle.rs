//! Card lifecycle engine.
//!
//! Pure decision rules for every transition a card can take. Nothing here
//! performs I/O; the service layer feeds in the current card, a fresh funding
//! snapshot and the policy, and carries out whatever the engine allows.

use std::env;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::card::{Card, SettlementKind};
use super::error::{AppError, ConfigError};
use super::funding::{FundingSnapshot, lamports_to_sol, raw_to_ui};

/// Default protocol tax: 1.5%
pub const DEFAULT_TAX_BPS: u16 = 150;
const BPS_DENOMINATOR: u128 = 10_000;

/// Tunables for the lifecycle engine
#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    /// Allow "lock first, fund later"
    pub allow_unfunded_lock: bool,
    pub tax_bps: u16,
    pub public_id_length: usize,
    pub cvv_length: usize,
    /// Attempts at generating a unique public id before giving up
    pub max_id_attempts: u32,
    /// Age after which an unconfirmed settlement reservation may be released
    pub settlement_stale_after_secs: i64,
    pub confirmation_timeout_secs: u64,
    pub tax_collection_address: Option<String>,
    /// Failed sweep refunds before the card is handed to an operator
    pub max_refund_attempts: u32,
    /// First sweep retry delay, doubled per failed attempt
    pub refund_retry_base_secs: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            allow_unfunded_lock: true,
            tax_bps: DEFAULT_TAX_BPS,
            public_id_length: 8,
            cvv_length: 6,
            max_id_attempts: 5,
            settlement_stale_after_secs: 120,
            confirmation_timeout_secs: 60,
            tax_collection_address: None,
            max_refund_attempts: 5,
            refund_retry_base_secs: 300,
        }
    }
}

impl LifecyclePolicy {
    /// Read `CARD_*` overrides from the environment
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            allow_unfunded_lock: env::var("CARD_ALLOW_UNFUNDED_LOCK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.allow_unfunded_lock),
            tax_bps: env::var("CARD_TAX_BPS")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .filter(|bps| *bps <= 10_000)
                .unwrap_or(defaults.tax_bps),
            public_id_length: env::var("CARD_PUBLIC_ID_LENGTH")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|len| *len >= 6)
                .unwrap_or(defaults.public_id_length),
            cvv_length: env::var("CARD_CVV_LENGTH")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|len| *len >= 3)
                .unwrap_or(defaults.cvv_length),
            max_id_attempts: env::var("CARD_MAX_ID_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_id_attempts),
            settlement_stale_after_secs: env::var("CARD_SETTLEMENT_STALE_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(defaults.settlement_stale_after_secs),
            confirmation_timeout_secs: env::var("CARD_CONFIRMATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.confirmation_timeout_secs),
            tax_collection_address: env::var("TAX_COLLECTION_ADDRESS")
                .ok()
                .filter(|a| !a.is_empty()),
            max_refund_attempts: env::var("CARD_MAX_REFUND_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_refund_attempts),
            refund_retry_base_secs: env::var("CARD_REFUND_RETRY_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.refund_retry_base_secs),
        }
    }

    #[must_use]
    pub fn with_tax_collection_address(mut self, address: impl Into<String>) -> Self {
        self.tax_collection_address = Some(address.into());
        self
    }
}

/// Illegal transitions, surfaced to clients as state conflicts
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid CVV")]
    InvalidCvv,

    #[error("Card is not locked and cannot be claimed yet")]
    NotLocked,

    #[error("Card has already been claimed")]
    AlreadyClaimed,

    #[error("Card has already been refunded")]
    AlreadyRefunded,

    #[error("Card has no claimable balance")]
    NoBalance,

    #[error("Destination wallet is not a valid Solana address")]
    InvalidDestination,

    #[error("A settlement for this card is already in progress")]
    SettlementInProgress,

    #[error("Card is locked and its details can no longer be edited")]
    MetadataLocked,

    #[error("Card must be funded before it can be locked")]
    NotFunded,

    #[error("Card has not expired")]
    NotExpired,

    #[error("Card has no deposit address")]
    DepositAddressUnassigned,

    #[error("No refund address is known; the card was flagged for operator review")]
    RefundNeedsOperator,
}

impl LifecycleError {
    /// Stable machine-readable tag
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCvv => "invalid_cvv",
            Self::NotLocked => "not_locked",
            Self::AlreadyClaimed => "already_claimed",
            Self::AlreadyRefunded => "already_refunded",
            Self::NoBalance => "no_balance",
            Self::InvalidDestination => "invalid_destination",
            Self::SettlementInProgress => "settlement_in_progress",
            Self::MetadataLocked => "metadata_locked",
            Self::NotFunded => "not_funded",
            Self::NotExpired => "not_expired",
            Self::DepositAddressUnassigned => "deposit_address_unassigned",
            Self::RefundNeedsOperator => "refund_needs_operator",
        }
    }
}

/// Creator-editable fields are frozen once the card is locked
#[must_use]
pub fn can_edit_metadata(card: &Card) -> bool {
    !card.locked
}

pub fn ensure_metadata_editable(card: &Card) -> Result<(), LifecycleError> {
    if card.is_terminal() || !can_edit_metadata(card) {
        return Err(LifecycleError::MetadataLocked);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    Lock,
    AlreadyLocked,
}

pub fn evaluate_lock(
    card: &Card,
    policy: &LifecyclePolicy,
) -> Result<LockDecision, LifecycleError> {
    if card.claimed {
        return Err(LifecycleError::AlreadyClaimed);
    }
    if card.refunded {
        return Err(LifecycleError::AlreadyRefunded);
    }
    if card.locked {
        return Ok(LockDecision::AlreadyLocked);
    }
    if !card.funded && !policy.allow_unfunded_lock {
        return Err(LifecycleError::NotFunded);
    }
    Ok(LockDecision::Lock)
}

/// Claim steps 2-5: CVV, locked, not claimed, not refunded.
///
/// The CVV check runs first so a wrong CVV reveals nothing about the card's
/// state.
pub fn validate_claim_credentials(card: &Card, cvv: &str) -> Result<(), LifecycleError> {
    if !card.cvv_matches(cvv) {
        return Err(LifecycleError::InvalidCvv);
    }
    if !card.locked {
        return Err(LifecycleError::NotLocked);
    }
    if card.claimed {
        return Err(LifecycleError::AlreadyClaimed);
    }
    if card.refunded {
        return Err(LifecycleError::AlreadyRefunded);
    }
    Ok(())
}

/// Claim step 6 against a freshly read snapshot
pub fn check_claimable(card: &Card, snapshot: &FundingSnapshot) -> Result<(), LifecycleError> {
    let funded = card.funded || snapshot.observed_funded;
    if !funded || !snapshot.has_claimable_value() {
        return Err(LifecycleError::NoBalance);
    }
    Ok(())
}

/// Claim step 7: a base58 ed25519 public key that is not the card's own
/// deposit address
pub fn validate_destination(
    destination: &str,
    deposit_address: Option<&str>,
) -> Result<(), LifecycleError> {
    let trimmed = destination.trim();
    if trimmed.is_empty() || trimmed != destination {
        return Err(LifecycleError::InvalidDestination);
    }
    let decoded = bs58::decode(destination)
        .into_vec()
        .map_err(|_| LifecycleError::InvalidDestination)?;
    if decoded.len() != 32 {
        return Err(LifecycleError::InvalidDestination);
    }
    if deposit_address == Some(destination) {
        return Err(LifecycleError::InvalidDestination);
    }
    Ok(())
}

/// Expiry refund predicate (balance is checked separately on a fresh read)
pub fn check_refund_eligibility(card: &Card, now: DateTime<Utc>) -> Result<(), LifecycleError> {
    if card.claimed {
        return Err(LifecycleError::AlreadyClaimed);
    }
    if card.refunded {
        return Err(LifecycleError::AlreadyRefunded);
    }
    if !card.is_expired_at(now) {
        return Err(LifecycleError::NotExpired);
    }
    Ok(())
}

/// Where a refund goes, if anywhere.
///
/// A missing or unusable creator wallet leaves the refund to an operator.
pub fn refund_destination(card: &Card) -> Result<&str, LifecycleError> {
    let address = card
        .refund_address
        .as_deref()
        .ok_or(LifecycleError::RefundNeedsOperator)?;
    validate_destination(address, card.deposit_address.as_deref())
        .map_err(|_| LifecycleError::RefundNeedsOperator)?;
    Ok(address)
}

/// Upper bound on the sweep retry delay
const MAX_REFUND_RETRY_SECS: i64 = 24 * 60 * 60;

/// When the sweep may try a card again after `failed_attempts` failures
#[must_use]
pub fn next_refund_attempt_at(
    failed_attempts: u32,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> DateTime<Utc> {
    let factor = 2_i64.pow(failed_attempts.saturating_sub(1).min(16));
    let delay = policy
        .refund_retry_base_secs
        .saturating_mul(factor)
        .min(MAX_REFUND_RETRY_SECS);
    now + chrono::Duration::seconds(delay)
}

/// Whether a settlement reservation is old enough to be released when the
/// chain has no record of its transaction
#[must_use]
pub fn is_settlement_stale(
    reserved_at: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &LifecyclePolicy,
) -> bool {
    (now - reserved_at).num_seconds() >= policy.settlement_stale_after_secs
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayoutAsset {
    Native,
    Token {
        mint: String,
        token_account: String,
        token_program: String,
        decimals: u8,
    },
}

/// One asset moved out of the deposit address, in smallest units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PayoutLeg {
    pub asset: PayoutAsset,
    pub gross: u64,
    pub tax: u64,
    pub net: u64,
}

/// Everything needed to build a settlement transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PayoutPlan {
    pub public_id: String,
    pub source_address: String,
    pub kind: SettlementKind,
    pub destination: String,
    pub tax_collector: Option<String>,
    pub legs: Vec<PayoutLeg>,
    pub gross_value_sol: f64,
    pub tax_value_sol: f64,
    pub net_value_sol: f64,
}

/// Round-half-up share of `gross` in basis points
#[must_use]
pub fn compute_tax(gross: u64, bps: u16) -> u64 {
    let scaled = u128::from(gross) * u128::from(bps) + BPS_DENOMINATOR / 2;
    (scaled / BPS_DENOMINATOR) as u64
}

/// Split every held asset into tax and net legs.
///
/// Claims withhold `policy.tax_bps` on each leg; refunds carry no tax.
pub fn compute_payout(
    card: &Card,
    snapshot: &FundingSnapshot,
    kind: SettlementKind,
    destination: &str,
    policy: &LifecyclePolicy,
) -> Result<PayoutPlan, AppError> {
    let source_address = card
        .deposit_address
        .clone()
        .ok_or(LifecycleError::DepositAddressUnassigned)?;
    let bps = match kind {
        SettlementKind::Claim => policy.tax_bps,
        SettlementKind::Refund => 0,
    };

    let mut legs = Vec::new();
    let mut gross_value_sol = 0.0;
    let mut tax_value_sol = 0.0;

    if snapshot.lamports > 0 {
        let tax = compute_tax(snapshot.lamports, bps);
        let net = snapshot.lamports - tax;
        if net > 0 {
            gross_value_sol += lamports_to_sol(snapshot.lamports);
            tax_value_sol += lamports_to_sol(tax);
            legs.push(PayoutLeg {
                asset: PayoutAsset::Native,
                gross: snapshot.lamports,
                tax,
                net,
            });
        }
    }

    for priced in &snapshot.holdings {
        let holding = &priced.holding;
        if holding.raw_amount == 0 {
            continue;
        }
        let tax = compute_tax(holding.raw_amount, bps);
        let net = holding.raw_amount - tax;
        if net == 0 {
            continue;
        }
        if let Some(price) = priced.price_sol {
            gross_value_sol += raw_to_ui(holding.raw_amount, holding.decimals) * price;
            tax_value_sol += raw_to_ui(tax, holding.decimals) * price;
        }
        legs.push(PayoutLeg {
            asset: PayoutAsset::Token {
                mint: holding.mint.clone(),
                token_account: holding.token_account.clone(),
                token_program: holding.token_program.clone(),
                decimals: holding.decimals,
            },
            gross: holding.raw_amount,
            tax,
            net,
        });
    }

    if legs.is_empty() {
        return Err(LifecycleError::NoBalance.into());
    }

    let needs_collector = legs.iter().any(|leg| leg.tax > 0);
    let tax_collector = if needs_collector {
        Some(policy.tax_collection_address.clone().ok_or_else(|| {
            ConfigError::MissingEnvVar("TAX_COLLECTION_ADDRESS".to_string())
        })?)
    } else {
        None
    };

    Ok(PayoutPlan {
        public_id: card.public_id.clone(),
        source_address,
        kind,
        destination: destination.to_string(),
        tax_collector,
        legs,
        gross_value_sol,
        tax_value_sol,
        net_value_sol: gross_value_sol - tax_value_sol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::card::NewCard;
    use crate::domain::funding::{DepositBalance, LAMPORTS_PER_SOL, TokenHolding, reconcile_funding};
    use chrono::Duration;
    use std::collections::HashMap;

    const DEPOSIT: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
    const DESTINATION: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
    const COLLECTOR: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn card() -> Card {
        let mut card = Card::from_new(
            "id".to_string(),
            &NewCard {
                public_id: "ABCD2345".to_string(),
                cvv: "123456".to_string(),
                deposit_address: Some(DEPOSIT.to_string()),
                user_id: None,
                message: None,
                currency: "USD".to_string(),
                amount_fiat: Some(20.0),
                token_mint: None,
                expires_at: None,
                template_url: None,
                refund_address: None,
            },
        );
        card.funded = true;
        card.locked = true;
        card
    }

    fn policy() -> LifecyclePolicy {
        LifecyclePolicy::default().with_tax_collection_address(COLLECTOR)
    }

    fn sol_snapshot(lamports: u64) -> FundingSnapshot {
        reconcile_funding(
            &DepositBalance {
                address: DEPOSIT.to_string(),
                lamports,
                tokens: vec![],
            },
            &HashMap::new(),
        )
    }

    #[test]
    fn test_metadata_editable_only_before_lock() {
        let mut c = card();
        c.locked = false;
        assert!(can_edit_metadata(&c));
        assert!(ensure_metadata_editable(&c).is_ok());
        c.locked = true;
        assert!(!can_edit_metadata(&c));
        assert_eq!(ensure_metadata_editable(&c), Err(LifecycleError::MetadataLocked));
    }

    #[test]
    fn test_lock_decisions() {
        let mut c = card();
        c.locked = false;
        assert_eq!(evaluate_lock(&c, &policy()), Ok(LockDecision::Lock));
        c.locked = true;
        assert_eq!(evaluate_lock(&c, &policy()), Ok(LockDecision::AlreadyLocked));
        c.claimed = true;
        assert_eq!(evaluate_lock(&c, &policy()), Err(LifecycleError::AlreadyClaimed));
    }

    #[test]
    fn test_unfunded_lock_follows_policy() {
        let mut c = card();
        c.locked = false;
        c.funded = false;
        assert_eq!(evaluate_lock(&c, &policy()), Ok(LockDecision::Lock));
        let strict = LifecyclePolicy {
            allow_unfunded_lock: false,
            ..policy()
        };
        assert_eq!(evaluate_lock(&c, &strict), Err(LifecycleError::NotFunded));
    }

    #[test]
    fn test_wrong_cvv_fails_in_every_state() {
        let mut c = card();
        for (locked, claimed, refunded) in [
            (false, false, false),
            (true, false, false),
            (true, true, false),
            (false, false, true),
        ] {
            c.locked = locked;
            c.claimed = claimed;
            c.refunded = refunded;
            assert_eq!(validate_claim_credentials(&c, "000000"), Err(LifecycleError::InvalidCvv));
        }
    }

    #[test]
    fn test_claim_validation_order() {
        let mut c = card();
        c.locked = false;
        assert_eq!(validate_claim_credentials(&c, "123456"), Err(LifecycleError::NotLocked));
        c.locked = true;
        assert!(validate_claim_credentials(&c, "123456").is_ok());
        c.claimed = true;
        assert_eq!(validate_claim_credentials(&c, "123456"), Err(LifecycleError::AlreadyClaimed));
        c.claimed = false;
        c.refunded = true;
        assert_eq!(validate_claim_credentials(&c, "123456"), Err(LifecycleError::AlreadyRefunded));
    }

    #[test]
    fn test_claimable_requires_positive_value() {
        let c = card();
        assert!(check_claimable(&c, &sol_snapshot(LAMPORTS_PER_SOL)).is_ok());
        assert_eq!(check_claimable(&c, &sol_snapshot(0)), Err(LifecycleError::NoBalance));
    }

    #[test]
    fn test_unfunded_card_with_fresh_balance_is_claimable() {
        let mut c = card();
        c.funded = false;
        assert!(check_claimable(&c, &sol_snapshot(5)).is_ok());
    }

    #[test]
    fn test_destination_validation() {
        assert!(validate_destination(DESTINATION, Some(DEPOSIT)).is_ok());
        assert_eq!(validate_destination("", None), Err(LifecycleError::InvalidDestination));
        assert_eq!(
            validate_destination("not-a-wallet", None),
            Err(LifecycleError::InvalidDestination)
        );
        assert_eq!(validate_destination("3yZe7d", None), Err(LifecycleError::InvalidDestination));
        assert_eq!(
            validate_destination(&format!(" {}", DESTINATION), None),
            Err(LifecycleError::InvalidDestination)
        );
        assert_eq!(
            validate_destination(DEPOSIT, Some(DEPOSIT)),
            Err(LifecycleError::InvalidDestination)
        );
    }

    #[test]
    fn test_refund_eligibility() {
        let now = Utc::now();
        let mut c = card();
        assert_eq!(check_refund_eligibility(&c, now), Err(LifecycleError::NotExpired));
        c.expires_at = Some(now + Duration::hours(1));
        assert_eq!(check_refund_eligibility(&c, now), Err(LifecycleError::NotExpired));
        c.expires_at = Some(now - Duration::hours(1));
        assert!(check_refund_eligibility(&c, now).is_ok());
        c.claimed = true;
        assert_eq!(check_refund_eligibility(&c, now), Err(LifecycleError::AlreadyClaimed));
    }

    #[test]
    fn test_refund_destination_requires_address() {
        let mut c = card();
        assert_eq!(refund_destination(&c), Err(LifecycleError::RefundNeedsOperator));
        c.refund_address = Some(DESTINATION.to_string());
        assert_eq!(refund_destination(&c), Ok(DESTINATION));
    }

    #[test]
    fn test_unusable_refund_address_needs_operator() {
        let mut c = card();
        for bad in ["0".repeat(32), DEPOSIT.to_string(), format!(" {}", DESTINATION)] {
            c.refund_address = Some(bad);
            assert_eq!(refund_destination(&c), Err(LifecycleError::RefundNeedsOperator));
        }
    }

    #[test]
    fn test_tax_rounding() {
        assert_eq!(compute_tax(2 * LAMPORTS_PER_SOL, 150), 30_000_000);
        assert_eq!(compute_tax(100, 150), 2); // 1.5 rounds up
        assert_eq!(compute_tax(33, 150), 0); // 0.495 rounds down
        assert_eq!(compute_tax(u64::MAX, 10_000), u64::MAX);
        assert_eq!(compute_tax(1_000, 0), 0);
    }

    #[test]
    fn test_claim_payout_withholds_tax() {
        let plan = compute_payout(
            &card(),
            &sol_snapshot(2 * LAMPORTS_PER_SOL),
            SettlementKind::Claim,
            DESTINATION,
            &policy(),
        )
        .unwrap();
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].tax, 30_000_000);
        assert_eq!(plan.legs[0].net, 1_970_000_000);
        assert!((plan.net_value_sol - 1.97).abs() < 1e-9);
        assert!((plan.tax_value_sol - 0.03).abs() < 1e-9);
        assert_eq!(plan.tax_collector.as_deref(), Some(COLLECTOR));
        assert_eq!(plan.source_address, DEPOSIT);
    }

    #[test]
    fn test_token_legs_are_taxed_individually() {
        let balance = DepositBalance {
            address: DEPOSIT.to_string(),
            lamports: 0,
            tokens: vec![TokenHolding {
                mint: "USDC".to_string(),
                token_account: "ata".to_string(),
                token_program: "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA".to_string(),
                raw_amount: 10_000_000,
                decimals: 6,
                ui_amount: 10.0,
            }],
        };
        let snapshot = reconcile_funding(&balance, &HashMap::from([("USDC".to_string(), 0.01)]));
        let plan = compute_payout(
            &card(),
            &snapshot,
            SettlementKind::Claim,
            DESTINATION,
            &policy(),
        )
        .unwrap();
        assert_eq!(plan.legs[0].tax, 150_000);
        assert_eq!(plan.legs[0].net, 9_850_000);
        assert!((plan.gross_value_sol - 0.1).abs() < 1e-9);
        assert!((plan.tax_value_sol - 0.0015).abs() < 1e-9);
    }

    #[test]
    fn test_refund_payout_is_untaxed() {
        let plan = compute_payout(
            &card(),
            &sol_snapshot(LAMPORTS_PER_SOL),
            SettlementKind::Refund,
            DESTINATION,
            &LifecyclePolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.legs[0].tax, 0);
        assert_eq!(plan.legs[0].net, LAMPORTS_PER_SOL);
        assert!(plan.tax_collector.is_none());
    }

    #[test]
    fn test_empty_payout_is_no_balance() {
        let err = compute_payout(
            &card(),
            &sol_snapshot(0),
            SettlementKind::Claim,
            DESTINATION,
            &policy(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(LifecycleError::NoBalance)));
    }

    #[test]
    fn test_payout_needs_deposit_address() {
        let mut c = card();
        c.deposit_address = None;
        let err = compute_payout(
            &c,
            &sol_snapshot(10),
            SettlementKind::Claim,
            DESTINATION,
            &policy(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Lifecycle(LifecycleError::DepositAddressUnassigned)));
    }

    #[test]
    fn test_taxed_payout_without_collector_is_config_error() {
        let err = compute_payout(
            &card(),
            &sol_snapshot(LAMPORTS_PER_SOL),
            SettlementKind::Claim,
            DESTINATION,
            &LifecyclePolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_settlement_staleness() {
        let now = Utc::now();
        let p = policy();
        assert!(!is_settlement_stale(now - Duration::seconds(30), now, &p));
        assert!(is_settlement_stale(now - Duration::seconds(120), now, &p));
    }

    #[test]
    fn test_refund_retry_backoff() {
        let now = Utc::now();
        let p = policy();
        assert_eq!(next_refund_attempt_at(1, now, &p), now + Duration::seconds(300));
        assert_eq!(next_refund_attempt_at(2, now, &p), now + Duration::seconds(600));
        assert_eq!(next_refund_attempt_at(4, now, &p), now + Duration::seconds(2400));
        // Capped at a day
        assert_eq!(next_refund_attempt_at(12, now, &p), now + Duration::hours(24));
        assert_eq!(next_refund_attempt_at(u32::MAX, now, &p), now + Duration::hours(24));
    }
}
