//! Funding reconciliation: turns a raw deposit-address balance into the
//! card's cached value snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Wrapped SOL mint, always priced at 1 SOL per token
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// One token account owned by a deposit address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TokenHolding {
    pub mint: String,
    pub token_account: String,
    pub token_program: String,
    /// Balance in the token's smallest unit
    pub raw_amount: u64,
    pub decimals: u8,
    pub ui_amount: f64,
}

/// Raw chain balance of a deposit address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DepositBalance {
    pub address: String,
    pub lamports: u64,
    pub tokens: Vec<TokenHolding>,
}

/// A token holding together with its SOL valuation, when one exists
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PricedHolding {
    #[serde(flatten)]
    pub holding: TokenHolding,
    pub price_sol: Option<f64>,
    pub value_sol: Option<f64>,
}

/// Result of reconciling a deposit balance against the price feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FundingSnapshot {
    pub lamports: u64,
    pub sol_native: f64,
    pub tokens_total_value_sol: f64,
    pub total_value_sol: f64,
    /// Primary displayed amount, in the primary asset's native unit
    pub token_amount: f64,
    /// Mint of the primary asset; `None` when SOL itself is the asset
    pub primary_mint: Option<String>,
    pub has_unpriced_tokens: bool,
    pub holdings: Vec<PricedHolding>,
    /// Whether this observation alone counts as funded
    pub observed_funded: bool,
}

impl FundingSnapshot {
    /// Positive SOL value, or a positive balance the feed could not price
    #[must_use]
    pub fn has_claimable_value(&self) -> bool {
        self.total_value_sol > 0.0 || self.has_unpriced_tokens
    }
}

#[must_use]
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Convert a raw token amount into UI units
#[must_use]
pub fn raw_to_ui(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(i32::from(decimals))
}

/// Reconcile a balance against token prices (mint -> SOL per token).
///
/// Primary asset rule: among priced tokens with a positive balance, the one
/// with the greatest SOL value wins (first enumerated on ties) and its native
/// amount is reported. Without any priced token the total SOL value is
/// reported when positive, otherwise the UI amount of the first unpriced
/// token with a positive balance.
#[must_use]
pub fn reconcile_funding(
    balance: &DepositBalance,
    prices: &HashMap<String, f64>,
) -> FundingSnapshot {
    let sol_native = lamports_to_sol(balance.lamports);

    let holdings: Vec<PricedHolding> = balance
        .tokens
        .iter()
        .map(|holding| {
            let price_sol = if holding.mint == WRAPPED_SOL_MINT {
                Some(1.0)
            } else {
                prices.get(&holding.mint).copied().filter(|p| p.is_finite() && *p >= 0.0)
            };
            PricedHolding {
                holding: holding.clone(),
                price_sol,
                value_sol: price_sol.map(|p| p * holding.ui_amount),
            }
        })
        .collect();

    let tokens_total_value_sol: f64 = holdings.iter().filter_map(|h| h.value_sol).sum();
    let total_value_sol = sol_native + tokens_total_value_sol;

    let mut best_priced: Option<&PricedHolding> = None;
    for candidate in holdings
        .iter()
        .filter(|h| h.holding.raw_amount > 0 && h.value_sol.is_some())
    {
        let better = match best_priced {
            None => true,
            Some(current) => candidate.value_sol > current.value_sol,
        };
        if better {
            best_priced = Some(candidate);
        }
    }

    let first_unpriced = holdings
        .iter()
        .find(|h| h.holding.raw_amount > 0 && h.price_sol.is_none());
    let has_unpriced_tokens = first_unpriced.is_some();

    let (token_amount, primary_mint) = if let Some(best) = best_priced {
        (best.holding.ui_amount, Some(best.holding.mint.clone()))
    } else if total_value_sol > 0.0 {
        (total_value_sol, None)
    } else if let Some(unpriced) = first_unpriced {
        (unpriced.holding.ui_amount, Some(unpriced.holding.mint.clone()))
    } else {
        (0.0, None)
    };

    FundingSnapshot {
        lamports: balance.lamports,
        sol_native,
        tokens_total_value_sol,
        total_value_sol,
        token_amount,
        primary_mint,
        has_unpriced_tokens,
        holdings,
        observed_funded: total_value_sol > 0.0 || has_unpriced_tokens,
    }
}

/// Mints held with a positive balance that need a price lookup
#[must_use]
pub fn mints_to_price(balance: &DepositBalance) -> Vec<String> {
    let mut mints: Vec<String> = balance
        .tokens
        .iter()
        .filter(|t| t.raw_amount > 0 && t.mint != WRAPPED_SOL_MINT)
        .map(|t| t.mint.clone())
        .collect();
    mints.dedup();
    mints
}
