//! The gift card entity and its credentials.

use chrono::{DateTime, Utc};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// Alphabet for public ids: upper-case alphanumerics without 0/O/1/I
pub const PUBLIC_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Derived lifecycle position of a card
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Created,
    Funded,
    Locked,
    Claimed,
    Refunded,
}

impl CardStatus {
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

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an in-flight settlement pays out for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Claim,
    Refund,
}

impl SettlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Refund => "refund",
        }
    }
}

impl std::str::FromStr for SettlementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claim" => Ok(Self::Claim),
            "refund" => Ok(Self::Refund),
            _ => Err(format!("Invalid settlement kind: {}", s)),
        }
    }
}

impl std::fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reservation held by whoever won the settlement compare-and-set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Settlement {
    pub kind: SettlementKind,
    /// Wallet receiving the net payout
    pub destination: String,
    pub reserved_at: DateTime<Utc>,
    /// Signature of the signed payout, recorded before broadcast
    pub signature: Option<String>,
}

/// Core card entity
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub id: String,
    pub public_id: String,
    pub cvv: String,
    pub deposit_address: Option<String>,
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub currency: String,
    pub amount_fiat: Option<f64>,
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_url: Option<String>,
    pub refund_address: Option<String>,
    pub funded: bool,
    pub locked: bool,
    pub claimed: bool,
    pub refunded: bool,
    pub token_amount: f64,
    pub sol_amount: f64,
    pub settlement: Option<Settlement>,
    pub needs_operator: bool,
    /// Failed sweep refunds so far
    pub refund_attempts: u32,
    /// The sweep skips the card until then
    pub next_refund_at: Option<DateTime<Utc>>,
    pub hidden_by_owner: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Build a fresh card with every status flag cleared
    #[must_use]
    pub fn from_new(id: String, new: &NewCard) -> Self {
        let now = Utc::now();
        Self {
            id,
            public_id: new.public_id.clone(),
            cvv: new.cvv.clone(),
            deposit_address: new.deposit_address.clone(),
            user_id: new.user_id.clone(),
            message: new.message.clone(),
            currency: new.currency.clone(),
            amount_fiat: new.amount_fiat,
            token_mint: new.token_mint.clone(),
            expires_at: new.expires_at,
            template_url: new.template_url.clone(),
            refund_address: new.refund_address.clone(),
            funded: false,
            locked: false,
            claimed: false,
            refunded: false,
            token_amount: 0.0,
            sol_amount: 0.0,
            settlement: None,
            needs_operator: false,
            refund_attempts: 0,
            next_refund_at: None,
            hidden_by_owner: false,
            locked_at: None,
            settled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn status(&self) -> CardStatus {
        if self.claimed {
            CardStatus::Claimed
        } else if self.refunded {
            CardStatus::Refunded
        } else if self.locked {
            CardStatus::Locked
        } else if self.funded {
            CardStatus::Funded
        } else {
            CardStatus::Created
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.claimed || self.refunded
    }

    /// A reservation exists that has not yet been completed
    #[must_use]
    pub fn has_pending_settlement(&self) -> bool {
        self.settlement.is_some() && !self.is_terminal()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Constant-time comparison of a submitted CVV against the stored one
    #[must_use]
    pub fn cvv_matches(&self, submitted: &str) -> bool {
        constant_time_eq(self.cvv.as_bytes(), submitted.as_bytes())
    }
}

/// Insert payload produced by the create operation
#[derive(Debug, Clone, PartialEq)]
pub struct NewCard {
    pub public_id: String,
    pub cvv: String,
    pub deposit_address: Option<String>,
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub currency: String,
    pub amount_fiat: Option<f64>,
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_url: Option<String>,
    pub refund_address: Option<String>,
}

/// Creator-editable fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardMetadataUpdate {
    pub message: Option<String>,
    pub currency: Option<String>,
    pub amount_fiat: Option<f64>,
    pub token_mint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub template_url: Option<String>,
    pub refund_address: Option<String>,
}

impl CardMetadataUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message.is_none()
            && self.currency.is_none()
            && self.amount_fiat.is_none()
            && self.token_mint.is_none()
            && self.expires_at.is_none()
            && self.template_url.is_none()
            && self.refund_address.is_none()
    }

    pub fn apply_to(&self, card: &mut Card) {
        if let Some(message) = &self.message {
            card.message = Some(message.clone());
        }
        if let Some(currency) = &self.currency {
            card.currency = currency.clone();
        }
        if let Some(amount) = self.amount_fiat {
            card.amount_fiat = Some(amount);
        }
        if let Some(mint) = &self.token_mint {
            card.token_mint = Some(mint.clone());
        }
        if let Some(expiry) = self.expires_at {
            card.expires_at = Some(expiry);
        }
        if let Some(url) = &self.template_url {
            card.template_url = Some(url.clone());
        }
        if let Some(address) = &self.refund_address {
            card.refund_address = Some(address.clone());
        }
    }
}

/// Generate an external card identifier from the given alphabet
pub fn generate_public_id<R: Rng + CryptoRng>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..PUBLIC_ID_ALPHABET.len());
            PUBLIC_ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Generate a numeric CVV of the given length
pub fn generate_cvv<R: Rng + CryptoRng>(rng: &mut R, length: usize) -> String {
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Mask a public id for public feeds: first two and last two characters
#[must_use]
pub fn mask_public_id(public_id: &str) -> String {
    let chars: Vec<char> = public_id.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

/// Compare two secrets without short-circuiting on the first mismatch.
/// Both sides are hashed first so the length of the stored value does not leak.
fn constant_time_eq(stored: &[u8], submitted: &[u8]) -> bool {
    let a = Sha256::digest(stored);
    let b = Sha256::digest(submitted);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
