//! Deposit wallet custody.
//!
//! Every card gets its own deposit keypair derived from a master seed and
//! the card's public id, so no per-card secret is ever stored.

use ed25519_dalek::SigningKey;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use solana_sdk::signer::keypair::Keypair;

use crate::domain::{AppError, BlockchainError, ConfigError, DepositAddressProvider};

const DERIVATION_TAG: &[u8] = b"cryptocards/deposit/v1";
const MIN_SEED_LEN: usize = 32;

/// Derives deposit keypairs from a master seed
pub struct DerivedDepositCustody {
    master_seed: SecretString,
}

impl DerivedDepositCustody {
    pub fn new(master_seed: SecretString) -> Result<Self, AppError> {
        if master_seed.expose_secret().len() < MIN_SEED_LEN {
            return Err(ConfigError::InvalidValue {
                name: "DEPOSIT_MASTER_SEED".to_string(),
                message: format!("must be at least {} characters", MIN_SEED_LEN),
            }
            .into());
        }
        Ok(Self { master_seed })
    }

    fn signing_key_for(&self, public_id: &str) -> SigningKey {
        let mut hasher = Sha256::new();
        hasher.update(DERIVATION_TAG);
        hasher.update(self.master_seed.expose_secret().as_bytes());
        // Separator keeps (seed, id) pairs unambiguous
        hasher.update([0u8]);
        hasher.update(public_id.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        SigningKey::from_bytes(&seed)
    }

    /// Base58 address of the card's deposit wallet
    #[must_use]
    pub fn address_for(&self, public_id: &str) -> String {
        bs58::encode(self.signing_key_for(public_id).verifying_key().as_bytes()).into_string()
    }

    /// Full keypair, used to sign settlement transfers out of the deposit wallet
    pub fn keypair_for(&self, public_id: &str) -> Result<Keypair, AppError> {
        let signing_key = self.signing_key_for(public_id);
        Keypair::try_from(signing_key.to_keypair_bytes().as_slice()).map_err(|e| {
            AppError::Blockchain(BlockchainError::InvalidKey(format!(
                "Failed to derive deposit keypair: {}",
                e
            )))
        })
    }
}

impl DepositAddressProvider for DerivedDepositCustody {
    fn assign_deposit_address(&self, public_id: &str) -> Result<Option<String>, AppError> {
        Ok(Some(self.address_for(public_id)))
    }
}

/// Used when no master seed is configured; cards are created without a
/// deposit address.
pub struct UnconfiguredDeposits;

impl DepositAddressProvider for UnconfiguredDeposits {
    fn assign_deposit_address(&self, _public_id: &str) -> Result<Option<String>, AppError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;

    fn custody() -> DerivedDepositCustody {
        DerivedDepositCustody::new(SecretString::from(
            "correct horse battery staple correct horse",
        ))
        .unwrap()
    }

    #[test]
    fn test_short_seed_rejected() {
        let result = DerivedDepositCustody::new(SecretString::from("short"));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let custody = custody();
        assert_eq!(custody.address_for("AB12CD34"), custody.address_for("AB12CD34"));
        assert_ne!(custody.address_for("AB12CD34"), custody.address_for("AB12CD35"));
    }

    #[test]
    fn test_keypair_matches_assigned_address() {
        let custody = custody();
        let address = custody.assign_deposit_address("ZX9QWE12").unwrap().unwrap();
        let keypair = custody.keypair_for("ZX9QWE12").unwrap();
        assert_eq!(keypair.pubkey().to_string(), address);
    }

    #[test]
    fn test_different_seeds_give_different_wallets() {
        let other = DerivedDepositCustody::new(SecretString::from(
            "another seed that is long enough for custody",
        ))
        .unwrap();
        assert_ne!(custody().address_for("AB12CD34"), other.address_for("AB12CD34"));
    }

    #[test]
    fn test_unconfigured_assigns_nothing() {
        assert_eq!(UnconfiguredDeposits.assign_deposit_address("AB12CD34").unwrap(), None);
    }
}
