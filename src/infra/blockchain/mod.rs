//! Blockchain client implementations.
//!
//! `solana` talks to the cluster over JSON-RPC and signs settlements;
//! `custody` derives the per-card deposit wallets those settlements spend from.

pub mod custody;
pub mod solana;

pub use custody::{DerivedDepositCustody, UnconfiguredDeposits};
pub use solana::{RpcBlockchainClient, RpcClientConfig, signing_key_from_base58};
