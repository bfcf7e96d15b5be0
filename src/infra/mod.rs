//! Infrastructure layer implementations.

pub mod auth;
pub mod blockchain;
pub mod database;
pub mod notify;
pub mod pricing;

pub use auth::SupabaseAuthProvider;
pub use blockchain::{
    DerivedDepositCustody, RpcBlockchainClient, RpcClientConfig, UnconfiguredDeposits,
    signing_key_from_base58,
};
pub use database::{PostgresClient, PostgresConfig};
pub use notify::{LogNotifier, TelegramNotifier};
pub use pricing::CoinGeckoPriceOracle;
