//! Application state management.

use std::sync::Arc;

use secrecy::SecretString;

use crate::domain::{
    AuthProvider, BlockchainClient, DatabaseClient, DepositAddressProvider, LifecyclePolicy,
    Notifier, PriceOracle,
};

use super::account_service::AccountService;
use super::service::CardService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CardService>,
    pub accounts: Arc<AccountService>,
    pub db_client: Arc<dyn DatabaseClient>,
    pub blockchain_client: Arc<dyn BlockchainClient>,
    pub price_oracle: Arc<dyn PriceOracle>,
    pub notifier: Arc<dyn Notifier>,
    pub deposits: Arc<dyn DepositAddressProvider>,
    /// Identity provider; protected routes answer 501 without it
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    /// Shared secret for the admin routes (disabled when unset)
    pub admin_api_key: Option<SecretString>,
}

impl AppState {
    /// Create a new application state with the default lifecycle policy
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        blockchain_client: Arc<dyn BlockchainClient>,
        price_oracle: Arc<dyn PriceOracle>,
        notifier: Arc<dyn Notifier>,
        deposits: Arc<dyn DepositAddressProvider>,
    ) -> Self {
        let service = Arc::new(CardService::new(
            Arc::clone(&db_client),
            Arc::clone(&blockchain_client),
            Arc::clone(&price_oracle),
            Arc::clone(&notifier),
            Arc::clone(&deposits),
            LifecyclePolicy::default(),
        ));
        let accounts = Arc::new(AccountService::new(Arc::clone(&db_client), None));
        Self {
            service,
            accounts,
            db_client,
            blockchain_client,
            price_oracle,
            notifier,
            deposits,
            auth_provider: None,
            admin_api_key: None,
        }
    }

    /// Replace the lifecycle policy (builder pattern).
    /// This rebuilds the card service.
    #[must_use]
    pub fn with_policy(mut self, policy: LifecyclePolicy) -> Self {
        self.service = Arc::new(CardService::new(
            Arc::clone(&self.db_client),
            Arc::clone(&self.blockchain_client),
            Arc::clone(&self.price_oracle),
            Arc::clone(&self.notifier),
            Arc::clone(&self.deposits),
            policy,
        ));
        self
    }

    /// Add the identity provider (builder pattern)
    #[must_use]
    pub fn with_auth_provider(mut self, auth_provider: Arc<dyn AuthProvider>) -> Self {
        self.accounts = Arc::new(AccountService::new(
            Arc::clone(&self.db_client),
            Some(Arc::clone(&auth_provider)),
        ));
        self.auth_provider = Some(auth_provider);
        self
    }

    #[must_use]
    pub fn with_admin_api_key(mut self, key: SecretString) -> Self {
        self.admin_api_key = Some(key);
        self
    }
}
