//! Test utilities and mock implementations.

pub mod mocks;

pub use mocks::{
    BroadcastBehavior, MOCK_EMAIL_OTP, MockAuthProvider, MockBlockchainClient, MockConfig,
    MockDatabaseClient, MockDepositProvider, MockNotifier, MockPriceOracle,
};
