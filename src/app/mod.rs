//! Application layer containing business logic and shared state.

pub mod account_service;
pub mod service;
pub mod state;
pub mod worker;

pub use account_service::AccountService;
pub use service::CardService;
pub use state::AppState;
pub use worker::{SettlementWorker, WorkerConfig, spawn_worker};
