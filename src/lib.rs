//! CryptoCards server: Solana gift cards that are created, funded, locked and
//! claimed (or refunded after expiry).
//!
//! Layers:
//! * [`domain`] - card lifecycle engine, DTOs, collaborator traits and errors
//! * [`app`] - card and account services, shared state, settlement worker
//! * [`infra`] - Postgres, Solana RPC, price feed, Telegram, Supabase auth
//! * [`api`] - axum handlers, extractors and router

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
