//! Price feed implementations.

pub mod coingecko;

pub use coingecko::{CoinGeckoPriceOracle, DEFAULT_PRICE_API_URL};
