//! CoinGecko price oracle.
//!
//! SOL/USD comes from `/simple/price`, SPL token prices (quoted in SOL) from
//! `/simple/token_price/solana`. Both are cached briefly so that funding
//! syncs on a busy storefront do not hammer the public API.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error, instrument};

use crate::domain::{AppError, ExternalServiceError, PriceOracle};

/// Default CoinGecko API base URL
pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3";

const SOL_USD_KEY: &str = "sol_usd";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    solana: Option<UsdQuote>,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SolQuote {
    sol: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    value: f64,
    fetched_at: Instant,
}

/// Price oracle backed by the CoinGecko simple price API
pub struct CoinGeckoPriceOracle {
    http_client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    cache: DashMap<String, CachedPrice>,
    cache_ttl: Duration,
}

impl CoinGeckoPriceOracle {
    /// Create a new oracle
    ///
    /// # Arguments
    /// * `base_url` - Optional API base URL. Defaults to the public CoinGecko API.
    /// * `api_key` - Optional demo API key, sent as `x-cg-demo-api-key`.
    pub fn new(base_url: Option<String>, api_key: Option<SecretString>) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExternalServiceError::Configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_PRICE_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            cache: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
        })
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn cached(&self, key: &str) -> Option<f64> {
        self.cache
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.value)
    }

    fn store(&self, key: &str, value: f64) {
        self.cache.insert(
            key.to_string(),
            CachedPrice {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling price API");

        let mut request = self.http_client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(ExternalServiceError::from)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(
                ExternalServiceError::RateLimited("Price API rate limit hit".to_string()).into(),
            );
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Price API returned error");
            return Err(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }
            .into());
        }

        response.json::<T>().await.map_err(|e| {
            error!(error = %e, "Failed to parse price API response");
            ExternalServiceError::ParseError(e.to_string()).into()
        })
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoPriceOracle {
    #[instrument(skip(self))]
    async fn sol_usd(&self) -> Result<f64, AppError> {
        if let Some(price) = self.cached(SOL_USD_KEY) {
            return Ok(price);
        }

        let response: SimplePriceResponse = self
            .get_json("/simple/price", &[("ids", "solana"), ("vs_currencies", "usd")])
            .await?;
        let price = response
            .solana
            .and_then(|quote| quote.usd)
            .filter(|price| price.is_finite() && *price > 0.0)
            .ok_or_else(|| {
                ExternalServiceError::ParseError("SOL price missing from response".to_string())
            })?;

        self.store(SOL_USD_KEY, price);
        Ok(price)
    }

    #[instrument(skip(self, mints), fields(mints = mints.len()))]
    async fn token_prices_in_sol(
        &self,
        mints: &[String],
    ) -> Result<HashMap<String, f64>, AppError> {
        let mut prices = HashMap::new();
        let mut missing = Vec::new();
        for mint in mints {
            match self.cached(mint) {
                Some(price) => {
                    prices.insert(mint.clone(), price);
                }
                None => missing.push(mint.as_str()),
            }
        }
        if missing.is_empty() {
            return Ok(prices);
        }

        let addresses = missing.join(",");
        let response: HashMap<String, SolQuote> = self
            .get_json(
                "/simple/token_price/solana",
                &[("contract_addresses", addresses.as_str()), ("vs_currencies", "sol")],
            )
            .await?;

        // The API may echo addresses in a different case
        let by_lowercase: HashMap<String, f64> = response
            .into_iter()
            .filter_map(|(address, quote)| quote.sol.map(|price| (address.to_lowercase(), price)))
            .filter(|(_, price)| price.is_finite() && *price > 0.0)
            .collect();

        for mint in missing {
            if let Some(price) = by_lowercase.get(&mint.to_lowercase()) {
                self.store(mint, *price);
                prices.insert(mint.to_string(), *price);
            }
        }
        debug!(priced = prices.len(), requested = mints.len(), "Token prices resolved");
        Ok(prices)
    }
}
