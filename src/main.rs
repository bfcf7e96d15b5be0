//! Application entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use ed25519_dalek::SigningKey;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cryptocards_server::api::{RateLimitConfig, RouterConfig, build_router};
use cryptocards_server::app::{AppState, WorkerConfig, spawn_worker};
use cryptocards_server::domain::{DepositAddressProvider, LifecyclePolicy, Notifier};
use cryptocards_server::infra::{
    CoinGeckoPriceOracle, DerivedDepositCustody, LogNotifier, PostgresClient, PostgresConfig,
    RpcBlockchainClient, SupabaseAuthProvider, TelegramNotifier, UnconfiguredDeposits,
    signing_key_from_base58,
};

/// Application configuration
struct Config {
    database_url: String,
    blockchain_rpc_url: String,
    /// Pays transaction fees; claims and refunds are disabled without it
    fee_payer: Option<SigningKey>,
    deposit_master_seed: Option<SecretString>,
    priority_fee_micro_lamports: u64,
    price_api_url: Option<String>,
    price_api_key: Option<SecretString>,
    telegram: Option<(SecretString, String)>,
    telegram_api_url: Option<String>,
    supabase: Option<(String, SecretString)>,
    admin_api_key: Option<SecretString>,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    router_config: RouterConfig,
    worker_config: WorkerConfig,
    policy: LifecyclePolicy,
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let blockchain_rpc_url = env::var("SOLANA_RPC_URL")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());
        let fee_payer = Self::load_fee_payer()?;
        let deposit_master_seed = optional_env("DEPOSIT_MASTER_SEED").map(SecretString::from);
        let priority_fee_micro_lamports = env::var("SOLANA_PRIORITY_FEE_MICRO_LAMPORTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let price_api_url = optional_env("PRICE_API_URL");
        let price_api_key = optional_env("PRICE_API_KEY").map(SecretString::from);

        let telegram = match (
            optional_env("TELEGRAM_BOT_TOKEN"),
            optional_env("TELEGRAM_CHAT_ID"),
        ) {
            (Some(token), Some(chat_id)) => Some((SecretString::from(token), chat_id)),
            (Some(_), None) | (None, Some(_)) => {
                warn!(
                    "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set, \
                     notifications stay log-only"
                );
                None
            }
            (None, None) => None,
        };
        let telegram_api_url = optional_env("TELEGRAM_API_URL");

        let supabase = match (
            optional_env("SUPABASE_URL"),
            optional_env("SUPABASE_SERVICE_ROLE_KEY"),
        ) {
            (Some(url), Some(key)) => Some((url, SecretString::from(key))),
            _ => None,
        };
        let admin_api_key = optional_env("ADMIN_API_KEY").map(SecretString::from);

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3001);
        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            blockchain_rpc_url,
            fee_payer,
            deposit_master_seed,
            priority_fee_micro_lamports,
            price_api_url,
            price_api_key,
            telegram,
            telegram_api_url,
            supabase,
            admin_api_key,
            host,
            port,
            enable_rate_limiting,
            rate_limit_config: RateLimitConfig::from_env(),
            router_config: RouterConfig::from_env(),
            worker_config: WorkerConfig::from_env(),
            policy: LifecyclePolicy::from_env(),
        })
    }

    fn load_fee_payer() -> Result<Option<SigningKey>> {
        let Some(key_str) = optional_env("FEE_PAYER_PRIVATE_KEY") else {
            return Ok(None);
        };

        if key_str == "YOUR_BASE58_ENCODED_PRIVATE_KEY_HERE" {
            anyhow::bail!(
                "FEE_PAYER_PRIVATE_KEY is set to the placeholder value.\n\
                 Replace it with a Base58-encoded Solana private key \
                 or unset it to disable settlements."
            );
        }

        info!("Loading fee payer key from environment");
        let secret = SecretString::from(key_str);
        let key = signing_key_from_base58(&secret)
            .context("Failed to parse FEE_PAYER_PRIVATE_KEY as Base58")?;
        Ok(Some(key))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🏗️  CryptoCards server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("📦 Initializing infrastructure...");

    let postgres_client =
        PostgresClient::new(&config.database_url, PostgresConfig::default()).await?;
    postgres_client.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    let custody = match config.deposit_master_seed.clone() {
        Some(seed) => {
            let custody = Arc::new(
                DerivedDepositCustody::new(seed).context("Invalid DEPOSIT_MASTER_SEED")?,
            );
            info!("   ✓ Deposit custody configured");
            Some(custody)
        }
        None => {
            warn!("   ⚠ DEPOSIT_MASTER_SEED not set, new cards get no deposit address");
            None
        }
    };

    let mut blockchain_client = RpcBlockchainClient::with_defaults(&config.blockchain_rpc_url)?
        .with_priority_fee(config.priority_fee_micro_lamports);
    if let Some(fee_payer) = config.fee_payer.as_ref() {
        blockchain_client = blockchain_client.with_fee_payer(fee_payer)?;
    }
    if let Some(custody) = custody.as_ref() {
        blockchain_client = blockchain_client.with_custody(Arc::clone(custody));
    }
    let fee_payer_address = blockchain_client.fee_payer_address();
    match fee_payer_address.as_deref() {
        Some(address) => info!("   ✓ Blockchain client created (fee payer: {})", address),
        None => warn!("   ⚠ Blockchain client created without fee payer, claims are disabled"),
    }

    let mut policy = config.policy.clone();
    if policy.tax_collection_address.is_none() {
        if let Some(address) = fee_payer_address {
            policy = policy.with_tax_collection_address(address);
        }
    }
    info!(
        "   ✓ Lifecycle policy: tax {} bps, unfunded lock {}",
        policy.tax_bps,
        if policy.allow_unfunded_lock { "allowed" } else { "rejected" }
    );

    let price_oracle = CoinGeckoPriceOracle::new(
        config.price_api_url.clone(),
        config.price_api_key.clone(),
    )?;
    info!("   ✓ Price oracle created");

    let notifier: Arc<dyn Notifier> = match config.telegram.clone() {
        Some((token, chat_id)) => {
            info!("   ✓ Telegram notifications enabled");
            Arc::new(TelegramNotifier::new(token, chat_id, config.telegram_api_url.clone())?)
        }
        None => {
            info!("   ○ Telegram not configured (events are logged only)");
            Arc::new(LogNotifier)
        }
    };

    let deposits: Arc<dyn DepositAddressProvider> = match custody {
        Some(custody) => custody,
        None => Arc::new(UnconfiguredDeposits),
    };

    let mut app_state = AppState::new(
        Arc::new(postgres_client),
        Arc::new(blockchain_client),
        Arc::new(price_oracle),
        notifier,
        deposits,
    )
    .with_policy(policy);

    match config.supabase.clone() {
        Some((url, key)) => {
            let auth = SupabaseAuthProvider::new(&url, key)?;
            app_state = app_state.with_auth_provider(Arc::new(auth));
            info!("   ✓ Supabase auth configured");
        }
        None => info!("   ○ Supabase auth not configured (account routes answer 501)"),
    }

    match config.admin_api_key.clone() {
        Some(key) => {
            app_state = app_state.with_admin_api_key(key);
            info!("   ✓ Admin API enabled");
        }
        None => info!("   ○ Admin API disabled"),
    }

    let app_state = Arc::new(app_state);

    let worker_shutdown_tx = if config.worker_config.enabled {
        let (_worker_handle, shutdown_tx) =
            spawn_worker(Arc::clone(&app_state.service), config.worker_config.clone());
        info!(
            "   ✓ Settlement worker started (poll: {}s, refund sweep: {})",
            config.worker_config.poll_interval.as_secs(),
            config.worker_config.enable_refund_sweep
        );
        Some(shutdown_tx)
    } else {
        info!("   ○ Settlement worker disabled");
        None
    };

    let rate_limit = if config.enable_rate_limiting {
        info!(
            "   ✓ Rate limiting enabled ({} rps, burst {})",
            config.rate_limit_config.requests_per_second, config.rate_limit_config.burst_size
        );
        Some(config.rate_limit_config)
    } else {
        info!("   ○ Rate limiting disabled");
        None
    };

    let router = build_router(app_state, &config.router_config, rate_limit);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);
    info!("🗂️  Serving SPA from {}", config.router_config.static_dir.display());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tx) = worker_shutdown_tx {
        let _ = tx.send(true);
    }

    info!("Server shutdown complete");
    Ok(())
}
