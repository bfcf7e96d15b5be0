//! Blockchain RPC client implementation for Solana.
//!
//! Reads (balances, signature statuses) go through a JSON-RPC provider with
//! retries. Settlement transactions are built and signed locally with the
//! Solana SDK, then broadcast exactly once.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::SigningKey;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// Solana SDK imports (v3.0)
use solana_client::nonblocking::rpc_client::RpcClient as SolanaRpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    pubkey::Pubkey,
    signer::{Signer as SolanaSigner, keypair::Keypair},
    transaction::Transaction,
};
use solana_system_interface::instruction as system_instruction;
use spl_associated_token_account::{
    get_associated_token_address_with_program_id,
    instruction::create_associated_token_account_idempotent,
};
use spl_token_interface::instruction as token_instruction;

use crate::domain::funding::raw_to_ui;
use crate::domain::{
    AppError, BlockchainClient, BlockchainError, DepositBalance, PayoutAsset, PayoutPlan,
    SignedPayout, TokenHolding, TransactionStatus,
};

use super::custody::DerivedDepositCustody;

/// Legacy SPL Token program
pub const SPL_TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
/// Token-2022 program
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Abstract provider for Solana RPC interactions to enable testing
#[async_trait]
pub trait SolanaRpcProvider: Send + Sync {
    /// Send a JSON-RPC request
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;
}

/// HTTP-based Solana RPC provider
pub struct HttpSolanaRpcProvider {
    http_client: Client,
    rpc_url: String,
}

impl HttpSolanaRpcProvider {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Blockchain(BlockchainError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl SolanaRpcProvider for HttpSolanaRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        // Transport failures are ambiguous for sendTransaction, so they stay
        // distinguishable from node-side rejections.
        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
                } else {
                    AppError::Blockchain(BlockchainError::Connection(e.to_string()))
                }
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
            } else {
                AppError::Blockchain(BlockchainError::Connection(e.to_string()))
            }
        })?;

        parse_rpc_body(status, &body)
    }
}

/// Only a decoded JSON-RPC `error` object is a definite rejection. Proxy
/// errors and undecodable bodies say nothing about whether the node acted on
/// the request.
fn parse_rpc_body(status: StatusCode, body: &[u8]) -> Result<serde_json::Value, AppError> {
    let decoded = serde_json::from_slice::<JsonRpcResponse<serde_json::Value>>(body);

    match decoded {
        Ok(JsonRpcResponse {
            error: Some(error), ..
        }) => Err(map_json_rpc_error(&error)),
        Ok(JsonRpcResponse {
            result: Some(result),
            ..
        }) if status.is_success() => Ok(result),
        Ok(_) if status.is_success() => Err(AppError::Blockchain(BlockchainError::Connection(
            "Empty JSON-RPC response".to_string(),
        ))),
        Ok(_) => Err(AppError::Blockchain(BlockchainError::Connection(format!(
            "HTTP {} from RPC endpoint",
            status
        )))),
        Err(e) if status.is_success() => Err(AppError::Blockchain(BlockchainError::Connection(
            format!("Undecodable RPC response: {}", e),
        ))),
        Err(_) => Err(AppError::Blockchain(BlockchainError::Connection(format!(
            "HTTP {} from RPC endpoint",
            status
        )))),
    }
}

/// Map a JSON-RPC error object to a blockchain error
fn map_json_rpc_error(error: &JsonRpcError) -> AppError {
    let lowered = error.message.to_lowercase();
    if lowered.contains("insufficient") {
        return AppError::Blockchain(BlockchainError::InsufficientFunds);
    }
    // -32002: preflight simulation rejected the transaction
    if error.code == -32002 {
        return AppError::Blockchain(BlockchainError::TransactionFailed(error.message.clone()));
    }
    AppError::Blockchain(BlockchainError::RpcError(format!(
        "{}: {}",
        error.code, error.message
    )))
}

/// Solana RPC blockchain client
pub struct RpcBlockchainClient {
    provider: Box<dyn SolanaRpcProvider>,
    config: RpcClientConfig,
    /// Solana SDK RPC client for SDK-based operations
    sdk_client: Option<SolanaRpcClient>,
    /// Pays transaction and ATA rent fees; settlements are disabled without it
    fee_payer: Option<Keypair>,
    custody: Option<Arc<DerivedDepositCustody>>,
    /// Compute unit price in micro-lamports, 0 disables the instruction
    priority_fee: u64,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockhashResponse {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
struct BlockhashResult {
    value: BlockhashResponse,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct TokenAccountsResult {
    value: Vec<KeyedTokenAccount>,
}

#[derive(Debug, Deserialize)]
struct KeyedTokenAccount {
    pubkey: String,
    account: ParsedTokenAccount,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenAccount {
    owner: String,
    data: ParsedTokenData,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenData {
    parsed: ParsedTokenInfo,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenInfo {
    info: TokenAccountInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenAccountInfo {
    mint: String,
    token_amount: UiTokenAmount,
}

#[derive(Debug, Deserialize)]
struct UiTokenAmount {
    amount: String,
    decimals: u8,
}

#[derive(Debug, Deserialize)]
struct SignatureStatus {
    err: Option<serde_json::Value>,
    #[serde(rename = "confirmationStatus")]
    confirmation_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignatureStatusResult {
    value: Vec<Option<SignatureStatus>>,
}

impl SignatureStatus {
    fn to_transaction_status(&self) -> TransactionStatus {
        if let Some(err) = &self.err {
            return TransactionStatus::Failed(err.to_string());
        }
        match self.confirmation_status.as_deref() {
            Some("confirmed") | Some("finalized") => TransactionStatus::Confirmed,
            _ => TransactionStatus::Pending,
        }
    }
}

fn parse_pubkey(value: &str, what: &str) -> Result<Pubkey, AppError> {
    value.parse::<Pubkey>().map_err(|e| {
        AppError::Blockchain(BlockchainError::InvalidAddress(format!(
            "Invalid {} address {}: {}",
            what, value, e
        )))
    })
}

impl RpcBlockchainClient {
    /// Create a read-only RPC blockchain client with custom configuration
    pub fn new(rpc_url: &str, config: RpcClientConfig) -> Result<Self, AppError> {
        let provider = HttpSolanaRpcProvider::new(rpc_url, config.timeout)?;

        // Create Solana SDK RPC client
        let sdk_client = SolanaRpcClient::new_with_timeout_and_commitment(
            rpc_url.to_string(),
            config.timeout,
            CommitmentConfig::confirmed(),
        );

        info!(rpc_url = %rpc_url, "Created blockchain client with SDK support");
        Ok(Self {
            provider: Box::new(provider),
            config,
            sdk_client: Some(sdk_client),
            fee_payer: None,
            custody: None,
            priority_fee: 0,
        })
    }

    /// Create a new RPC blockchain client with default configuration
    pub fn with_defaults(rpc_url: &str) -> Result<Self, AppError> {
        Self::new(rpc_url, RpcClientConfig::default())
    }

    /// Create a new client with a specific provider (useful for testing)
    pub fn with_provider(provider: Box<dyn SolanaRpcProvider>, config: RpcClientConfig) -> Self {
        Self {
            provider,
            config,
            sdk_client: None,
            fee_payer: None,
            custody: None,
            priority_fee: 0,
        }
    }

    /// Enable settlements with the given fee payer key (builder pattern)
    pub fn with_fee_payer(mut self, signing_key: &SigningKey) -> Result<Self, AppError> {
        // Create Solana SDK keypair from ed25519-dalek signing key
        let keypair_bytes = signing_key.to_keypair_bytes();
        let keypair = Keypair::try_from(keypair_bytes.as_slice()).map_err(|e| {
            AppError::Blockchain(BlockchainError::InvalidKey(format!(
                "Failed to create keypair: {}",
                e
            )))
        })?;
        info!(fee_payer = %keypair.pubkey(), "Settlement signing enabled");
        self.fee_payer = Some(keypair);
        Ok(self)
    }

    #[must_use]
    pub fn with_custody(mut self, custody: Arc<DerivedDepositCustody>) -> Self {
        self.custody = Some(custody);
        self
    }

    #[must_use]
    pub fn with_priority_fee(mut self, micro_lamports: u64) -> Self {
        self.priority_fee = micro_lamports;
        self
    }

    /// Base58 address of the fee payer, when configured
    #[must_use]
    pub fn fee_payer_address(&self) -> Option<String> {
        self.fee_payer.as_ref().map(|kp| kp.pubkey().to_string())
    }

    /// Make an RPC call with retries
    #[instrument(skip(self, params))]
    async fn rpc_call<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, AppError> {
        // Serialize parameters to JSON Value
        let params_value = serde_json::to_value(params).map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Serialization error: {}",
                e
            )))
        })?;

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self
                .provider
                .send_request(method, params_value.clone())
                .await
            {
                Ok(result_value) => {
                    // Deserialize result from JSON Value
                    return serde_json::from_value(result_value).map_err(|e| {
                        AppError::Blockchain(BlockchainError::RpcError(format!(
                            "Deserialization error: {}",
                            e
                        )))
                    });
                }
                Err(e) => {
                    warn!(attempt = attempt, error = ?e, method = %method, "RPC call failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Blockchain(BlockchainError::RpcError("Unknown error".to_string()))
        }))
    }

    async fn latest_blockhash(&self) -> Result<Hash, AppError> {
        if let Some(sdk_client) = &self.sdk_client {
            return sdk_client
                .get_latest_blockhash()
                .await
                .map_err(map_solana_client_error);
        }
        let result: BlockhashResult = self
            .rpc_call(
                "getLatestBlockhash",
                serde_json::json!([{"commitment": "confirmed"}]),
            )
            .await?;
        result.value.blockhash.parse::<Hash>().map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Invalid blockhash {}: {}",
                result.value.blockhash, e
            )))
        })
    }

    async fn token_holdings(
        &self,
        owner: &str,
        program_id: &str,
    ) -> Result<Vec<TokenHolding>, AppError> {
        let params = serde_json::json!([
            owner,
            {"programId": program_id},
            {"encoding": "jsonParsed", "commitment": "confirmed"}
        ]);
        let result: TokenAccountsResult = self.rpc_call("getTokenAccountsByOwner", params).await?;

        let mut holdings = Vec::with_capacity(result.value.len());
        for keyed in result.value {
            let info = keyed.account.data.parsed.info;
            let raw_amount = info.token_amount.amount.parse::<u64>().map_err(|e| {
                AppError::Blockchain(BlockchainError::RpcError(format!(
                    "Invalid token amount for {}: {}",
                    keyed.pubkey, e
                )))
            })?;
            if raw_amount == 0 {
                continue;
            }
            let decimals = info.token_amount.decimals;
            holdings.push(TokenHolding {
                mint: info.mint,
                token_account: keyed.pubkey,
                token_program: keyed.account.owner,
                raw_amount,
                decimals,
                ui_amount: raw_to_ui(raw_amount, decimals),
            });
        }
        Ok(holdings)
    }

    /// Build the instruction list for a payout plan
    fn payout_instructions(
        &self,
        plan: &PayoutPlan,
        fee_payer: &Pubkey,
        source: &Pubkey,
    ) -> Result<Vec<Instruction>, AppError> {
        let destination = parse_pubkey(&plan.destination, "destination")?;
        let collector = plan
            .tax_collector
            .as_deref()
            .map(|address| parse_pubkey(address, "tax collector"))
            .transpose()?;
        let missing_collector = || {
            AppError::Blockchain(BlockchainError::InvalidAddress(
                "Payout carries tax but no tax collector address".to_string(),
            ))
        };

        let mut instructions: Vec<Instruction> = Vec::new();
        if self.priority_fee > 0 {
            instructions.push(ComputeBudgetInstruction::set_compute_unit_price(
                self.priority_fee,
            ));
        }
        let preamble = instructions.len();

        for leg in &plan.legs {
            match &leg.asset {
                PayoutAsset::Native => {
                    if leg.net > 0 {
                        instructions.push(system_instruction::transfer(
                            source,
                            &destination,
                            leg.net,
                        ));
                    }
                    if leg.tax > 0 {
                        let collector = collector.ok_or_else(missing_collector)?;
                        instructions.push(system_instruction::transfer(
                            source, &collector, leg.tax,
                        ));
                    }
                }
                PayoutAsset::Token {
                    mint,
                    token_account,
                    token_program,
                    decimals,
                } => {
                    let mint = parse_pubkey(mint, "mint")?;
                    let token_account = parse_pubkey(token_account, "token account")?;
                    let token_program = parse_pubkey(token_program, "token program")?;

                    for (owner, amount) in [(Some(destination), leg.net), (collector, leg.tax)] {
                        if amount == 0 {
                            continue;
                        }
                        let owner = owner.ok_or_else(missing_collector)?;
                        let recipient_ata = get_associated_token_address_with_program_id(
                            &owner,
                            &mint,
                            &token_program,
                        );
                        // Idempotent: a no-op when the recipient already has the account
                        instructions.push(create_associated_token_account_idempotent(
                            fee_payer,
                            &owner,
                            &mint,
                            &token_program,
                        ));
                        let transfer_ix = token_instruction::transfer_checked(
                            &token_program,
                            &token_account,
                            &mint,
                            &recipient_ata,
                            source,
                            &[],
                            amount,
                            *decimals,
                        )
                        .map_err(|e| {
                            AppError::Blockchain(BlockchainError::TransactionFailed(format!(
                                "Failed to create transfer_checked instruction: {}",
                                e
                            )))
                        })?;
                        instructions.push(transfer_ix);
                    }
                }
            }
        }

        if instructions.len() == preamble {
            return Err(AppError::Blockchain(BlockchainError::TransactionFailed(
                "Payout plan moves no funds".to_string(),
            )));
        }
        Ok(instructions)
    }
}

#[async_trait]
impl BlockchainClient for RpcBlockchainClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let _: u64 = self.rpc_call("getSlot", Vec::<()>::new()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_deposit_balance(&self, address: &str) -> Result<DepositBalance, AppError> {
        parse_pubkey(address, "deposit")?;

        let balance: BalanceResult = self
            .rpc_call(
                "getBalance",
                serde_json::json!([address, {"commitment": "confirmed"}]),
            )
            .await?;

        let mut tokens = self.token_holdings(address, SPL_TOKEN_PROGRAM_ID).await?;
        tokens.extend(self.token_holdings(address, TOKEN_2022_PROGRAM_ID).await?);

        debug!(
            address = %address,
            lamports = balance.value,
            token_accounts = tokens.len(),
            "Fetched deposit balance"
        );
        Ok(DepositBalance {
            address: address.to_string(),
            lamports: balance.value,
            tokens,
        })
    }

    #[instrument(skip(self, plan), fields(public_id = %plan.public_id, kind = %plan.kind))]
    async fn prepare_payout(&self, plan: &PayoutPlan) -> Result<SignedPayout, AppError> {
        let (fee_payer, custody) = match (&self.fee_payer, &self.custody) {
            (Some(fee_payer), Some(custody)) => (fee_payer, custody),
            _ => {
                return Err(AppError::NotSupported(
                    "Settlement signing is not configured".to_string(),
                ));
            }
        };

        let deposit = custody.keypair_for(&plan.public_id)?;
        if deposit.pubkey().to_string() != plan.source_address {
            return Err(AppError::Blockchain(BlockchainError::InvalidKey(format!(
                "Derived deposit key does not control {}",
                plan.source_address
            ))));
        }

        let instructions = self.payout_instructions(plan, &fee_payer.pubkey(), &deposit.pubkey())?;
        let recent_blockhash = self.latest_blockhash().await?;

        // Build and sign transaction; the deposit wallet authorizes the transfers
        let transaction = Transaction::new_signed_with_payer(
            &instructions,
            Some(&fee_payer.pubkey()),
            &[fee_payer, &deposit],
            recent_blockhash,
        );

        let signature = transaction
            .signatures
            .first()
            .map(ToString::to_string)
            .ok_or_else(|| {
                AppError::Blockchain(BlockchainError::TransactionFailed(
                    "Transaction has no signature".to_string(),
                ))
            })?;
        let wire = bincode::serialize(&transaction)
            .map_err(|e| AppError::Internal(format!("Failed to serialize transaction: {}", e)))?;

        info!(
            signature = %signature,
            destination = %plan.destination,
            legs = plan.legs.len(),
            "Signed settlement transaction"
        );
        Ok(SignedPayout {
            signature,
            wire_transaction: BASE64_STANDARD.encode(wire),
        })
    }

    /// Single attempt; a retry could land a second transfer if the first
    /// one is only slow.
    #[instrument(skip(self, payout), fields(signature = %payout.signature))]
    async fn broadcast_payout(&self, payout: &SignedPayout) -> Result<String, AppError> {
        let params = serde_json::json!([
            payout.wire_transaction,
            {
                "encoding": "base64",
                "skipPreflight": false,
                "preflightCommitment": "confirmed"
            }
        ]);
        let result = self.provider.send_request("sendTransaction", params).await?;

        match result.as_str() {
            Some(returned) if returned != payout.signature => {
                warn!(returned = %returned, "Node returned an unexpected signature");
            }
            Some(_) => {}
            None => debug!("sendTransaction returned a non-string result"),
        }
        Ok(payout.signature.clone())
    }

    #[instrument(skip(self))]
    async fn get_transaction_status(&self, signature: &str) -> Result<TransactionStatus, AppError> {
        let params = serde_json::json!([[signature], {"searchTransactionHistory": true}]);
        let result: SignatureStatusResult = self.rpc_call("getSignatureStatuses", params).await?;

        Ok(match result.value.first() {
            Some(Some(status)) => status.to_transaction_status(),
            _ => TransactionStatus::NotFound,
        })
    }
}

/// Map Solana client errors to our AppError types
fn map_solana_client_error(err: solana_client::client_error::ClientError) -> AppError {
    use solana_client::client_error::ClientErrorKind;

    let msg = err.to_string();

    match err.kind() {
        ClientErrorKind::RpcError(_) => {
            if msg.contains("insufficient") || msg.contains("InsufficientFunds") {
                AppError::Blockchain(BlockchainError::InsufficientFunds)
            } else {
                AppError::Blockchain(BlockchainError::RpcError(msg))
            }
        }
        ClientErrorKind::Io(_) => AppError::Blockchain(BlockchainError::Connection(msg)),
        ClientErrorKind::Reqwest(_) => {
            if msg.contains("timeout") || msg.contains("timed out") {
                AppError::Blockchain(BlockchainError::Timeout(msg))
            } else {
                AppError::Blockchain(BlockchainError::Connection(msg))
            }
        }
        _ => AppError::Blockchain(BlockchainError::RpcError(msg)),
    }
}

/// Parse a base58-encoded private key into a SigningKey
pub fn signing_key_from_base58(secret: &SecretString) -> Result<SigningKey, AppError> {
    let key_bytes = bs58::decode(secret.expose_secret())
        .into_vec()
        .map_err(|e| AppError::Blockchain(BlockchainError::InvalidKey(e.to_string())))?;

    // Handle both 32-byte (seed) and 64-byte (keypair) formats
    let key_array: [u8; 32] = match key_bytes.len() {
        64 => key_bytes[..32].try_into().map_err(|_| {
            AppError::Blockchain(BlockchainError::InvalidKey(
                "Invalid keypair format".to_string(),
            ))
        })?,
        32 => key_bytes.try_into().map_err(|v: Vec<u8>| {
            AppError::Blockchain(BlockchainError::InvalidKey(format!(
                "Key must be 32 bytes, got {}",
                v.len()
            )))
        })?,
        len => {
            return Err(AppError::Blockchain(BlockchainError::InvalidKey(format!(
                "Key must be 32 or 64 bytes, got {}",
                len
            ))));
        }
    };

    Ok(SigningKey::from_bytes(&key_array))
}
