//! Error types for the application.

use thiserror::Error;

use super::lifecycle::LifecycleError;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Illegal card state transition
    #[error("{0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl AppError {
    /// Convenience constructor for a missing card
    pub fn card_not_found(public_id: &str) -> Self {
        AppError::Database(DatabaseError::NotFound(format!("Card {}", public_id)))
    }

    /// Whether a caller may retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Blockchain(e) => matches!(
                e,
                BlockchainError::Connection(_)
                    | BlockchainError::Timeout(_)
                    | BlockchainError::RpcError(_)
            ),
            AppError::ExternalService(e) => matches!(
                e,
                ExternalServiceError::Network(_)
                    | ExternalServiceError::Timeout(_)
                    | ExternalServiceError::Unavailable(_)
                    | ExternalServiceError::RateLimited(_)
            ),
            AppError::Database(DatabaseError::Connection(_)) => true,
            AppError::Lifecycle(LifecycleError::SettlementInProgress) => true,
            AppError::RateLimited => true,
            _ => false,
        }
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseError::Duplicate(db_err.message().to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Chain interaction errors
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl BlockchainError {
    /// True when a broadcast may or may not have reached the cluster
    #[must_use]
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            BlockchainError::Connection(_) | BlockchainError::Timeout(_)
        )
    }
}

/// Errors from HTTP collaborators (price feed, notifier, auth)
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error ({status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Service misconfigured: {0}")]
    Configuration(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),
}

impl From<reqwest::Error> for ExternalServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExternalServiceError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExternalServiceError::ParseError(err.to_string())
        } else {
            ExternalServiceError::Network(err.to_string())
        }
    }
}

/// Startup configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Input validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Multiple(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_not_found_message() {
        let err = AppError::card_not_found("ABCD2345");
        assert!(matches!(err, AppError::Database(DatabaseError::NotFound(_))));
        assert!(err.to_string().contains("ABCD2345"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Blockchain(BlockchainError::Timeout("t".into())).is_retryable());
        assert!(
            AppError::ExternalService(ExternalServiceError::Unavailable("x".into()))
                .is_retryable()
        );
        assert!(!AppError::Lifecycle(LifecycleError::AlreadyClaimed).is_retryable());
        let missing = AppError::Validation(ValidationError::MissingField("currency".into()));
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_unknown_outcome_only_for_transport_failures() {
        assert!(BlockchainError::Timeout("slow".into()).is_outcome_unknown());
        assert!(BlockchainError::Connection("reset".into()).is_outcome_unknown());
        assert!(
            !BlockchainError::RpcError("-32002: simulation failed".into()).is_outcome_unknown()
        );
        assert!(!BlockchainError::InsufficientFunds.is_outcome_unknown());
    }

    #[test]
    fn test_lifecycle_error_display_is_client_facing() {
        let err: AppError = LifecycleError::NotLocked.into();
        assert_eq!(err.to_string(), "Card is not locked and cannot be claimed yet");
    }
}
