//! PostgreSQL database client implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, Card, CardBalance, CardEvent, CardEventKind, CardMetadataUpdate, DatabaseClient,
    DatabaseError, FundingSnapshot, NewCard, PricedHolding, PublicMetrics, Settlement,
    SettlementKind,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

const CARD_COLUMNS: &str = r#"
    id, public_id, cvv, deposit_address, user_id, message, currency, amount_fiat,
    token_mint, expires_at, template_url, refund_address,
    funded, locked, claimed, refunded, token_amount, sol_amount,
    settlement_kind, settlement_destination, settlement_reserved_at, settlement_signature,
    needs_operator, refund_attempts, next_refund_at,
    hidden_by_owner, locked_at, settled_at, created_at, updated_at
"#;

/// PostgreSQL database client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_card(row: &sqlx::postgres::PgRow) -> Result<Card, AppError> {
        let id: uuid::Uuid = row.get("id");
        let settlement_kind: Option<String> = row.get("settlement_kind");
        let settlement_reserved_at: Option<DateTime<Utc>> = row.get("settlement_reserved_at");

        let settlement = match (settlement_kind, settlement_reserved_at) {
            (Some(kind), Some(reserved_at)) => Some(Settlement {
                kind: kind
                    .parse::<SettlementKind>()
                    .map_err(|e| AppError::Database(DatabaseError::Query(e)))?,
                destination: row
                    .get::<Option<String>, _>("settlement_destination")
                    .unwrap_or_default(),
                reserved_at,
                signature: row.get("settlement_signature"),
            }),
            _ => None,
        };

        Ok(Card {
            id: id.to_string(),
            public_id: row.get("public_id"),
            cvv: row.get("cvv"),
            deposit_address: row.get("deposit_address"),
            user_id: row.get("user_id"),
            message: row.get("message"),
            currency: row.get("currency"),
            amount_fiat: row.get("amount_fiat"),
            token_mint: row.get("token_mint"),
            expires_at: row.get("expires_at"),
            template_url: row.get("template_url"),
            refund_address: row.get("refund_address"),
            funded: row.get("funded"),
            locked: row.get("locked"),
            claimed: row.get("claimed"),
            refunded: row.get("refunded"),
            token_amount: row.get("token_amount"),
            sol_amount: row.get("sol_amount"),
            settlement,
            needs_operator: row.get("needs_operator"),
            refund_attempts: u32::try_from(row.get::<i32, _>("refund_attempts")).unwrap_or(0),
            next_refund_at: row.get("next_refund_at"),
            hidden_by_owner: row.get("hidden_by_owner"),
            locked_at: row.get("locked_at"),
            settled_at: row.get("settled_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_balance(row: &sqlx::postgres::PgRow) -> CardBalance {
        let lamports: i64 = row.get("lamports");
        let tokens: Json<Vec<PricedHolding>> = row.get("tokens");
        CardBalance {
            public_id: row.get("public_id"),
            deposit_address: row.get("deposit_address"),
            lamports: u64::try_from(lamports).unwrap_or(0),
            sol_native: row.get("sol_native"),
            tokens_total_value_sol: row.get("tokens_total_value_sol"),
            total_value_sol: row.get("total_value_sol"),
            token_amount: row.get("token_amount"),
            primary_mint: row.get("primary_mint"),
            tokens: tokens.0,
            synced_at: Some(row.get("synced_at")),
        }
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<CardEvent, AppError> {
        let kind: String = row.get("kind");
        Ok(CardEvent {
            public_id: row.get("public_id"),
            kind: kind
                .parse::<CardEventKind>()
                .map_err(|e| AppError::Database(DatabaseError::Query(e)))?,
            amount_sol: row.get("amount_sol"),
            currency: row.get("currency"),
            signature: row.get("signature"),
            occurred_at: row.get("occurred_at"),
        })
    }
}

fn lamports_to_i64(lamports: u64) -> i64 {
    i64::try_from(lamports).unwrap_or(i64::MAX)
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, card), fields(public_id = %card.public_id))]
    async fn insert_card(&self, card: &NewCard) -> Result<Card, AppError> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO cards (
                id, public_id, cvv, deposit_address, user_id, message, currency,
                amount_fiat, token_mint, expires_at, template_url, refund_address,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&card.public_id)
        .bind(&card.cvv)
        .bind(&card.deposit_address)
        .bind(&card.user_id)
        .bind(&card.message)
        .bind(&card.currency)
        .bind(card.amount_fiat)
        .bind(&card.token_mint)
        .bind(card.expires_at)
        .bind(&card.template_url)
        .bind(&card.refund_address)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Self::row_to_card(&row)
    }

    #[instrument(skip(self))]
    async fn get_card(&self, public_id: &str) -> Result<Option<Card>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_card).transpose()
    }

    #[instrument(skip(self))]
    async fn list_cards_for_user(&self, user_id: &str) -> Result<Vec<Card>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CARD_COLUMNS} FROM cards
            WHERE user_id = $1 AND hidden_by_owner = FALSE
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_card).collect()
    }

    #[instrument(skip(self))]
    async fn hide_card_for_user(&self, public_id: &str, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE cards SET hidden_by_owner = TRUE, updated_at = NOW()
            WHERE public_id = $1 AND user_id = $2
            "#,
        )
        .bind(public_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, update))]
    async fn update_metadata(
        &self,
        public_id: &str,
        update: &CardMetadataUpdate,
    ) -> Result<Option<Card>, AppError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE cards SET
                message = COALESCE($2, message),
                currency = COALESCE($3, currency),
                amount_fiat = COALESCE($4, amount_fiat),
                token_mint = COALESCE($5, token_mint),
                expires_at = COALESCE($6, expires_at),
                template_url = COALESCE($7, template_url),
                refund_address = COALESCE($8, refund_address),
                updated_at = NOW()
            WHERE public_id = $1 AND locked = FALSE AND claimed = FALSE AND refunded = FALSE
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(public_id)
        .bind(&update.message)
        .bind(&update.currency)
        .bind(update.amount_fiat)
        .bind(&update.token_mint)
        .bind(update.expires_at)
        .bind(&update.template_url)
        .bind(&update.refund_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        row.as_ref().map(Self::row_to_card).transpose()
    }

    #[instrument(skip(self, snapshot), fields(total_value_sol = snapshot.total_value_sol))]
    async fn apply_funding_snapshot(
        &self,
        public_id: &str,
        snapshot: &FundingSnapshot,
        synced_at: DateTime<Utc>,
    ) -> Result<Option<Card>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE cards SET
                funded = funded OR $2,
                token_amount = $3,
                sol_amount = $4,
                updated_at = $5
            WHERE public_id = $1 AND claimed = FALSE AND refunded = FALSE
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(public_id)
        .bind(snapshot.observed_funded)
        .bind(snapshot.token_amount)
        .bind(snapshot.total_value_sol)
        .bind(synced_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let card = Self::row_to_card(&row)?;

        sqlx::query(
            r#"
            INSERT INTO card_balances (
                public_id, deposit_address, lamports, sol_native, tokens_total_value_sol,
                total_value_sol, token_amount, primary_mint, tokens, synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (public_id) DO UPDATE SET
                deposit_address = EXCLUDED.deposit_address,
                lamports = EXCLUDED.lamports,
                sol_native = EXCLUDED.sol_native,
                tokens_total_value_sol = EXCLUDED.tokens_total_value_sol,
                total_value_sol = EXCLUDED.total_value_sol,
                token_amount = EXCLUDED.token_amount,
                primary_mint = EXCLUDED.primary_mint,
                tokens = EXCLUDED.tokens,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(public_id)
        .bind(&card.deposit_address)
        .bind(lamports_to_i64(snapshot.lamports))
        .bind(snapshot.sol_native)
        .bind(snapshot.tokens_total_value_sol)
        .bind(snapshot.total_value_sol)
        .bind(snapshot.token_amount)
        .bind(&snapshot.primary_mint)
        .bind(Json(&snapshot.holdings))
        .bind(synced_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(Some(card))
    }

    #[instrument(skip(self))]
    async fn get_balance_snapshot(&self, public_id: &str) -> Result<Option<CardBalance>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT public_id, deposit_address, lamports, sol_native, tokens_total_value_sol,
                   total_value_sol, token_amount, primary_mint, tokens, synced_at
            FROM card_balances
            WHERE public_id = $1
            "#,
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(row.as_ref().map(Self::row_to_balance))
    }

    #[instrument(skip(self))]
    async fn lock_card(&self, public_id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE cards SET locked = TRUE, locked_at = $2, updated_at = $2
            WHERE public_id = $1 AND locked = FALSE AND claimed = FALSE AND refunded = FALSE
            "#,
        )
        .bind(public_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reserve_settlement(
        &self,
        public_id: &str,
        kind: SettlementKind,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // Single conditional UPDATE: the row lock makes this the only decision point
        let result = sqlx::query(
            r#"
            UPDATE cards SET
                settlement_kind = $2,
                settlement_destination = $3,
                settlement_reserved_at = $4,
                settlement_signature = NULL,
                updated_at = $4
            WHERE public_id = $1
              AND claimed = FALSE
              AND refunded = FALSE
              AND settlement_reserved_at IS NULL
              AND ($2 <> 'claim' OR locked = TRUE)
            "#,
        )
        .bind(public_id)
        .bind(kind.as_str())
        .bind(destination)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn record_settlement_signature(
        &self,
        public_id: &str,
        signature: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE cards SET settlement_signature = $2, updated_at = NOW()
            WHERE public_id = $1 AND settlement_reserved_at IS NOT NULL
              AND claimed = FALSE AND refunded = FALSE
            "#,
        )
        .bind(public_id)
        .bind(signature)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Database(DatabaseError::NotFound(format!(
                "Settlement reservation for card {}",
                public_id
            ))));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_settlement(
        &self,
        public_id: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE cards SET
                claimed = (settlement_kind = 'claim'),
                refunded = (settlement_kind = 'refund'),
                settlement_signature = $2,
                settled_at = $3,
                updated_at = $3
            WHERE public_id = $1
              AND settlement_reserved_at IS NOT NULL
              AND claimed = FALSE
              AND refunded = FALSE
            "#,
        )
        .bind(public_id)
        .bind(signature)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_settlement(&self, public_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE cards SET
                settlement_kind = NULL,
                settlement_destination = NULL,
                settlement_reserved_at = NULL,
                settlement_signature = NULL,
                updated_at = NOW()
            WHERE public_id = $1 AND claimed = FALSE AND refunded = FALSE
            "#,
        )
        .bind(public_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_pending_settlements(&self, limit: i64) -> Result<Vec<Card>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CARD_COLUMNS} FROM cards
            WHERE settlement_reserved_at IS NOT NULL AND claimed = FALSE AND refunded = FALSE
            ORDER BY settlement_reserved_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_card).collect()
    }

    #[instrument(skip(self))]
    async fn list_refund_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Card>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CARD_COLUMNS} FROM cards
            WHERE expires_at IS NOT NULL AND expires_at <= $1
              AND funded = TRUE AND claimed = FALSE AND refunded = FALSE
              AND settlement_reserved_at IS NULL
              AND needs_operator = FALSE
              AND (next_refund_at IS NULL OR next_refund_at <= $1)
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_card).collect()
    }

    #[instrument(skip(self))]
    async fn flag_for_operator(&self, public_id: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE cards SET needs_operator = TRUE, updated_at = NOW() WHERE public_id = $1",
        )
            .bind(public_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn defer_refund(
        &self,
        public_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, AppError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE cards
            SET refund_attempts = refund_attempts + 1, next_refund_at = $2, updated_at = NOW()
            WHERE public_id = $1
            RETURNING refund_attempts
            "#,
        )
        .bind(public_id)
        .bind(retry_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        attempts
            .map(|n| u32::try_from(n).unwrap_or(0))
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(public_id.to_string())))
    }

    #[instrument(skip(self, event), fields(public_id = %event.public_id, kind = %event.kind))]
    async fn record_event(&self, event: &CardEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO card_events (public_id, kind, amount_sol, currency, signature, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&event.public_id)
        .bind(event.kind.as_str())
        .bind(event.amount_sol)
        .bind(&event.currency)
        .bind(&event.signature)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_recent_events(&self, limit: i64) -> Result<Vec<CardEvent>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT public_id, kind, amount_sol, currency, signature, occurred_at
            FROM card_events
            ORDER BY occurred_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn get_public_metrics(&self) -> Result<PublicMetrics, AppError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_cards,
                COUNT(*) FILTER (WHERE funded) AS funded_cards,
                COUNT(*) FILTER (WHERE locked) AS locked_cards,
                COUNT(*) FILTER (WHERE claimed) AS claimed_cards,
                COUNT(*) FILTER (WHERE refunded) AS refunded_cards,
                COALESCE(SUM(sol_amount) FILTER (WHERE funded AND NOT claimed AND NOT refunded), 0)
                    AS total_value_sol,
                COALESCE(SUM(sol_amount) FILTER (WHERE claimed), 0) AS claimed_value_sol
            FROM cards
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(PublicMetrics {
            total_cards: row.get("total_cards"),
            funded_cards: row.get("funded_cards"),
            locked_cards: row.get("locked_cards"),
            claimed_cards: row.get("claimed_cards"),
            refunded_cards: row.get("refunded_cards"),
            total_value_sol: row.get("total_value_sol"),
            claimed_value_sol: row.get("claimed_value_sol"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_lamports_conversion_saturates() {
        assert_eq!(lamports_to_i64(42), 42);
        assert_eq!(lamports_to_i64(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_card_columns_cover_settlement() {
        for column in [
            "settlement_kind",
            "settlement_destination",
            "settlement_reserved_at",
            "settlement_signature",
        ] {
            assert!(CARD_COLUMNS.contains(column));
        }
    }
}
