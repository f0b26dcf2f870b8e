use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info, instrument};

use super::state_store::{version_conflict, StateStore};
use crate::domain::ExecutionState;
use crate::error::Result;

/// PostgreSQL-backed execution state
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::LpFlowError::Database(e.into()))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn stored_version(&self, key: &str) -> Result<Option<i64>> {
        let row =
            sqlx::query("SELECT version FROM wallet_execution_state WHERE wallet_address = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.get::<i64, _>("version")))
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn load(&self, key: &str) -> Result<Option<ExecutionState>> {
        let row =
            sqlx::query("SELECT payload FROM wallet_execution_state WHERE wallet_address = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => {
                let Json(state): Json<ExecutionState> = row.try_get("payload")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, state),
        fields(wallet = %state.wallet_address, version = state.version)
    )]
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let result = if state.version == 1 {
            sqlx::query(
                r#"
                INSERT INTO wallet_execution_state
                    (wallet_address, derivation_index, step, payload, version,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (wallet_address) DO NOTHING
                "#,
            )
            .bind(&state.wallet_address)
            .bind(state.derivation_index as i32)
            .bind(state.step.as_str())
            .bind(Json(state))
            .bind(state.version)
            .bind(state.created_at)
            .bind(state.updated_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE wallet_execution_state
                SET step = $2, payload = $3, version = $4, updated_at = $5
                WHERE wallet_address = $1 AND version = $6
                "#,
            )
            .bind(&state.wallet_address)
            .bind(state.step.as_str())
            .bind(Json(state))
            .bind(state.version)
            .bind(state.updated_at)
            .bind(state.version - 1)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            let found = self.stored_version(&state.wallet_address).await?;
            return Err(version_conflict(&state.wallet_address, state.version - 1, found));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM wallet_execution_state WHERE wallet_address = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let rows =
            sqlx::query("SELECT payload FROM wallet_execution_state ORDER BY derivation_index")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| {
                let Json(state): Json<ExecutionState> = row.try_get("payload")?;
                Ok(state)
            })
            .collect()
    }
}
