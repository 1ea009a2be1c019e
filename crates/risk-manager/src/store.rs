use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use trading_core::Position;

use crate::models::RiskState;

const STATE_KEY: &str = "pipeline_state";
const METRICS_KEY: &str = "agent_metrics";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("state storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

/// Everything needed to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub risk_state: RiskState,
    pub positions: Vec<Position>,
    pub saved_at: DateTime<Utc>,
}

/// Storage collaborator for risk state and open positions.
///
/// `load` returns `None` on a fresh store. Any error means the state is
/// unknown and the caller must not trade on a guess.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError>;

    async fn save(&self, state: &RiskState, positions: &[Position]) -> Result<(), StorageError>;

    /// Engine counters, kept apart from risk state so they never block a restore
    async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<(), StorageError>;

    async fn load_metrics(&self) -> Result<Option<serde_json::Value>, StorageError>;
}

/// Key/value persistence in the `agent_state` table
pub struct SqlStateStore {
    pool: sqlx::AnyPool,
}

impl SqlStateStore {
    pub fn new(pool: sqlx::AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::AnyPool {
        &self.pool
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        match self.load_value(STATE_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &RiskState, positions: &[Position]) -> Result<(), StorageError> {
        let snapshot = PersistedState {
            risk_state: state.clone(),
            positions: positions.to_vec(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string(&snapshot)?;
        self.save_value(STATE_KEY, &json).await?;

        tracing::debug!("Persisted risk state and {} positions", positions.len());
        Ok(())
    }

    async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<(), StorageError> {
        let json = serde_json::to_string(metrics)?;
        self.save_value(METRICS_KEY, &json).await
    }

    async fn load_metrics(&self) -> Result<Option<serde_json::Value>, StorageError> {
        match self.load_value(METRICS_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStateStore {
    slot: Mutex<Option<PersistedState>>,
    metrics: Mutex<Option<serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            slot: Mutex::new(Some(state)),
            metrics: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, state: &RiskState, positions: &[Position]) -> Result<(), StorageError> {
        *self.slot.lock().await = Some(PersistedState {
            risk_state: state.clone(),
            positions: positions.to_vec(),
            saved_at: Utc::now(),
        });
        Ok(())
    }

    async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<(), StorageError> {
        *self.metrics.lock().await = Some(metrics.clone());
        Ok(())
    }

    async fn load_metrics(&self) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.metrics.lock().await.clone())
    }
}
