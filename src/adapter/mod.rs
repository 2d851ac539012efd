//! Configuration Adapter module.
//!
//! Narrow contract over the durable configuration store: bulk reads at
//! startup, usage-column updates during flush, and opaque key/value
//! bookkeeping. No hot-path reads. Any implementation satisfying the
//! trait is acceptable; the in-memory adapter backs tests and
//! no-database deployments.

mod memory;
mod postgres;

pub use memory::MemoryAdapter;
pub use postgres::PostgresAdapter;

use crate::store::{
    Budget, Customer, ModelConfig, ProviderPolicy, RateLimit, Team, VirtualKey,
};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from the durable store.
///
/// `Deadlock` is not a failure: another node is writing the same rows and
/// owns them for this cycle; the local delta is carried to the next flush.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("write conflict: another node owns this write")]
    Deadlock,
}

impl AdapterError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, AdapterError::Deadlock)
    }
}

impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 40P01 deadlock_detected, 40001 serialization_failure
            if matches!(db_err.code().as_deref(), Some("40P01") | Some("40001")) {
                return AdapterError::Deadlock;
            }
        }
        AdapterError::Database(err)
    }
}

/// One usage write in a flush batch. Only usage columns are touched;
/// config fields are never written by the flusher, so concurrent config
/// edits are not clobbered.
#[derive(Debug, Clone)]
pub enum UsageWrite {
    Budget {
        id: String,
        current_usage: f64,
    },
    RateLimit {
        id: String,
        token_current_usage: i64,
        request_current_usage: i64,
    },
}

/// Contract between the governance core and the durable store.
#[async_trait]
pub trait ConfigAdapter: Send + Sync {
    async fn load_customers(&self) -> Result<Vec<Customer>, AdapterError>;
    async fn load_teams(&self) -> Result<Vec<Team>, AdapterError>;
    async fn load_virtual_keys(&self) -> Result<Vec<VirtualKey>, AdapterError>;
    async fn load_budgets(&self) -> Result<Vec<Budget>, AdapterError>;
    async fn load_rate_limits(&self) -> Result<Vec<RateLimit>, AdapterError>;
    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AdapterError>;
    async fn load_provider_policies(&self) -> Result<Vec<ProviderPolicy>, AdapterError>;

    /// Apply a batch of usage writes atomically.
    async fn execute_transaction(&self, writes: &[UsageWrite]) -> Result<(), AdapterError>;

    /// Direct UPDATE of one budget's usage column by primary key.
    async fn update_budget_usage(&self, id: &str, current_usage: f64)
        -> Result<(), AdapterError>;

    /// Direct UPDATE of one rate limit's usage columns by primary key.
    async fn update_rate_limit_usage(
        &self,
        id: &str,
        token_current_usage: i64,
        request_current_usage: i64,
    ) -> Result<(), AdapterError>;

    /// Persist post-sweep reset state (usage and last-reset columns).
    async fn persist_budget_resets(&self, budgets: &[Budget]) -> Result<(), AdapterError>;

    /// Persist post-sweep reset state for rate limits.
    async fn persist_rate_limit_resets(
        &self,
        limits: &[RateLimit],
    ) -> Result<(), AdapterError>;

    /// Opaque key/value bookkeeping (e.g. last pricing-sync timestamp).
    async fn get_config_value(&self, key: &str) -> Result<Option<String>, AdapterError>;
    async fn set_config_value(&self, key: &str, value: &str) -> Result<(), AdapterError>;
}
