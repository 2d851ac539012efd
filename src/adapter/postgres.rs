//! PostgreSQL implementation of the configuration adapter.
//!
//! Runtime sqlx queries against the logical schema. All usage writes are
//! direct UPDATEs of the usage/reset columns by primary key, never
//! wholesale entity saves, so concurrent config edits survive flushes.

use super::{AdapterError, ConfigAdapter, UsageWrite};
use crate::store::{
    Budget, Customer, ModelConfig, ProviderConfig, ProviderPolicy, RateLimit, Team, VirtualKey,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;

/// Adapter backed by a PostgreSQL pool.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect and verify the pool.
    pub async fn connect(database_url: &str) -> Result<Self, AdapterError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BudgetRow {
    id: String,
    max_limit: f64,
    current_usage: f64,
    reset_duration: String,
    last_reset: DateTime<Utc>,
}

impl From<BudgetRow> for Budget {
    fn from(row: BudgetRow) -> Self {
        Budget {
            id: row.id,
            max_limit: row.max_limit,
            current_usage: row.current_usage,
            reset_duration: row.reset_duration,
            last_reset: row.last_reset,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RateLimitRow {
    id: String,
    token_max_limit: Option<i64>,
    token_current_usage: i64,
    token_reset_duration: Option<String>,
    token_last_reset: DateTime<Utc>,
    request_max_limit: Option<i64>,
    request_current_usage: i64,
    request_reset_duration: Option<String>,
    request_last_reset: DateTime<Utc>,
}

impl From<RateLimitRow> for RateLimit {
    fn from(row: RateLimitRow) -> Self {
        RateLimit {
            id: row.id,
            token_max_limit: row.token_max_limit,
            token_current_usage: row.token_current_usage,
            token_reset_duration: row.token_reset_duration,
            token_last_reset: row.token_last_reset,
            request_max_limit: row.request_max_limit,
            request_current_usage: row.request_current_usage,
            request_reset_duration: row.request_reset_duration,
            request_last_reset: row.request_last_reset,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VirtualKeyRow {
    id: String,
    value: String,
    name: String,
    is_active: bool,
    budget_id: Option<String>,
    rate_limit_id: Option<String>,
    team_id: Option<String>,
    customer_id: Option<String>,
    mcp_include_tools: Option<Json<HashMap<String, Vec<String>>>>,
}

#[derive(sqlx::FromRow)]
struct ProviderConfigRow {
    id: String,
    vk_id: String,
    provider: String,
    allowed_models: Option<Json<Vec<String>>>,
    weight: f64,
    budget_id: Option<String>,
    rate_limit_id: Option<String>,
    credential_ids: Option<Json<Vec<String>>>,
}

#[derive(sqlx::FromRow)]
struct TeamRow {
    id: String,
    name: String,
    budget_id: Option<String>,
    customer_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: String,
    name: String,
    budget_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    name: String,
    budget_id: Option<String>,
    rate_limit_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ModelConfigRow {
    id: String,
    model_name: String,
    provider: Option<String>,
    budget_id: Option<String>,
    rate_limit_id: Option<String>,
}

#[async_trait]
impl ConfigAdapter for PostgresAdapter {
    async fn load_customers(&self) -> Result<Vec<Customer>, AdapterError> {
        let rows = sqlx::query_as::<_, CustomerRow>(
            "SELECT id, name, budget_id FROM customers",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Customer {
                id: r.id,
                name: r.name,
                budget_id: r.budget_id,
            })
            .collect())
    }

    async fn load_teams(&self) -> Result<Vec<Team>, AdapterError> {
        let rows = sqlx::query_as::<_, TeamRow>(
            "SELECT id, name, budget_id, customer_id FROM teams",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Team {
                id: r.id,
                name: r.name,
                budget_id: r.budget_id,
                customer_id: r.customer_id,
            })
            .collect())
    }

    async fn load_virtual_keys(&self) -> Result<Vec<VirtualKey>, AdapterError> {
        let key_rows = sqlx::query_as::<_, VirtualKeyRow>(
            "SELECT id, value, name, is_active, budget_id, rate_limit_id, \
             team_id, customer_id, mcp_include_tools \
             FROM virtual_keys",
        )
        .fetch_all(&self.pool)
        .await?;

        let config_rows = sqlx::query_as::<_, ProviderConfigRow>(
            "SELECT id, vk_id, provider, allowed_models, weight::float8 AS weight, \
             budget_id, rate_limit_id, credential_ids \
             FROM vk_provider_configs ORDER BY vk_id, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut configs_by_vk: HashMap<String, Vec<ProviderConfig>> = HashMap::new();
        for row in config_rows {
            configs_by_vk
                .entry(row.vk_id.clone())
                .or_default()
                .push(ProviderConfig {
                    id: row.id,
                    provider: row.provider,
                    allowed_models: row.allowed_models.map(|j| j.0).unwrap_or_default(),
                    weight: row.weight,
                    budget_id: row.budget_id,
                    rate_limit_id: row.rate_limit_id,
                    credential_ids: row.credential_ids.map(|j| j.0).unwrap_or_default(),
                });
        }

        Ok(key_rows
            .into_iter()
            .map(|r| {
                let provider_configs = configs_by_vk.remove(&r.id).unwrap_or_default();
                VirtualKey {
                    provider_configs,
                    mcp_include_tools: r.mcp_include_tools.map(|j| j.0).unwrap_or_default(),
                    id: r.id,
                    value: r.value,
                    name: r.name,
                    is_active: r.is_active,
                    budget_id: r.budget_id,
                    rate_limit_id: r.rate_limit_id,
                    team_id: r.team_id,
                    customer_id: r.customer_id,
                }
            })
            .collect())
    }

    async fn load_budgets(&self) -> Result<Vec<Budget>, AdapterError> {
        let rows = sqlx::query_as::<_, BudgetRow>(
            "SELECT id, max_limit::float8 AS max_limit, \
             current_usage::float8 AS current_usage, reset_duration, last_reset \
             FROM budgets",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Budget::from).collect())
    }

    async fn load_rate_limits(&self) -> Result<Vec<RateLimit>, AdapterError> {
        let rows = sqlx::query_as::<_, RateLimitRow>(
            "SELECT id, token_max_limit, token_current_usage, token_reset_duration, \
             token_last_reset, request_max_limit, request_current_usage, \
             request_reset_duration, request_last_reset \
             FROM rate_limits",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RateLimit::from).collect())
    }

    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AdapterError> {
        let rows = sqlx::query_as::<_, ModelConfigRow>(
            "SELECT id, model_name, provider, budget_id, rate_limit_id FROM model_configs",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ModelConfig {
                id: r.id,
                model_name: r.model_name,
                provider: r.provider,
                budget_id: r.budget_id,
                rate_limit_id: r.rate_limit_id,
            })
            .collect())
    }

    async fn load_provider_policies(&self) -> Result<Vec<ProviderPolicy>, AdapterError> {
        let rows = sqlx::query_as::<_, ProviderRow>(
            "SELECT name, budget_id, rate_limit_id FROM providers",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ProviderPolicy {
                name: r.name,
                budget_id: r.budget_id,
                rate_limit_id: r.rate_limit_id,
            })
            .collect())
    }

    async fn execute_transaction(&self, writes: &[UsageWrite]) -> Result<(), AdapterError> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for write in writes {
            match write {
                UsageWrite::Budget { id, current_usage } => {
                    sqlx::query("UPDATE budgets SET current_usage = $1 WHERE id = $2")
                        .bind(current_usage)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                UsageWrite::RateLimit {
                    id,
                    token_current_usage,
                    request_current_usage,
                } => {
                    sqlx::query(
                        "UPDATE rate_limits SET token_current_usage = $1, \
                         request_current_usage = $2 WHERE id = $3",
                    )
                    .bind(token_current_usage)
                    .bind(request_current_usage)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_budget_usage(
        &self,
        id: &str,
        current_usage: f64,
    ) -> Result<(), AdapterError> {
        sqlx::query("UPDATE budgets SET current_usage = $1 WHERE id = $2")
            .bind(current_usage)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_rate_limit_usage(
        &self,
        id: &str,
        token_current_usage: i64,
        request_current_usage: i64,
    ) -> Result<(), AdapterError> {
        sqlx::query(
            "UPDATE rate_limits SET token_current_usage = $1, \
             request_current_usage = $2 WHERE id = $3",
        )
        .bind(token_current_usage)
        .bind(request_current_usage)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn persist_budget_resets(&self, budgets: &[Budget]) -> Result<(), AdapterError> {
        if budgets.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for budget in budgets {
            sqlx::query(
                "UPDATE budgets SET current_usage = $1, last_reset = $2 WHERE id = $3",
            )
            .bind(budget.current_usage)
            .bind(budget.last_reset)
            .bind(&budget.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn persist_rate_limit_resets(
        &self,
        limits: &[RateLimit],
    ) -> Result<(), AdapterError> {
        if limits.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for limit in limits {
            sqlx::query(
                "UPDATE rate_limits SET token_current_usage = $1, token_last_reset = $2, \
                 request_current_usage = $3, request_last_reset = $4 WHERE id = $5",
            )
            .bind(limit.token_current_usage)
            .bind(limit.token_last_reset)
            .bind(limit.request_current_usage)
            .bind(limit.request_last_reset)
            .bind(&limit.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_config_value(&self, key: &str) -> Result<Option<String>, AdapterError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_config_value(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
