//! In-memory implementation of the configuration adapter.
//!
//! Satisfies the same contract as the database-backed adapter for tests
//! and deployments without a durable store. Writes mutate the seeded maps
//! so round-trip behavior can be asserted.

use super::{AdapterError, ConfigAdapter, UsageWrite};
use crate::store::{
    Budget, Customer, ModelConfig, ProviderPolicy, RateLimit, Team, VirtualKey,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    customers: Vec<Customer>,
    teams: Vec<Team>,
    virtual_keys: Vec<VirtualKey>,
    budgets: HashMap<String, Budget>,
    rate_limits: HashMap<String, RateLimit>,
    model_configs: Vec<ModelConfig>,
    provider_policies: Vec<ProviderPolicy>,
    config_values: HashMap<String, String>,
}

/// Adapter holding all tables in process memory.
#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<Tables>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_customers(&self, customers: Vec<Customer>) {
        self.tables.lock().unwrap().customers = customers;
    }

    pub fn seed_teams(&self, teams: Vec<Team>) {
        self.tables.lock().unwrap().teams = teams;
    }

    pub fn seed_virtual_keys(&self, keys: Vec<VirtualKey>) {
        self.tables.lock().unwrap().virtual_keys = keys;
    }

    pub fn seed_budgets(&self, budgets: Vec<Budget>) {
        let mut tables = self.tables.lock().unwrap();
        tables.budgets = budgets.into_iter().map(|b| (b.id.clone(), b)).collect();
    }

    pub fn seed_rate_limits(&self, limits: Vec<RateLimit>) {
        let mut tables = self.tables.lock().unwrap();
        tables.rate_limits = limits.into_iter().map(|l| (l.id.clone(), l)).collect();
    }

    pub fn seed_model_configs(&self, configs: Vec<ModelConfig>) {
        self.tables.lock().unwrap().model_configs = configs;
    }

    pub fn seed_provider_policies(&self, policies: Vec<ProviderPolicy>) {
        self.tables.lock().unwrap().provider_policies = policies;
    }

    /// The persisted usage of one budget, for assertions.
    pub fn budget_usage(&self, id: &str) -> Option<f64> {
        self.tables
            .lock()
            .unwrap()
            .budgets
            .get(id)
            .map(|b| b.current_usage)
    }

    /// The persisted usage of one rate limit, for assertions.
    pub fn rate_limit_usage(&self, id: &str) -> Option<(i64, i64)> {
        self.tables
            .lock()
            .unwrap()
            .rate_limits
            .get(id)
            .map(|l| (l.token_current_usage, l.request_current_usage))
    }
}

#[async_trait]
impl ConfigAdapter for MemoryAdapter {
    async fn load_customers(&self) -> Result<Vec<Customer>, AdapterError> {
        Ok(self.tables.lock().unwrap().customers.clone())
    }

    async fn load_teams(&self) -> Result<Vec<Team>, AdapterError> {
        Ok(self.tables.lock().unwrap().teams.clone())
    }

    async fn load_virtual_keys(&self) -> Result<Vec<VirtualKey>, AdapterError> {
        Ok(self.tables.lock().unwrap().virtual_keys.clone())
    }

    async fn load_budgets(&self) -> Result<Vec<Budget>, AdapterError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .budgets
            .values()
            .cloned()
            .collect())
    }

    async fn load_rate_limits(&self) -> Result<Vec<RateLimit>, AdapterError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .rate_limits
            .values()
            .cloned()
            .collect())
    }

    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>, AdapterError> {
        Ok(self.tables.lock().unwrap().model_configs.clone())
    }

    async fn load_provider_policies(&self) -> Result<Vec<ProviderPolicy>, AdapterError> {
        Ok(self.tables.lock().unwrap().provider_policies.clone())
    }

    async fn execute_transaction(&self, writes: &[UsageWrite]) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().unwrap();
        for write in writes {
            match write {
                UsageWrite::Budget { id, current_usage } => {
                    if let Some(budget) = tables.budgets.get_mut(id) {
                        budget.current_usage = *current_usage;
                    }
                }
                UsageWrite::RateLimit {
                    id,
                    token_current_usage,
                    request_current_usage,
                } => {
                    if let Some(limit) = tables.rate_limits.get_mut(id) {
                        limit.token_current_usage = *token_current_usage;
                        limit.request_current_usage = *request_current_usage;
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_budget_usage(
        &self,
        id: &str,
        current_usage: f64,
    ) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(budget) = tables.budgets.get_mut(id) {
            budget.current_usage = current_usage;
        }
        Ok(())
    }

    async fn update_rate_limit_usage(
        &self,
        id: &str,
        token_current_usage: i64,
        request_current_usage: i64,
    ) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(limit) = tables.rate_limits.get_mut(id) {
            limit.token_current_usage = token_current_usage;
            limit.request_current_usage = request_current_usage;
        }
        Ok(())
    }

    async fn persist_budget_resets(&self, budgets: &[Budget]) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().unwrap();
        for budget in budgets {
            if let Some(stored) = tables.budgets.get_mut(&budget.id) {
                stored.current_usage = budget.current_usage;
                stored.last_reset = budget.last_reset;
            }
        }
        Ok(())
    }

    async fn persist_rate_limit_resets(
        &self,
        limits: &[RateLimit],
    ) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock().unwrap();
        for limit in limits {
            if let Some(stored) = tables.rate_limits.get_mut(&limit.id) {
                stored.token_current_usage = limit.token_current_usage;
                stored.token_last_reset = limit.token_last_reset;
                stored.request_current_usage = limit.request_current_usage;
                stored.request_last_reset = limit.request_last_reset;
            }
        }
        Ok(())
    }

    async fn get_config_value(&self, key: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.tables.lock().unwrap().config_values.get(key).cloned())
    }

    async fn set_config_value(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        self.tables
            .lock()
            .unwrap()
            .config_values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
