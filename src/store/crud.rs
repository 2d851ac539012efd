//! CRUD entry points for policy entities.
//!
//! Counter updates preserve live usage: an update to a budget or rate
//! limit accepts config-field changes (`max_limit`, reset durations) while
//! keeping `current_usage` and `last_reset` from the in-memory record; the
//! durable store is not authoritative for live usage. Deletes cascade by
//! severing owner references.

use super::CounterStore;
use crate::store::{
    Budget, Customer, ModelConfig, ProviderPolicy, RateLimit, Team, VirtualKey,
};

impl CounterStore {
    pub fn insert_budget(&self, budget: Budget) {
        self.budgets.insert(budget.id.clone(), budget);
    }

    /// Apply config-field changes, keeping in-memory usage and reset time.
    pub fn update_budget(&self, incoming: Budget) {
        let merged = match self.budget(&incoming.id) {
            Some(existing) => Budget {
                current_usage: existing.current_usage,
                last_reset: existing.last_reset,
                ..incoming
            },
            None => incoming,
        };
        self.budgets.insert(merged.id.clone(), merged);
    }

    pub fn delete_budget(&self, id: &str) -> Option<Budget> {
        self.budgets.remove(id).map(|(_, budget)| budget)
    }

    pub fn insert_rate_limit(&self, limit: RateLimit) {
        self.rate_limits.insert(limit.id.clone(), limit);
    }

    /// Apply config-field changes, keeping both sides' usage and reset
    /// times.
    pub fn update_rate_limit(&self, incoming: RateLimit) {
        let merged = match self.rate_limit(&incoming.id) {
            Some(existing) => RateLimit {
                token_current_usage: existing.token_current_usage,
                token_last_reset: existing.token_last_reset,
                request_current_usage: existing.request_current_usage,
                request_last_reset: existing.request_last_reset,
                ..incoming
            },
            None => incoming,
        };
        self.rate_limits.insert(merged.id.clone(), merged);
    }

    pub fn delete_rate_limit(&self, id: &str) -> Option<RateLimit> {
        self.rate_limits.remove(id).map(|(_, limit)| limit)
    }

    pub fn insert_virtual_key(&self, vk: VirtualKey) {
        self.virtual_keys.insert(vk.value.clone(), vk);
    }

    /// Virtual keys carry no live counters; replace wholesale.
    pub fn update_virtual_key(&self, vk: VirtualKey) {
        self.virtual_keys.insert(vk.value.clone(), vk);
    }

    pub fn delete_virtual_key(&self, value: &str) -> Option<VirtualKey> {
        self.virtual_keys.remove(value).map(|(_, vk)| vk)
    }

    pub fn insert_team(&self, team: Team) {
        self.teams.insert(team.id.clone(), team);
    }

    pub fn update_team(&self, team: Team) {
        self.teams.insert(team.id.clone(), team);
    }

    /// Delete a team and null `team_id` on every child virtual key.
    pub fn delete_team(&self, id: &str) -> Option<Team> {
        let removed = self.teams.remove(id).map(|(_, team)| team)?;

        let orphaned: Vec<String> = self
            .virtual_keys
            .iter()
            .filter(|entry| entry.value().team_id.as_deref() == Some(id))
            .map(|entry| entry.key().clone())
            .collect();
        for value in orphaned {
            if let Some(mut vk) = self.virtual_key(&value) {
                vk.team_id = None;
                self.virtual_keys.insert(value, vk);
            }
        }

        Some(removed)
    }

    pub fn insert_customer(&self, customer: Customer) {
        self.customers.insert(customer.id.clone(), customer);
    }

    pub fn update_customer(&self, customer: Customer) {
        self.customers.insert(customer.id.clone(), customer);
    }

    /// Delete a customer and null `customer_id` on every child virtual key
    /// and team.
    pub fn delete_customer(&self, id: &str) -> Option<Customer> {
        let removed = self.customers.remove(id).map(|(_, customer)| customer)?;

        let orphaned_vks: Vec<String> = self
            .virtual_keys
            .iter()
            .filter(|entry| entry.value().customer_id.as_deref() == Some(id))
            .map(|entry| entry.key().clone())
            .collect();
        for value in orphaned_vks {
            if let Some(mut vk) = self.virtual_key(&value) {
                vk.customer_id = None;
                self.virtual_keys.insert(value, vk);
            }
        }

        let orphaned_teams: Vec<String> = self
            .teams
            .iter()
            .filter(|entry| entry.value().customer_id.as_deref() == Some(id))
            .map(|entry| entry.key().clone())
            .collect();
        for team_id in orphaned_teams {
            if let Some(mut team) = self.team(&team_id) {
                team.customer_id = None;
                self.teams.insert(team_id, team);
            }
        }

        Some(removed)
    }

    pub fn insert_model_config(&self, config: ModelConfig) {
        self.model_configs.insert(config.key(), config);
    }

    pub fn update_model_config(&self, config: ModelConfig) {
        self.model_configs.insert(config.key(), config);
    }

    pub fn delete_model_config(&self, model: &str, provider: Option<&str>) -> Option<ModelConfig> {
        self.model_configs
            .remove(&ModelConfig::key_for(model, provider))
            .map(|(_, config)| config)
    }

    pub fn insert_provider_policy(&self, policy: ProviderPolicy) {
        self.providers.insert(policy.name.clone(), policy);
    }

    pub fn update_provider_policy(&self, policy: ProviderPolicy) {
        self.providers.insert(policy.name.clone(), policy);
    }

    pub fn delete_provider_policy(&self, name: &str) -> Option<ProviderPolicy> {
        self.providers.remove(name).map(|(_, policy)| policy)
    }

    pub fn virtual_key_count(&self) -> usize {
        self.virtual_keys.len()
    }

    pub fn budget_count(&self) -> usize {
        self.budgets.len()
    }

    pub fn rate_limit_count(&self) -> usize {
        self.rate_limits.len()
    }
}
