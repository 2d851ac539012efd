//! Deep snapshot of every table for admin and debug surfaces.
//!
//! Owner records may cache stale counter values after independent updates,
//! so the snapshot re-resolves every budget and rate limit through the
//! canonical maps. Not used on the hot path.

use super::CounterStore;
use crate::store::{
    Budget, Customer, ModelConfig, ProviderPolicy, RateLimit, Team, VirtualKey,
};
use serde::Serialize;
use std::collections::HashMap;

/// A virtual key with its counters resolved live.
#[derive(Debug, Clone, Serialize)]
pub struct VirtualKeySnapshot {
    pub virtual_key: VirtualKey,
    pub budget: Option<Budget>,
    pub rate_limit: Option<RateLimit>,
    /// Resolved per-provider-config budgets, keyed by config ID.
    pub provider_config_budgets: HashMap<String, Budget>,
    /// Resolved per-provider-config rate limits, keyed by config ID.
    pub provider_config_rate_limits: HashMap<String, RateLimit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamSnapshot {
    pub team: Team,
    pub budget: Option<Budget>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerSnapshot {
    pub customer: Customer,
    pub budget: Option<Budget>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderPolicySnapshot {
    pub policy: ProviderPolicy,
    pub budget: Option<Budget>,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelConfigSnapshot {
    pub config: ModelConfig,
    pub budget: Option<Budget>,
    pub rate_limit: Option<RateLimit>,
}

/// Full governance state at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct GovernanceData {
    pub virtual_keys: Vec<VirtualKeySnapshot>,
    pub teams: Vec<TeamSnapshot>,
    pub customers: Vec<CustomerSnapshot>,
    pub providers: Vec<ProviderPolicySnapshot>,
    pub model_configs: Vec<ModelConfigSnapshot>,
    pub budgets: Vec<Budget>,
    pub rate_limits: Vec<RateLimit>,
}

impl CounterStore {
    fn resolve_budget(&self, id: Option<&String>) -> Option<Budget> {
        id.and_then(|id| self.budget(id))
    }

    fn resolve_rate_limit(&self, id: Option<&String>) -> Option<RateLimit> {
        id.and_then(|id| self.rate_limit(id))
    }

    /// Deep-referenced view of every table.
    pub fn governance_data(&self) -> GovernanceData {
        let virtual_keys = self
            .virtual_keys
            .iter()
            .map(|entry| {
                let vk = entry.value().clone();
                let mut provider_config_budgets = HashMap::new();
                let mut provider_config_rate_limits = HashMap::new();
                for config in &vk.provider_configs {
                    if let Some(budget) = self.resolve_budget(config.budget_id.as_ref()) {
                        provider_config_budgets.insert(config.id.clone(), budget);
                    }
                    if let Some(limit) = self.resolve_rate_limit(config.rate_limit_id.as_ref()) {
                        provider_config_rate_limits.insert(config.id.clone(), limit);
                    }
                }
                VirtualKeySnapshot {
                    budget: self.resolve_budget(vk.budget_id.as_ref()),
                    rate_limit: self.resolve_rate_limit(vk.rate_limit_id.as_ref()),
                    provider_config_budgets,
                    provider_config_rate_limits,
                    virtual_key: vk,
                }
            })
            .collect();

        let teams = self
            .teams
            .iter()
            .map(|entry| {
                let team = entry.value().clone();
                TeamSnapshot {
                    budget: self.resolve_budget(team.budget_id.as_ref()),
                    team,
                }
            })
            .collect();

        let customers = self
            .customers
            .iter()
            .map(|entry| {
                let customer = entry.value().clone();
                CustomerSnapshot {
                    budget: self.resolve_budget(customer.budget_id.as_ref()),
                    customer,
                }
            })
            .collect();

        let providers = self
            .providers
            .iter()
            .map(|entry| {
                let policy = entry.value().clone();
                ProviderPolicySnapshot {
                    budget: self.resolve_budget(policy.budget_id.as_ref()),
                    rate_limit: self.resolve_rate_limit(policy.rate_limit_id.as_ref()),
                    policy,
                }
            })
            .collect();

        let model_configs = self
            .model_configs
            .iter()
            .map(|entry| {
                let config = entry.value().clone();
                ModelConfigSnapshot {
                    budget: self.resolve_budget(config.budget_id.as_ref()),
                    rate_limit: self.resolve_rate_limit(config.rate_limit_id.as_ref()),
                    config,
                }
            })
            .collect();

        GovernanceData {
            virtual_keys,
            teams,
            customers,
            providers,
            model_configs,
            budgets: self.budgets.iter().map(|e| e.value().clone()).collect(),
            rate_limits: self.rate_limits.iter().map(|e| e.value().clone()).collect(),
        }
    }
}
