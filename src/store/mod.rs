//! Counter Store module.
//!
//! Holds every policy entity and every live counter. All top-level tables
//! are concurrent maps (DashMap) supporting lock-free reads and single-key
//! replace. Values are immutable after publication: every update reads the
//! current value, produces a modified copy, and stores it back. Concurrent
//! writers to the same key race the store; last-writer-wins is accepted
//! because hot-path writes are additive increments and resets are
//! idempotent.

mod checks;
mod crud;
mod entities;
mod snapshot;
mod sweep;
mod updates;
#[cfg(test)]
mod tests;

pub use checks::{BudgetBaselines, RateBaselines, Violation};
pub use entities::{
    parse_interval, Budget, Customer, IntervalParseError, ModelConfig, ProviderConfig,
    ProviderPolicy, RateLimit, Team, VirtualKey,
};
pub use snapshot::{
    CustomerSnapshot, GovernanceData, ModelConfigSnapshot, ProviderPolicySnapshot, TeamSnapshot,
    VirtualKeySnapshot,
};

use crate::catalog::ModelCatalog;
use dashmap::DashMap;
use std::sync::Arc;

/// Descriptor of the request under evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvalRequest {
    /// Virtual-key secret, when presented.
    pub virtual_key: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: String,
}

/// Hierarchy level a budget or rate limit was found at, most specific
/// first. Violation messages label the failing level with these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLevel {
    ProviderConfig,
    VirtualKey,
    Team,
    Customer,
}

impl PolicyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyLevel::ProviderConfig => "provider config",
            PolicyLevel::VirtualKey => "virtual key",
            PolicyLevel::Team => "team",
            PolicyLevel::Customer => "customer",
        }
    }
}

/// One step of a hierarchy walk: a counter ID plus the label violations
/// surface for it.
#[derive(Debug, Clone)]
pub(crate) struct WalkEntry {
    pub counter_id: String,
    pub label: String,
}

/// In-memory tables of policy entities and live counters.
///
/// Budgets and rate limits live in canonical maps keyed by ID; owners
/// reference them by ID and every usage-sensitive access re-resolves
/// through the canonical map.
pub struct CounterStore {
    pub(crate) virtual_keys: DashMap<String, VirtualKey>,
    pub(crate) teams: DashMap<String, Team>,
    pub(crate) customers: DashMap<String, Customer>,
    pub(crate) budgets: DashMap<String, Budget>,
    pub(crate) rate_limits: DashMap<String, RateLimit>,
    pub(crate) model_configs: DashMap<String, ModelConfig>,
    pub(crate) providers: DashMap<String, ProviderPolicy>,
    pub(crate) catalog: Option<Arc<dyn ModelCatalog>>,
}

impl CounterStore {
    pub fn new(catalog: Option<Arc<dyn ModelCatalog>>) -> Self {
        Self {
            virtual_keys: DashMap::new(),
            teams: DashMap::new(),
            customers: DashMap::new(),
            budgets: DashMap::new(),
            rate_limits: DashMap::new(),
            model_configs: DashMap::new(),
            providers: DashMap::new(),
            catalog,
        }
    }

    /// Look up a virtual key by its secret value.
    pub fn virtual_key(&self, value: &str) -> Option<VirtualKey> {
        self.virtual_keys.get(value).map(|e| e.value().clone())
    }

    pub fn team(&self, id: &str) -> Option<Team> {
        self.teams.get(id).map(|e| e.value().clone())
    }

    pub fn customer(&self, id: &str) -> Option<Customer> {
        self.customers.get(id).map(|e| e.value().clone())
    }

    pub fn budget(&self, id: &str) -> Option<Budget> {
        self.budgets.get(id).map(|e| e.value().clone())
    }

    pub fn rate_limit(&self, id: &str) -> Option<RateLimit> {
        self.rate_limits.get(id).map(|e| e.value().clone())
    }

    pub fn provider_policy(&self, name: &str) -> Option<ProviderPolicy> {
        self.providers.get(name).map(|e| e.value().clone())
    }

    /// Model configs applicable to a request: the `(model, provider)`
    /// match and the `model`-only match both apply, for the raw name and
    /// its catalog-normalized base name.
    pub(crate) fn matching_model_configs(
        &self,
        model: &str,
        provider: Option<&str>,
    ) -> Vec<ModelConfig> {
        let mut names = vec![model.to_string()];
        if let Some(catalog) = &self.catalog {
            if let Some(base) = catalog.base_model_name(model) {
                if !names.contains(&base) {
                    names.push(base);
                }
            }
        }

        let mut out: Vec<ModelConfig> = Vec::new();
        for name in &names {
            if let Some(p) = provider {
                if let Some(cfg) = self.model_configs.get(&ModelConfig::key_for(name, Some(p))) {
                    if !out.iter().any(|c| c.id == cfg.id) {
                        out.push(cfg.value().clone());
                    }
                }
            }
            if let Some(cfg) = self.model_configs.get(&ModelConfig::key_for(name, None)) {
                if !out.iter().any(|c| c.id == cfg.id) {
                    out.push(cfg.value().clone());
                }
            }
        }
        out
    }

    /// Budget hierarchy walk: ProviderConfig, then VK, then Team, then
    /// Customer. A customer reachable both directly and through the team
    /// contributes once.
    pub(crate) fn budget_walk(&self, vk: &VirtualKey, provider: Option<&str>) -> Vec<WalkEntry> {
        let mut entries = Vec::new();

        if let Some(provider) = provider {
            if let Some(config) = vk.provider_config(provider) {
                if let Some(budget_id) = &config.budget_id {
                    entries.push(WalkEntry {
                        counter_id: budget_id.clone(),
                        label: format!(
                            "{} {} of virtual key {}",
                            PolicyLevel::ProviderConfig.as_str(),
                            config.provider,
                            vk.name
                        ),
                    });
                }
            }
        }

        if let Some(budget_id) = &vk.budget_id {
            entries.push(WalkEntry {
                counter_id: budget_id.clone(),
                label: format!("{} {}", PolicyLevel::VirtualKey.as_str(), vk.name),
            });
        }

        let mut customer_ids: Vec<String> = Vec::new();
        if let Some(customer_id) = &vk.customer_id {
            customer_ids.push(customer_id.clone());
        }

        if let Some(team_id) = &vk.team_id {
            if let Some(team) = self.team(team_id) {
                if let Some(budget_id) = &team.budget_id {
                    entries.push(WalkEntry {
                        counter_id: budget_id.clone(),
                        label: format!("{} {}", PolicyLevel::Team.as_str(), team.name),
                    });
                }
                if let Some(customer_id) = &team.customer_id {
                    if !customer_ids.contains(customer_id) {
                        customer_ids.push(customer_id.clone());
                    }
                }
            }
        }

        let mut seen_budgets: Vec<String> = Vec::new();
        for customer_id in customer_ids {
            if let Some(customer) = self.customer(&customer_id) {
                if let Some(budget_id) = &customer.budget_id {
                    if seen_budgets.contains(budget_id) {
                        continue;
                    }
                    seen_budgets.push(budget_id.clone());
                    entries.push(WalkEntry {
                        counter_id: budget_id.clone(),
                        label: format!("{} {}", PolicyLevel::Customer.as_str(), customer.name),
                    });
                }
            }
        }

        entries
    }

    /// Rate-limit hierarchy walk: ProviderConfig then VK. Teams and
    /// customers carry budgets only.
    pub(crate) fn rate_limit_walk(
        &self,
        vk: &VirtualKey,
        provider: Option<&str>,
    ) -> Vec<WalkEntry> {
        let mut entries = Vec::new();

        if let Some(provider) = provider {
            if let Some(config) = vk.provider_config(provider) {
                if let Some(rate_limit_id) = &config.rate_limit_id {
                    entries.push(WalkEntry {
                        counter_id: rate_limit_id.clone(),
                        label: format!(
                            "{} {} of virtual key {}",
                            PolicyLevel::ProviderConfig.as_str(),
                            config.provider,
                            vk.name
                        ),
                    });
                }
            }
        }

        if let Some(rate_limit_id) = &vk.rate_limit_id {
            entries.push(WalkEntry {
                counter_id: rate_limit_id.clone(),
                label: format!("{} {}", PolicyLevel::VirtualKey.as_str(), vk.name),
            });
        }

        entries
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new(None)
    }
}
