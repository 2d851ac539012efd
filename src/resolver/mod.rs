//! Budget Resolver: pure decision function over counter-store snapshots.
//!
//! Two entry points under strict ordering: model-and-provider evaluation
//! runs for every request; virtual-key evaluation runs when a key was
//! presented. The first failing check determines the decision. On Allow
//! the resolver publishes identity facts into the request context for
//! downstream consumers.

use crate::gateway::context::{
    KEY_CUSTOMER_ID, KEY_CUSTOMER_NAME, KEY_INCLUDE_ONLY_KEYS, KEY_TEAM_ID, KEY_TEAM_NAME,
    KEY_VIRTUAL_KEY_ID, KEY_VIRTUAL_KEY_NAME,
};
use crate::gateway::{RequestContext, ShortCircuit};
use crate::store::{
    BudgetBaselines, CounterStore, EvalRequest, RateBaselines, Violation, VirtualKey,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default reason when the resolver itself failed; the pre-hook degrades
/// to this instead of surfacing an infrastructure error.
pub const DEFAULT_DENY_MESSAGE: &str = "request denied by governance policy";

/// Admission decision with a wire tag per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    VirtualKeyNotFound,
    VirtualKeyBlocked,
    VirtualKeyRequired,
    RateLimited,
    BudgetExceeded,
    TokenLimited,
    RequestLimited,
    ModelBlocked,
    ProviderBlocked,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::VirtualKeyNotFound => "virtual_key_not_found",
            Decision::VirtualKeyBlocked => "virtual_key_blocked",
            Decision::VirtualKeyRequired => "virtual_key_required",
            Decision::RateLimited => "rate_limited",
            Decision::BudgetExceeded => "budget_exceeded",
            Decision::TokenLimited => "token_limited",
            Decision::RequestLimited => "request_limited",
            Decision::ModelBlocked => "model_blocked",
            Decision::ProviderBlocked => "provider_blocked",
        }
    }

    /// Status code the gateway returns for this decision.
    pub fn status_code(&self) -> u16 {
        match self {
            Decision::Allow => 200,
            Decision::VirtualKeyNotFound
            | Decision::VirtualKeyBlocked
            | Decision::ModelBlocked
            | Decision::ProviderBlocked => 403,
            Decision::RateLimited | Decision::TokenLimited | Decision::RequestLimited => 429,
            Decision::BudgetExceeded => 402,
            Decision::VirtualKeyRequired => 400,
        }
    }

    fn from_violation(violation: &Violation) -> Decision {
        match violation {
            Violation::BudgetExceeded { .. } => Decision::BudgetExceeded,
            Violation::TokenLimited { .. } => Decision::TokenLimited,
            Violation::RequestLimited { .. } => Decision::RequestLimited,
            Violation::RateLimited { .. } => Decision::RateLimited,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decision plus its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: String::new(),
        }
    }

    pub fn deny(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
        }
    }

    fn from_violation(violation: Violation) -> Self {
        Self {
            decision: Decision::from_violation(&violation),
            reason: violation.to_string(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// The short-circuit error a deny translates to; None for Allow.
    pub fn short_circuit(&self) -> Option<ShortCircuit> {
        if self.is_allow() {
            return None;
        }
        Some(ShortCircuit::new(
            self.decision.as_str(),
            self.decision.status_code(),
            self.reason.clone(),
        ))
    }
}

/// Remote-node baselines for one evaluation, keyed by counter ID.
#[derive(Debug, Clone, Default)]
pub struct BaselineSet {
    pub budgets: BudgetBaselines,
    pub rate_tokens: RateBaselines,
    pub rate_requests: RateBaselines,
}

/// Pluggable source of peer usage estimates. The gossip mechanism lives
/// outside this crate; only the map shape is specified here. Baselines are
/// additive and monotonically non-decreasing within a window.
pub trait BaselineProvider: Send + Sync {
    fn baselines(&self) -> BaselineSet;
}

/// Default provider for single-node deployments.
pub struct NoBaselines;

impl BaselineProvider for NoBaselines {
    fn baselines(&self) -> BaselineSet {
        BaselineSet::default()
    }
}

/// Evaluates requests against the counter store.
pub struct Resolver {
    store: Arc<CounterStore>,
}

impl Resolver {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self { store }
    }

    /// Model-and-provider evaluation; runs for every request, with or
    /// without a virtual key. Order: provider rate limit, provider budget,
    /// model rate limit, model budget.
    pub fn evaluate_model_provider(
        &self,
        req: &EvalRequest,
        baselines: Option<&BaselineSet>,
    ) -> Verdict {
        let tokens = baselines.map(|b| &b.rate_tokens);
        let requests = baselines.map(|b| &b.rate_requests);
        let budgets = baselines.map(|b| &b.budgets);

        if let Err(violation) = self.store.check_provider_rate_limit(req, tokens, requests) {
            return Verdict::from_violation(violation);
        }
        if let Err(violation) = self.store.check_provider_budget(req, budgets) {
            return Verdict::from_violation(violation);
        }
        if let Err(violation) = self.store.check_model_rate_limit(req, tokens, requests) {
            return Verdict::from_violation(violation);
        }
        if let Err(violation) = self.store.check_model_budget(req, budgets) {
            return Verdict::from_violation(violation);
        }
        Verdict::allow()
    }

    /// Virtual-key evaluation. Order: key exists and is active, provider
    /// allowed, model allowed, rate-limit walk, budget walk. On Allow the
    /// identity facts and the credential allow-list are published into the
    /// context.
    pub fn evaluate_virtual_key(
        &self,
        vk_value: &str,
        req: &EvalRequest,
        ctx: &RequestContext,
        baselines: Option<&BaselineSet>,
    ) -> Verdict {
        let Some(vk) = self.store.virtual_key(vk_value) else {
            return Verdict::deny(Decision::VirtualKeyNotFound, "virtual key not found");
        };

        if !vk.is_active {
            return Verdict::deny(
                Decision::VirtualKeyBlocked,
                format!("virtual key {} is blocked", vk.name),
            );
        }

        if let Some(provider) = req.provider.as_deref() {
            // An empty config list admits every provider.
            if !vk.provider_configs.is_empty() {
                let Some(config) = vk.provider_config(provider) else {
                    return Verdict::deny(
                        Decision::ProviderBlocked,
                        format!(
                            "provider {} is not allowed for virtual key {}",
                            provider, vk.name
                        ),
                    );
                };

                if let Some(model) = req.model.as_deref() {
                    if !config.allowed_models.is_empty() && !self.model_allowed(model, config) {
                        return Verdict::deny(
                            Decision::ModelBlocked,
                            format!(
                                "model {} is not allowed for virtual key {} on provider {}",
                                model, vk.name, provider
                            ),
                        );
                    }
                }
            }
        }

        let tokens = baselines.map(|b| &b.rate_tokens);
        let requests = baselines.map(|b| &b.rate_requests);
        if let Err(violation) = self
            .store
            .check_vk_rate_limit(&vk, req, tokens, requests)
        {
            return Verdict::from_violation(violation);
        }

        let budgets = baselines.map(|b| &b.budgets);
        if let Err(violation) = self.store.check_vk_budget(&vk, req, budgets) {
            return Verdict::from_violation(violation);
        }

        self.publish_identity(ctx, &vk, req.provider.as_deref());
        Verdict::allow()
    }

    fn model_allowed(&self, model: &str, config: &crate::store::ProviderConfig) -> bool {
        match &self.store.catalog {
            Some(catalog) => config
                .allowed_models
                .iter()
                .any(|allowed| catalog.model_matches(model, allowed)),
            None => config.allowed_models.iter().any(|allowed| allowed == model),
        }
    }

    /// Identity surface for downstream plugins, published on Allow.
    fn publish_identity(&self, ctx: &RequestContext, vk: &VirtualKey, provider: Option<&str>) {
        ctx.set_str(KEY_VIRTUAL_KEY_ID, vk.id.clone());
        ctx.set_str(KEY_VIRTUAL_KEY_NAME, vk.name.clone());

        if let Some(team_id) = &vk.team_id {
            if let Some(team) = self.store.team(team_id) {
                ctx.set_str(KEY_TEAM_ID, team.id);
                ctx.set_str(KEY_TEAM_NAME, team.name);
            }
        }

        let customer_id = vk.customer_id.clone().or_else(|| {
            vk.team_id
                .as_ref()
                .and_then(|id| self.store.team(id))
                .and_then(|team| team.customer_id)
        });
        if let Some(customer_id) = customer_id {
            if let Some(customer) = self.store.customer(&customer_id) {
                ctx.set_str(KEY_CUSTOMER_ID, customer.id);
                ctx.set_str(KEY_CUSTOMER_NAME, customer.name);
            }
        }

        if let Some(provider) = provider {
            if let Some(config) = vk.provider_config(provider) {
                if !config.credential_ids.is_empty() {
                    ctx.set_str_list(KEY_INCLUDE_ONLY_KEYS, &config.credential_ids);
                }
            }
        }
    }
}
