//! Check operations: admission predicates over live counters.
//!
//! Each check returns `Ok(())` or a typed violation. Violations are
//! deterministic deny decisions, never retryable infrastructure errors.
//! A counter whose window has expired is treated as already reset and does
//! not flag; a counter whose reset duration fails to parse is skipped
//! (fail-open for that counter only).

use super::{CounterStore, EvalRequest};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Remote-node usage estimates per budget ID, additive into local checks.
pub type BudgetBaselines = HashMap<String, f64>;
/// Remote-node usage estimates per rate-limit ID (one map per side).
pub type RateBaselines = HashMap<String, i64>;

/// Typed policy violation returned by check operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("budget exceeded for {scope}: spent {spent:.2} of {limit:.2} USD")]
    BudgetExceeded {
        scope: String,
        spent: f64,
        limit: f64,
    },

    #[error("token limit exceeded for {scope}: {used} of {limit} tokens used")]
    TokenLimited { scope: String, used: i64, limit: i64 },

    #[error("request limit exceeded for {scope}: {used} of {limit} requests used")]
    RequestLimited { scope: String, used: i64, limit: i64 },

    #[error("rate limit exceeded for {scope}: token and request limits exhausted")]
    RateLimited { scope: String },
}

impl CounterStore {
    /// Violation for one budget, resolved through the canonical map.
    fn budget_violation(
        &self,
        budget_id: &str,
        scope: &str,
        baselines: Option<&BudgetBaselines>,
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let budget = self.budget(budget_id)?;
        match budget.window_expired(now) {
            Ok(true) => None,
            Err(err) => {
                tracing::warn!(
                    budget_id = %budget_id,
                    error = %err,
                    "Skipping budget check: unparseable reset duration"
                );
                None
            }
            Ok(false) => {
                let baseline = baselines
                    .and_then(|b| b.get(budget_id))
                    .copied()
                    .unwrap_or(0.0);
                let spent = budget.effective_usage(baseline);
                if spent >= budget.max_limit {
                    Some(Violation::BudgetExceeded {
                        scope: scope.to_string(),
                        spent,
                        limit: budget.max_limit,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Violation for one rate limit. Token and request windows are checked
    /// independently; an expired window short-circuits its own side only.
    fn rate_limit_violation(
        &self,
        rate_limit_id: &str,
        scope: &str,
        token_baselines: Option<&RateBaselines>,
        request_baselines: Option<&RateBaselines>,
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let limit = self.rate_limit(rate_limit_id)?;

        let mut token_hit = None;
        if let Some(max) = limit.token_max_limit {
            match limit.token_window_expired(now) {
                Ok(true) => {}
                Err(err) => {
                    tracing::warn!(
                        rate_limit_id = %rate_limit_id,
                        error = %err,
                        "Skipping token-side check: unparseable reset duration"
                    );
                }
                Ok(false) => {
                    let baseline = token_baselines
                        .and_then(|b| b.get(rate_limit_id))
                        .copied()
                        .unwrap_or(0);
                    let used = limit.token_current_usage + baseline;
                    if used >= max {
                        token_hit = Some((used, max));
                    }
                }
            }
        }

        let mut request_hit = None;
        if let Some(max) = limit.request_max_limit {
            match limit.request_window_expired(now) {
                Ok(true) => {}
                Err(err) => {
                    tracing::warn!(
                        rate_limit_id = %rate_limit_id,
                        error = %err,
                        "Skipping request-side check: unparseable reset duration"
                    );
                }
                Ok(false) => {
                    let baseline = request_baselines
                        .and_then(|b| b.get(rate_limit_id))
                        .copied()
                        .unwrap_or(0);
                    let used = limit.request_current_usage + baseline;
                    if used >= max {
                        request_hit = Some((used, max));
                    }
                }
            }
        }

        match (token_hit, request_hit) {
            (Some(_), Some(_)) => Some(Violation::RateLimited {
                scope: scope.to_string(),
            }),
            (Some((used, max)), None) => Some(Violation::TokenLimited {
                scope: scope.to_string(),
                used,
                limit: max,
            }),
            (None, Some((used, max))) => Some(Violation::RequestLimited {
                scope: scope.to_string(),
                used,
                limit: max,
            }),
            (None, None) => None,
        }
    }

    /// Deny iff the global provider policy's budget is exhausted inside a
    /// live window.
    pub fn check_provider_budget(
        &self,
        req: &EvalRequest,
        baselines: Option<&BudgetBaselines>,
    ) -> Result<(), Violation> {
        let Some(provider) = req.provider.as_deref() else {
            return Ok(());
        };
        let Some(policy) = self.provider_policy(provider) else {
            return Ok(());
        };
        let Some(budget_id) = policy.budget_id.as_deref() else {
            return Ok(());
        };
        let scope = format!("provider {}", policy.name);
        match self.budget_violation(budget_id, &scope, baselines, Utc::now()) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Deny on the global provider policy's rate limit; token and request
    /// sides are independent.
    pub fn check_provider_rate_limit(
        &self,
        req: &EvalRequest,
        token_baselines: Option<&RateBaselines>,
        request_baselines: Option<&RateBaselines>,
    ) -> Result<(), Violation> {
        let Some(provider) = req.provider.as_deref() else {
            return Ok(());
        };
        let Some(policy) = self.provider_policy(provider) else {
            return Ok(());
        };
        let Some(rate_limit_id) = policy.rate_limit_id.as_deref() else {
            return Ok(());
        };
        let scope = format!("provider {}", policy.name);
        match self.rate_limit_violation(
            rate_limit_id,
            &scope,
            token_baselines,
            request_baselines,
            Utc::now(),
        ) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Deny on the first exceeded model budget. Both the provider-scoped
    /// and the model-only config apply.
    pub fn check_model_budget(
        &self,
        req: &EvalRequest,
        baselines: Option<&BudgetBaselines>,
    ) -> Result<(), Violation> {
        let Some(model) = req.model.as_deref() else {
            return Ok(());
        };
        let now = Utc::now();
        for config in self.matching_model_configs(model, req.provider.as_deref()) {
            let Some(budget_id) = config.budget_id.as_deref() else {
                continue;
            };
            let scope = match &config.provider {
                Some(p) => format!("model {} ({})", config.model_name, p),
                None => format!("model {}", config.model_name),
            };
            if let Some(violation) = self.budget_violation(budget_id, &scope, baselines, now) {
                return Err(violation);
            }
        }
        Ok(())
    }

    /// Deny on the first exceeded model rate limit, same two-lookup rule.
    pub fn check_model_rate_limit(
        &self,
        req: &EvalRequest,
        token_baselines: Option<&RateBaselines>,
        request_baselines: Option<&RateBaselines>,
    ) -> Result<(), Violation> {
        let Some(model) = req.model.as_deref() else {
            return Ok(());
        };
        let now = Utc::now();
        for config in self.matching_model_configs(model, req.provider.as_deref()) {
            let Some(rate_limit_id) = config.rate_limit_id.as_deref() else {
                continue;
            };
            let scope = match &config.provider {
                Some(p) => format!("model {} ({})", config.model_name, p),
                None => format!("model {}", config.model_name),
            };
            if let Some(violation) = self.rate_limit_violation(
                rate_limit_id,
                &scope,
                token_baselines,
                request_baselines,
                now,
            ) {
                return Err(violation);
            }
        }
        Ok(())
    }

    /// Walk the budget hierarchy (provider config, virtual key, team,
    /// customer) and deny on the first exceeded budget. Expired budgets
    /// are skipped; the violation labels the failing level.
    pub fn check_vk_budget(
        &self,
        vk: &super::VirtualKey,
        req: &EvalRequest,
        baselines: Option<&BudgetBaselines>,
    ) -> Result<(), Violation> {
        let now = Utc::now();
        for entry in self.budget_walk(vk, req.provider.as_deref()) {
            if let Some(violation) =
                self.budget_violation(&entry.counter_id, &entry.label, baselines, now)
            {
                return Err(violation);
            }
        }
        Ok(())
    }

    /// Walk the rate-limit hierarchy (provider config, virtual key) and
    /// deny on the first exceeded limit.
    pub fn check_vk_rate_limit(
        &self,
        vk: &super::VirtualKey,
        req: &EvalRequest,
        token_baselines: Option<&RateBaselines>,
        request_baselines: Option<&RateBaselines>,
    ) -> Result<(), Violation> {
        let now = Utc::now();
        for entry in self.rate_limit_walk(vk, req.provider.as_deref()) {
            if let Some(violation) = self.rate_limit_violation(
                &entry.counter_id,
                &entry.label,
                token_baselines,
                request_baselines,
                now,
            ) {
                return Err(violation);
            }
        }
        Ok(())
    }
}
