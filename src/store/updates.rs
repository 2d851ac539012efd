//! Update operations: post-request counter accounting.
//!
//! Updates walk the same hierarchy the checks do, keeping the two sides
//! symmetric. On an expired window the update first resets the counter,
//! then applies the increment. Each write is a read-modify-replace of the
//! canonical map entry.

use super::CounterStore;
use chrono::{DateTime, Utc};

impl CounterStore {
    /// Reset-then-increment one budget.
    fn bump_budget(&self, budget_id: &str, cost: f64, now: DateTime<Utc>) {
        let Some(mut budget) = self.budget(budget_id) else {
            tracing::warn!(budget_id = %budget_id, "Skipping usage update: unknown budget");
            return;
        };

        match budget.window_expired(now) {
            Ok(true) => {
                budget.current_usage = 0.0;
                budget.last_reset = now;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    budget_id = %budget_id,
                    error = %err,
                    "Applying usage without reset: unparseable reset duration"
                );
            }
        }

        budget.current_usage += cost;
        self.budgets.insert(budget_id.to_string(), budget);
    }

    /// Reset-then-increment one rate limit; each side resets independently.
    fn bump_rate_limit(
        &self,
        rate_limit_id: &str,
        tokens: i64,
        bump_tokens: bool,
        bump_requests: bool,
        now: DateTime<Utc>,
    ) {
        let Some(mut limit) = self.rate_limit(rate_limit_id) else {
            tracing::warn!(
                rate_limit_id = %rate_limit_id,
                "Skipping rate update: unknown rate limit"
            );
            return;
        };

        if bump_tokens {
            match limit.token_window_expired(now) {
                Ok(true) => {
                    limit.token_current_usage = 0;
                    limit.token_last_reset = now;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        rate_limit_id = %rate_limit_id,
                        error = %err,
                        "Applying token usage without reset: unparseable reset duration"
                    );
                }
            }
            limit.token_current_usage += tokens;
        }

        if bump_requests {
            match limit.request_window_expired(now) {
                Ok(true) => {
                    limit.request_current_usage = 0;
                    limit.request_last_reset = now;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        rate_limit_id = %rate_limit_id,
                        error = %err,
                        "Applying request usage without reset: unparseable reset duration"
                    );
                }
            }
            limit.request_current_usage += 1;
        }

        self.rate_limits.insert(rate_limit_id.to_string(), limit);
    }

    /// Attribute cost to every budget in the virtual key's hierarchy.
    pub fn update_vk_usage(&self, vk_value: &str, provider: Option<&str>, cost: f64) {
        let Some(vk) = self.virtual_key(vk_value) else {
            tracing::warn!("Skipping usage update: unknown virtual key");
            return;
        };
        let now = Utc::now();
        for entry in self.budget_walk(&vk, provider) {
            self.bump_budget(&entry.counter_id, cost, now);
        }
    }

    /// Attribute token/request consumption to every rate limit in the
    /// virtual key's hierarchy.
    pub fn update_vk_rate(
        &self,
        vk_value: &str,
        provider: Option<&str>,
        tokens: i64,
        bump_tokens: bool,
        bump_requests: bool,
    ) {
        let Some(vk) = self.virtual_key(vk_value) else {
            tracing::warn!("Skipping rate update: unknown virtual key");
            return;
        };
        let now = Utc::now();
        for entry in self.rate_limit_walk(&vk, provider) {
            self.bump_rate_limit(&entry.counter_id, tokens, bump_tokens, bump_requests, now);
        }
    }

    /// Attribute cost to the global provider policy's budget and to every
    /// applicable model config's budget.
    pub fn update_provider_and_model_usage(
        &self,
        model: Option<&str>,
        provider: Option<&str>,
        cost: f64,
    ) {
        let now = Utc::now();

        if let Some(provider) = provider {
            if let Some(policy) = self.provider_policy(provider) {
                if let Some(budget_id) = policy.budget_id.as_deref() {
                    self.bump_budget(budget_id, cost, now);
                }
            }
        }

        if let Some(model) = model {
            for config in self.matching_model_configs(model, provider) {
                if let Some(budget_id) = config.budget_id.as_deref() {
                    self.bump_budget(budget_id, cost, now);
                }
            }
        }
    }

    /// Attribute token/request consumption to the global provider policy's
    /// rate limit and to every applicable model config's rate limit.
    pub fn update_provider_and_model_rate(
        &self,
        model: Option<&str>,
        provider: Option<&str>,
        tokens: i64,
        bump_tokens: bool,
        bump_requests: bool,
    ) {
        let now = Utc::now();

        if let Some(provider) = provider {
            if let Some(policy) = self.provider_policy(provider) {
                if let Some(rate_limit_id) = policy.rate_limit_id.as_deref() {
                    self.bump_rate_limit(rate_limit_id, tokens, bump_tokens, bump_requests, now);
                }
            }
        }

        if let Some(model) = model {
            for config in self.matching_model_configs(model, provider) {
                if let Some(rate_limit_id) = config.rate_limit_id.as_deref() {
                    self.bump_rate_limit(rate_limit_id, tokens, bump_tokens, bump_requests, now);
                }
            }
        }
    }
}
