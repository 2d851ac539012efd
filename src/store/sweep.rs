//! Reset sweeping: opportunistic reconciliation of expired windows.
//!
//! Checks and updates are lazily expiry-aware, so the sweeps are not a
//! correctness dependency; they exist so the durable store converges and
//! admin surfaces read zeroed counters. Candidates are collected first and
//! replaced per key afterwards, so no shard lock is held across the pass.

use super::CounterStore;
use crate::store::{Budget, RateLimit};
use chrono::Utc;

impl CounterStore {
    /// Reset every budget whose window has elapsed. Returns the budgets
    /// that transitioned, in their post-reset state, for persistence.
    pub fn sweep_expired_budgets(&self) -> Vec<Budget> {
        let now = Utc::now();
        let expired_ids: Vec<String> = self
            .budgets
            .iter()
            .filter(|entry| matches!(entry.value().window_expired(now), Ok(true)))
            .map(|entry| entry.key().clone())
            .collect();

        let mut transitioned = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            let Some(mut budget) = self.budget(&id) else {
                continue;
            };
            // Re-verify under the fresh read; a racing update may have
            // already reset this window.
            if !matches!(budget.window_expired(now), Ok(true)) {
                continue;
            }
            budget.current_usage = 0.0;
            budget.last_reset = now;
            self.budgets.insert(id, budget.clone());
            transitioned.push(budget);
        }

        if !transitioned.is_empty() {
            tracing::debug!(count = transitioned.len(), "Swept expired budgets");
        }
        transitioned
    }

    /// Reset every rate-limit side whose window has elapsed. Returns rate
    /// limits where at least one side transitioned, post-reset.
    pub fn sweep_expired_rate_limits(&self) -> Vec<RateLimit> {
        let now = Utc::now();
        let candidate_ids: Vec<String> = self
            .rate_limits
            .iter()
            .filter(|entry| {
                let limit = entry.value();
                matches!(limit.token_window_expired(now), Ok(true))
                    || matches!(limit.request_window_expired(now), Ok(true))
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut transitioned = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let Some(mut limit) = self.rate_limit(&id) else {
                continue;
            };

            let mut changed = false;
            if matches!(limit.token_window_expired(now), Ok(true)) {
                limit.token_current_usage = 0;
                limit.token_last_reset = now;
                changed = true;
            }
            if matches!(limit.request_window_expired(now), Ok(true)) {
                limit.request_current_usage = 0;
                limit.request_last_reset = now;
                changed = true;
            }
            if !changed {
                continue;
            }

            self.rate_limits.insert(id, limit.clone());
            transitioned.push(limit);
        }

        if !transitioned.is_empty() {
            tracing::debug!(count = transitioned.len(), "Swept expired rate limits");
        }
        transitioned
    }
}
