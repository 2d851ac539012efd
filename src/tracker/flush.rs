//! Background flush of live counters to the durable store.
//!
//! Only counters whose computed write value differs from the last written
//! value are flushed. The write value is `current_usage + baseline`, so
//! quotas converge across nodes. RDBMS deadlocks mean another node owns
//! the rows this cycle; the local delta rides the next flush.

use super::UsageTracker;
use crate::adapter::UsageWrite;
use std::time::Duration;
use tokio::task::JoinHandle;

impl UsageTracker {
    pub(super) fn spawn_flusher(self: std::sync::Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(interval_seconds = interval.as_secs(), "Flusher started");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::info!("Flusher shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.flush_once().await;
                        self.sweep_and_persist().await;
                    }
                }
            }
        })
    }

    /// One flush cycle: compute changed counters, write them in a single
    /// transaction, and advance the mirrors on success.
    pub(super) async fn flush_once(&self) {
        let Some(adapter) = &self.adapter else {
            return;
        };

        let baselines = self.baselines.baselines();
        let mut writes: Vec<UsageWrite> = Vec::new();

        {
            let mirror = self.last_db_budgets.read().unwrap();
            for entry in self.store.budgets.iter() {
                let budget = entry.value();
                let baseline = baselines.budgets.get(&budget.id).copied().unwrap_or(0.0);
                let value = budget.current_usage + baseline;
                if mirror.get(&budget.id).copied() != Some(value) {
                    writes.push(UsageWrite::Budget {
                        id: budget.id.clone(),
                        current_usage: value,
                    });
                }
            }
        }

        {
            let mirror = self.last_db_rate_limits.read().unwrap();
            for entry in self.store.rate_limits.iter() {
                let limit = entry.value();
                let token_baseline = baselines
                    .rate_tokens
                    .get(&limit.id)
                    .copied()
                    .unwrap_or(0);
                let request_baseline = baselines
                    .rate_requests
                    .get(&limit.id)
                    .copied()
                    .unwrap_or(0);
                let value = (
                    limit.token_current_usage + token_baseline,
                    limit.request_current_usage + request_baseline,
                );
                if mirror.get(&limit.id).copied() != Some(value) {
                    writes.push(UsageWrite::RateLimit {
                        id: limit.id.clone(),
                        token_current_usage: value.0,
                        request_current_usage: value.1,
                    });
                }
            }
        }

        if writes.is_empty() {
            return;
        }

        match adapter.execute_transaction(&writes).await {
            Ok(()) => {
                let mut budget_mirror = self.last_db_budgets.write().unwrap();
                let mut rate_mirror = self.last_db_rate_limits.write().unwrap();
                for write in &writes {
                    match write {
                        UsageWrite::Budget { id, current_usage } => {
                            budget_mirror.insert(id.clone(), *current_usage);
                        }
                        UsageWrite::RateLimit {
                            id,
                            token_current_usage,
                            request_current_usage,
                        } => {
                            rate_mirror.insert(
                                id.clone(),
                                (*token_current_usage, *request_current_usage),
                            );
                        }
                    }
                }
                metrics::counter!("aegis_flush_writes_total").increment(writes.len() as u64);
                tracing::debug!(writes = writes.len(), "Flushed counters");
            }
            Err(err) if err.is_deadlock() => {
                // Another node is writing these rows; our delta is carried
                // to the next cycle via the baseline mechanism.
                tracing::debug!("Flush deferred: another node is writing");
            }
            Err(err) => {
                metrics::counter!("aegis_flush_failures_total").increment(1);
                tracing::warn!(error = %err, "Flush failed; retrying next cycle");
            }
        }
    }
}
