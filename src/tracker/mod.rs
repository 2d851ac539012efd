//! Usage Tracker module.
//!
//! Owns post-request accounting: cost calculation, counter updates across
//! the hierarchy, startup reset, and the background flusher and sweeper.
//! The post-hook returns immediately to the gateway; accounting runs on a
//! detached worker tracked for clean shutdown.

mod flush;

use crate::adapter::ConfigAdapter;
use crate::catalog::ModelCatalog;
use crate::gateway::context::{
    HEADER_VIRTUAL_KEY, KEY_GOVERNANCE_REJECTED, KEY_IS_BATCH, KEY_IS_CACHE_READ,
};
use crate::gateway::{RequestContext, UpstreamResponse};
use crate::resolver::{BaselineProvider, NoBaselines};
use crate::store::CounterStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Tracks usage after upstream calls complete and reconciles counters with
/// the durable store.
pub struct UsageTracker {
    store: Arc<CounterStore>,
    adapter: Option<Arc<dyn ConfigAdapter>>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    baselines: Arc<dyn BaselineProvider>,
    cancel: CancellationToken,
    workers: TaskTracker,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Mirror of the budget usage values the flusher last wrote, keyed by
    /// budget ID. Guarded separately from the rate-limit mirror; locks are
    /// held only for a single replace, never across I/O.
    last_db_budgets: RwLock<HashMap<String, f64>>,
    /// Mirror of (token, request) usage values last written per rate limit.
    last_db_rate_limits: RwLock<HashMap<String, (i64, i64)>>,
}

impl UsageTracker {
    pub fn new(
        store: Arc<CounterStore>,
        adapter: Option<Arc<dyn ConfigAdapter>>,
        catalog: Option<Arc<dyn ModelCatalog>>,
        baselines: Option<Arc<dyn BaselineProvider>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            adapter,
            catalog,
            baselines: baselines.unwrap_or_else(|| Arc::new(NoBaselines)),
            cancel,
            workers: TaskTracker::new(),
            background: Mutex::new(Vec::new()),
            last_db_budgets: RwLock::new(HashMap::new()),
            last_db_rate_limits: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// One synchronous sweep so counters whose windows expired during
    /// downtime start at zero. Runs at init when durable storage is
    /// present; persistence failures are logged, not fatal.
    pub async fn startup_reset(&self) {
        let Some(adapter) = &self.adapter else {
            return;
        };

        let budgets = self.store.sweep_expired_budgets();
        let rate_limits = self.store.sweep_expired_rate_limits();
        if budgets.is_empty() && rate_limits.is_empty() {
            return;
        }

        tracing::info!(
            budgets = budgets.len(),
            rate_limits = rate_limits.len(),
            "Resetting counters whose windows expired during downtime"
        );
        if let Err(err) = adapter.persist_budget_resets(&budgets).await {
            tracing::warn!(error = %err, "Failed to persist startup budget resets");
        }
        if let Err(err) = adapter.persist_rate_limit_resets(&rate_limits).await {
            tracing::warn!(error = %err, "Failed to persist startup rate-limit resets");
        }
    }

    /// Fire-and-forget accounting for one completed request. Returns to
    /// the caller immediately; the worker is tracked for shutdown drain.
    ///
    /// The worker receives only the context values it needs; the request's
    /// own lifetime may end as soon as the gateway returns to its caller.
    pub fn record(self: &Arc<Self>, ctx: RequestContext, response: UpstreamResponse) {
        // A pre-hook denial never reaches the upstream; nothing to account.
        if ctx.get_bool(KEY_GOVERNANCE_REJECTED) {
            metrics::counter!("aegis_accounting_skipped_total").increment(1);
            return;
        }

        let tracker = Arc::clone(self);
        self.workers.spawn(async move {
            tracker.account(&ctx, &response);
        });
    }

    /// Apply one response to every applicable counter.
    fn account(&self, ctx: &RequestContext, response: &UpstreamResponse) {
        // Streaming responses are accounted exactly once, on the terminal
        // chunk carrying the usage block.
        if !response.should_account() {
            return;
        }

        let tokens = response.tokens_used() as i64;
        let cost = match &self.catalog {
            Some(catalog) => catalog.cost(
                response,
                ctx.get_bool(KEY_IS_CACHE_READ),
                ctx.get_bool(KEY_IS_BATCH),
            ),
            None => 0.0,
        };

        let (provider, model) = response.provider_and_model();
        let vk_value = ctx.get_str(HEADER_VIRTUAL_KEY);

        if let Some(vk_value) = &vk_value {
            self.store.update_vk_usage(vk_value, provider, cost);
            self.store
                .update_vk_rate(vk_value, provider, tokens, true, true);
        }
        self.store
            .update_provider_and_model_usage(Some(model), provider, cost);
        self.store
            .update_provider_and_model_rate(Some(model), provider, tokens, true, true);

        metrics::counter!("aegis_accounting_total").increment(1);
        tracing::debug!(
            model = %model,
            provider = provider.unwrap_or("-"),
            tokens,
            cost_usd = cost,
            "Recorded usage"
        );
    }

    /// Start the background flusher and sweeper.
    pub fn start_background(
        self: &Arc<Self>,
        flush_interval: Duration,
        sweep_interval: Duration,
    ) {
        let mut background = self.background.lock().unwrap();
        background.push(Arc::clone(self).spawn_flusher(flush_interval));
        background.push(Arc::clone(self).spawn_sweeper(sweep_interval));
    }

    fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(interval_seconds = interval.as_secs(), "Sweeper started");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::info!("Sweeper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.sweep_and_persist().await;
                    }
                }
            }
        })
    }

    /// Run both sweeps and forward the transitioned counters for direct
    /// UPDATE of the reset fields.
    async fn sweep_and_persist(&self) {
        let budgets = self.store.sweep_expired_budgets();
        let rate_limits = self.store.sweep_expired_rate_limits();

        let Some(adapter) = &self.adapter else {
            return;
        };
        if !budgets.is_empty() {
            if let Err(err) = adapter.persist_budget_resets(&budgets).await {
                if err.is_deadlock() {
                    tracing::debug!("Budget reset write deferred: another node is writing");
                } else {
                    tracing::warn!(error = %err, "Failed to persist budget resets");
                }
            }
        }
        if !rate_limits.is_empty() {
            if let Err(err) = adapter.persist_rate_limit_resets(&rate_limits).await {
                if err.is_deadlock() {
                    tracing::debug!("Rate-limit reset write deferred: another node is writing");
                } else {
                    tracing::warn!(error = %err, "Failed to persist rate-limit resets");
                }
            }
        }
    }

    /// Wait for in-flight accounting workers to finish without stopping
    /// the tracker.
    pub async fn drain(&self) {
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }

    /// Drain workers, stop background tasks, and flush one final time.
    pub async fn shutdown(&self) {
        self.workers.close();
        self.workers.wait().await;

        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Background task panicked during shutdown");
            }
        }

        self.flush_once().await;
        tracing::info!("Usage tracker stopped");
    }
}
