//! Plugin hook surface.
//!
//! Three boundary entry points the host gateway invokes in order:
//! transport intercept (raw headers/body), pre-hook (admission decision),
//! post-hook (accounting). `init` loads state from the durable store and
//! starts the background workers; `cleanup` is the single teardown point.

mod transport;

use crate::adapter::ConfigAdapter;
use crate::catalog::ModelCatalog;
use crate::config::GovernanceConfig;
use crate::gateway::context::{
    HEADER_CUSTOMER, HEADER_TEAM, HEADER_VIRTUAL_KEY, KEY_GOVERNANCE_REJECTED, KEY_REQUEST_ID,
};
use crate::gateway::{ModelRequest, RequestContext, ShortCircuit, UpstreamResponse};
use crate::resolver::{
    BaselineProvider, BaselineSet, Decision, Resolver, Verdict, DEFAULT_DENY_MESSAGE,
};
use crate::store::{CounterStore, EvalRequest};
use crate::tracker::UsageTracker;
use anyhow::Context;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The governance plugin instance; the only process-wide state, confined
/// behind its cancellation lifecycle.
pub struct GovernancePlugin {
    config: GovernanceConfig,
    store: Arc<CounterStore>,
    resolver: Resolver,
    tracker: Arc<UsageTracker>,
    baselines: Option<Arc<dyn BaselineProvider>>,
    cancel: CancellationToken,
}

impl GovernancePlugin {
    /// Load governance state and start the background workers.
    ///
    /// A load failure from the durable store is fatal; a deployment
    /// without an adapter starts empty and runs purely in-memory.
    pub async fn init(
        config: GovernanceConfig,
        adapter: Option<Arc<dyn ConfigAdapter>>,
        catalog: Option<Arc<dyn ModelCatalog>>,
        baselines: Option<Arc<dyn BaselineProvider>>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid governance config")?;

        let store = Arc::new(CounterStore::new(catalog.clone()));
        if let Some(adapter) = &adapter {
            Self::load_state(&store, adapter.as_ref())
                .await
                .context("loading governance state from durable store")?;
        }

        let cancel = CancellationToken::new();
        let tracker = Arc::new(UsageTracker::new(
            Arc::clone(&store),
            adapter.clone(),
            catalog,
            baselines.clone(),
            cancel.child_token(),
        ));

        if adapter.is_some() {
            tracker.startup_reset().await;
        }
        tracker.start_background(
            Duration::from_secs(config.flush_interval_seconds),
            Duration::from_secs(config.sweep_interval_seconds),
        );

        tracing::info!(
            virtual_keys = store.virtual_key_count(),
            budgets = store.budget_count(),
            rate_limits = store.rate_limit_count(),
            is_vk_mandatory = config.is_vk_mandatory,
            "Governance plugin initialized"
        );

        Ok(Arc::new(Self {
            config,
            resolver: Resolver::new(Arc::clone(&store)),
            store,
            tracker,
            baselines,
            cancel,
        }))
    }

    async fn load_state(
        store: &CounterStore,
        adapter: &dyn ConfigAdapter,
    ) -> anyhow::Result<()> {
        for budget in adapter.load_budgets().await? {
            store.insert_budget(budget);
        }
        for limit in adapter.load_rate_limits().await? {
            store.insert_rate_limit(limit);
        }
        for customer in adapter.load_customers().await? {
            store.insert_customer(customer);
        }
        for team in adapter.load_teams().await? {
            store.insert_team(team);
        }
        for vk in adapter.load_virtual_keys().await? {
            store.insert_virtual_key(vk);
        }
        for config in adapter.load_model_configs().await? {
            store.insert_model_config(config);
        }
        for policy in adapter.load_provider_policies().await? {
            store.insert_provider_policy(policy);
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    /// Admission decision point. Runs synchronously on the request path;
    /// in-memory lookups only. On deny, flags the context and returns the
    /// short-circuit error; the gateway never calls the upstream.
    pub fn pre_hook(
        &self,
        ctx: &RequestContext,
        request: ModelRequest,
    ) -> Result<ModelRequest, ShortCircuit> {
        let vk_value = ctx.get_str(HEADER_VIRTUAL_KEY);
        let request_id = ctx
            .get_str(KEY_REQUEST_ID)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if vk_value.is_none() && self.config.is_vk_mandatory {
            ctx.set_bool(KEY_GOVERNANCE_REJECTED, true);
            return Err(ShortCircuit::new(
                Decision::VirtualKeyRequired.as_str(),
                Decision::VirtualKeyRequired.status_code(),
                "virtual key required",
            ));
        }

        let (provider, model) = request.provider_and_model();
        let eval = EvalRequest {
            virtual_key: vk_value.clone(),
            provider: provider.map(String::from),
            model: Some(model.to_string()),
            request_id: request_id.clone(),
        };

        let baselines: Option<BaselineSet> = self.baselines.as_ref().map(|b| b.baselines());
        let verdict = match catch_unwind(AssertUnwindSafe(|| {
            let verdict = self
                .resolver
                .evaluate_model_provider(&eval, baselines.as_ref());
            if !verdict.is_allow() {
                return verdict;
            }
            match &vk_value {
                Some(vk) => self
                    .resolver
                    .evaluate_virtual_key(vk, &eval, ctx, baselines.as_ref()),
                None => Verdict::allow(),
            }
        })) {
            Ok(verdict) => verdict,
            Err(_) => {
                // The pre-hook never surfaces an infrastructure error;
                // a resolver failure degrades to a generic deny.
                tracing::error!(request_id = %request_id, "Resolver panicked; denying request");
                ctx.set_bool(KEY_GOVERNANCE_REJECTED, true);
                return Err(ShortCircuit::new(
                    "governance_denied",
                    403,
                    DEFAULT_DENY_MESSAGE,
                ));
            }
        };

        if self.config.logging.log_decisions {
            tracing::debug!(
                request_id = %request_id,
                decision = %verdict.decision,
                model = %request.model,
                team = ctx.get_str(HEADER_TEAM).as_deref().unwrap_or("-"),
                customer = ctx.get_str(HEADER_CUSTOMER).as_deref().unwrap_or("-"),
                "Admission decision"
            );
        }

        match verdict.short_circuit() {
            Some(short_circuit) => {
                ctx.set_bool(KEY_GOVERNANCE_REJECTED, true);
                metrics::counter!(
                    "aegis_denied_total",
                    "decision" => verdict.decision.as_str()
                )
                .increment(1);
                Err(short_circuit)
            }
            None => {
                metrics::counter!("aegis_allowed_total").increment(1);
                Ok(request)
            }
        }
    }

    /// Accounting entry point. Returns immediately; counters update on a
    /// detached worker. Never surfaces an error to the gateway. A `None`
    /// response (upstream failure) is not accounted.
    pub fn post_hook(&self, ctx: &RequestContext, response: Option<UpstreamResponse>) {
        if let Some(response) = response {
            self.tracker.record(ctx.clone(), response);
        }
    }

    /// Single teardown point: drain post-hook workers, stop the flusher
    /// and sweeper, flush one final time.
    pub async fn cleanup(&self) {
        self.tracker.shutdown().await;
        self.cancel.cancel();
        tracing::info!("Governance plugin stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Budget, ProviderPolicy, RateLimit, VirtualKey};

    async fn plugin(config: GovernanceConfig) -> Arc<GovernancePlugin> {
        GovernancePlugin::init(config, None, None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pre_hook_allows_unknown_provider_without_policies() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let ctx = RequestContext::new();
        let request = ModelRequest::new("openai/gpt-4");
        assert!(plugin.pre_hook(&ctx, request).is_ok());
        assert!(!ctx.get_bool(KEY_GOVERNANCE_REJECTED));
    }

    #[tokio::test]
    async fn test_pre_hook_provider_budget_exhausted_402() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let mut budget = Budget::new("b1", 100.0, "1h");
        budget.current_usage = 100.0;
        plugin.store().insert_budget(budget);
        plugin.store().insert_provider_policy(ProviderPolicy {
            name: "openai".to_string(),
            budget_id: Some("b1".to_string()),
            rate_limit_id: None,
        });

        let ctx = RequestContext::new();
        let err = plugin
            .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
            .unwrap_err();
        assert_eq!(err.error_type, "budget_exceeded");
        assert_eq!(err.status_code, 402);
        assert!(ctx.get_bool(KEY_GOVERNANCE_REJECTED));
    }

    #[tokio::test]
    async fn test_pre_hook_model_token_limit_429() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let mut limit = RateLimit::new("r1")
            .with_token_limit(10_000, "1h")
            .with_request_limit(1_000, "1h");
        limit.token_current_usage = 10_000;
        plugin.store().insert_rate_limit(limit);
        plugin.store().insert_model_config(crate::store::ModelConfig {
            id: "mc1".to_string(),
            model_name: "gpt-4".to_string(),
            provider: None,
            budget_id: None,
            rate_limit_id: Some("r1".to_string()),
        });

        let ctx = RequestContext::new();
        let err = plugin
            .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
            .unwrap_err();
        assert_eq!(err.error_type, "token_limited");
        assert_eq!(err.status_code, 429);
        assert!(err.message.contains("token limit exceeded"));
    }

    #[tokio::test]
    async fn test_pre_hook_vk_mandatory_400() {
        let plugin = plugin(GovernanceConfig {
            is_vk_mandatory: true,
            ..Default::default()
        })
        .await;

        let ctx = RequestContext::new();
        let err = plugin
            .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
            .unwrap_err();
        assert_eq!(err.error_type, "virtual_key_required");
        assert_eq!(err.status_code, 400);
    }

    #[tokio::test]
    async fn test_pre_hook_vk_optional_runs_model_checks_only() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let ctx = RequestContext::new();
        assert!(plugin
            .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_pre_hook_provider_blocked_403() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let mut vk = VirtualKey::new("vk1", "sk-bf-test", "test key");
        let mut config = crate::store::ProviderConfig::new("pc1", "anthropic");
        config.allowed_models = vec!["claude-3-sonnet".to_string()];
        vk.provider_configs.push(config);
        plugin.store().insert_virtual_key(vk);

        let ctx = RequestContext::new();
        ctx.set_str(HEADER_VIRTUAL_KEY, "sk-bf-test");
        let err = plugin
            .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
            .unwrap_err();
        assert_eq!(err.error_type, "provider_blocked");
        assert_eq!(err.status_code, 403);
        assert!(err.message.contains("not allowed"));
    }

    #[tokio::test]
    async fn test_post_hook_none_response_is_noop() {
        let plugin = plugin(GovernanceConfig::default()).await;
        let ctx = RequestContext::new();
        plugin.post_hook(&ctx, None);
        plugin.cleanup().await;
    }

    #[tokio::test]
    async fn test_init_loads_from_adapter() {
        let adapter = Arc::new(crate::adapter::MemoryAdapter::new());
        adapter.seed_budgets(vec![Budget::new("b1", 100.0, "1h")]);
        adapter.seed_virtual_keys(vec![VirtualKey::new("vk1", "sk-seeded", "seeded")]);

        let plugin = GovernancePlugin::init(
            GovernanceConfig::default(),
            Some(adapter as Arc<dyn ConfigAdapter>),
            None,
            None,
        )
        .await
        .unwrap();

        assert!(plugin.store().budget("b1").is_some());
        assert!(plugin.store().virtual_key("sk-seeded").is_some());
        plugin.cleanup().await;
    }
}
