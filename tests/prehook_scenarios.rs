//! End-to-end pre-hook admission scenarios through the plugin surface.

use aegis::config::GovernanceConfig;
use aegis::gateway::context::{HEADER_VIRTUAL_KEY, KEY_GOVERNANCE_REJECTED};
use aegis::gateway::{ModelRequest, RequestContext};
use aegis::plugin::GovernancePlugin;
use aegis::store::{Budget, ModelConfig, ProviderConfig, ProviderPolicy, RateLimit, VirtualKey};
use std::sync::Arc;

async fn plugin() -> Arc<GovernancePlugin> {
    GovernancePlugin::init(GovernanceConfig::default(), None, None, None)
        .await
        .unwrap()
}

async fn plugin_with(config: GovernanceConfig) -> Arc<GovernancePlugin> {
    GovernancePlugin::init(config, None, None, None).await.unwrap()
}

#[tokio::test]
async fn provider_budget_at_limit_denies_402_without_vk() {
    let plugin = plugin().await;
    let mut budget = Budget::new("b-openai", 100.0, "1d");
    budget.current_usage = 100.0;
    plugin.store().insert_budget(budget);
    plugin.store().insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b-openai".to_string()),
        rate_limit_id: None,
    });

    let ctx = RequestContext::new();
    let err = plugin
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
        .unwrap_err();

    assert_eq!(err.error_type, "budget_exceeded");
    assert_eq!(err.status_code, 402);
    assert!(ctx.get_bool(KEY_GOVERNANCE_REJECTED));

    plugin.cleanup().await;
}

#[tokio::test]
async fn model_token_limit_trips_after_exhausting_request() {
    let plugin = plugin().await;
    plugin.store().insert_rate_limit(
        RateLimit::new("r-gpt4")
            .with_token_limit(10_000, "1h")
            .with_request_limit(1_000, "1h"),
    );
    plugin.store().insert_model_config(ModelConfig {
        id: "mc-gpt4".to_string(),
        model_name: "gpt-4".to_string(),
        provider: None,
        budget_id: None,
        rate_limit_id: Some("r-gpt4".to_string()),
    });

    // First request admits with a fresh counter.
    let ctx = RequestContext::new();
    assert!(plugin.pre_hook(&ctx, ModelRequest::new("openai/gpt-4")).is_ok());

    // It completes having consumed the whole token window.
    plugin.store().update_provider_and_model_rate(
        Some("gpt-4"),
        Some("openai"),
        10_000,
        true,
        true,
    );

    // Still inside the window, the next request is token-limited.
    let ctx = RequestContext::new();
    let err = plugin
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
        .unwrap_err();
    assert_eq!(err.error_type, "token_limited");
    assert_eq!(err.status_code, 429);
    assert!(err.message.contains("token limit exceeded"));

    plugin.cleanup().await;
}

#[tokio::test]
async fn vk_restricted_to_anthropic_blocks_openai() {
    let plugin = plugin().await;
    let mut vk = VirtualKey::new("vk-test", "sk-bf-test", "sk-bf-test");
    let mut config = ProviderConfig::new("pc-anthropic", "anthropic");
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

    plugin.cleanup().await;
}

#[tokio::test]
async fn provider_scoped_model_config_ignores_other_provider() {
    let plugin = plugin().await;
    let mut budget = Budget::new("b-gpt4o-openai", 50.0, "1d");
    budget.current_usage = 50.0;
    plugin.store().insert_budget(budget);
    plugin.store().insert_model_config(ModelConfig {
        id: "mc-gpt4o-openai".to_string(),
        model_name: "gpt-4o".to_string(),
        provider: Some("openai".to_string()),
        budget_id: Some("b-gpt4o-openai".to_string()),
        rate_limit_id: None,
    });

    // Same model through azure is not governed by the openai-scoped config.
    let ctx = RequestContext::new();
    assert!(plugin.pre_hook(&ctx, ModelRequest::new("azure/gpt-4o")).is_ok());

    // Through openai it denies.
    let ctx = RequestContext::new();
    let err = plugin
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4o"))
        .unwrap_err();
    assert_eq!(err.error_type, "budget_exceeded");

    plugin.cleanup().await;
}

#[tokio::test]
async fn model_only_config_applies_alongside_provider_scoped() {
    let plugin = plugin().await;
    plugin.store().insert_budget(Budget::new("b-scoped", 100.0, "1d"));
    let mut global = Budget::new("b-global", 50.0, "1d");
    global.current_usage = 50.0;
    plugin.store().insert_budget(global);
    plugin.store().insert_model_config(ModelConfig {
        id: "mc-scoped".to_string(),
        model_name: "gpt-4".to_string(),
        provider: Some("openai".to_string()),
        budget_id: Some("b-scoped".to_string()),
        rate_limit_id: None,
    });
    plugin.store().insert_model_config(ModelConfig {
        id: "mc-global".to_string(),
        model_name: "gpt-4".to_string(),
        provider: None,
        budget_id: Some("b-global".to_string()),
        rate_limit_id: None,
    });

    // The provider-scoped budget has headroom; the exhausted model-only
    // budget still denies.
    let ctx = RequestContext::new();
    let err = plugin
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
        .unwrap_err();
    assert_eq!(err.error_type, "budget_exceeded");

    plugin.cleanup().await;
}

#[tokio::test]
async fn missing_vk_respects_mandatory_flag() {
    let strict = plugin_with(GovernanceConfig {
        is_vk_mandatory: true,
        ..Default::default()
    })
    .await;

    let ctx = RequestContext::new();
    let err = strict
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
        .unwrap_err();
    assert_eq!(err.error_type, "virtual_key_required");
    assert_eq!(err.status_code, 400);
    strict.cleanup().await;

    let relaxed = plugin_with(GovernanceConfig {
        is_vk_mandatory: false,
        ..Default::default()
    })
    .await;

    let ctx = RequestContext::new();
    assert!(relaxed
        .pre_hook(&ctx, ModelRequest::new("openai/gpt-4"))
        .is_ok());
    relaxed.cleanup().await;
}
