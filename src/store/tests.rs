use super::*;
use crate::catalog::StaticCatalog;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

fn store() -> CounterStore {
    CounterStore::new(None)
}

fn store_with_catalog() -> CounterStore {
    CounterStore::new(Some(Arc::new(StaticCatalog::default_catalog())))
}

fn eval(provider: Option<&str>, model: Option<&str>) -> EvalRequest {
    EvalRequest {
        virtual_key: None,
        provider: provider.map(String::from),
        model: model.map(String::from),
        request_id: "req-1".to_string(),
    }
}

fn exhausted_budget(id: &str, limit: f64) -> Budget {
    let mut budget = Budget::new(id, limit, "1h");
    budget.current_usage = limit;
    budget
}

/// A VK with optional counters at every level of the hierarchy.
fn hierarchy_fixture(store: &CounterStore) -> VirtualKey {
    store.insert_budget(Budget::new("b-pc", 100.0, "1h"));
    store.insert_budget(Budget::new("b-vk", 100.0, "1h"));
    store.insert_budget(Budget::new("b-team", 100.0, "1h"));
    store.insert_budget(Budget::new("b-cust", 100.0, "1h"));

    store.insert_customer(Customer {
        id: "cust-1".to_string(),
        name: "acme".to_string(),
        budget_id: Some("b-cust".to_string()),
    });
    store.insert_team(Team {
        id: "team-1".to_string(),
        name: "research".to_string(),
        budget_id: Some("b-team".to_string()),
        customer_id: Some("cust-1".to_string()),
    });

    let mut config = ProviderConfig::new("pc-1", "openai");
    config.budget_id = Some("b-pc".to_string());

    let mut vk = VirtualKey::new("vk-1", "sk-test", "test key");
    vk.budget_id = Some("b-vk".to_string());
    vk.team_id = Some("team-1".to_string());
    vk.provider_configs.push(config);
    store.insert_virtual_key(vk.clone());
    vk
}

#[test]
fn test_provider_budget_denies_at_limit() {
    let store = store();
    store.insert_budget(exhausted_budget("b1", 100.0));
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    let err = store
        .check_provider_budget(&eval(Some("openai"), None), None)
        .unwrap_err();
    assert!(matches!(err, Violation::BudgetExceeded { .. }));
    assert!(err.to_string().contains("provider openai"));
}

#[test]
fn test_provider_budget_allows_under_limit() {
    let store = store();
    let mut budget = Budget::new("b1", 100.0, "1h");
    budget.current_usage = 50.0;
    store.insert_budget(budget);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    assert!(store
        .check_provider_budget(&eval(Some("openai"), None), None)
        .is_ok());
}

#[test]
fn test_provider_budget_expired_window_allows() {
    let store = store();
    let mut budget = exhausted_budget("b1", 100.0);
    budget.last_reset = Utc::now() - Duration::hours(2);
    store.insert_budget(budget);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    assert!(store
        .check_provider_budget(&eval(Some("openai"), None), None)
        .is_ok());
}

#[test]
fn test_provider_budget_malformed_duration_fails_open() {
    let store = store();
    let mut budget = exhausted_budget("b1", 100.0);
    budget.reset_duration = "whenever".to_string();
    store.insert_budget(budget);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    assert!(store
        .check_provider_budget(&eval(Some("openai"), None), None)
        .is_ok());
}

#[test]
fn test_baseline_pushes_budget_over_limit() {
    let store = store();
    let mut budget = Budget::new("b1", 100.0, "1h");
    budget.current_usage = 60.0;
    store.insert_budget(budget);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    let mut baselines: BudgetBaselines = HashMap::new();
    baselines.insert("b1".to_string(), 45.0);

    let err = store
        .check_provider_budget(&eval(Some("openai"), None), Some(&baselines))
        .unwrap_err();
    assert!(matches!(
        err,
        Violation::BudgetExceeded { spent, .. } if (spent - 105.0).abs() < 1e-9
    ));
}

#[test]
fn test_rate_limit_token_side_only() {
    let store = store();
    let mut limit = RateLimit::new("r1")
        .with_token_limit(10_000, "1m")
        .with_request_limit(1_000, "1m");
    limit.token_current_usage = 10_000;
    store.insert_rate_limit(limit);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: None,
        rate_limit_id: Some("r1".to_string()),
    });

    let err = store
        .check_provider_rate_limit(&eval(Some("openai"), None), None, None)
        .unwrap_err();
    assert!(matches!(err, Violation::TokenLimited { .. }));
    assert!(err.to_string().contains("token limit exceeded"));
}

#[test]
fn test_rate_limit_both_sides_is_generic() {
    let store = store();
    let mut limit = RateLimit::new("r1")
        .with_token_limit(100, "1m")
        .with_request_limit(10, "1m");
    limit.token_current_usage = 100;
    limit.request_current_usage = 10;
    store.insert_rate_limit(limit);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: None,
        rate_limit_id: Some("r1".to_string()),
    });

    let err = store
        .check_provider_rate_limit(&eval(Some("openai"), None), None, None)
        .unwrap_err();
    assert!(matches!(err, Violation::RateLimited { .. }));
}

#[test]
fn test_rate_limit_expired_side_short_circuits_itself_only() {
    let store = store();
    let mut limit = RateLimit::new("r1")
        .with_token_limit(100, "1m")
        .with_request_limit(10, "1h");
    limit.token_current_usage = 100;
    limit.token_last_reset = Utc::now() - Duration::minutes(5);
    limit.request_current_usage = 10;
    store.insert_rate_limit(limit);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: None,
        rate_limit_id: Some("r1".to_string()),
    });

    // Token window expired, so only the request side flags.
    let err = store
        .check_provider_rate_limit(&eval(Some("openai"), None), None, None)
        .unwrap_err();
    assert!(matches!(err, Violation::RequestLimited { .. }));
}

#[test]
fn test_model_config_provider_scoped_does_not_apply_elsewhere() {
    let store = store();
    store.insert_budget(exhausted_budget("b1", 50.0));
    store.insert_model_config(ModelConfig {
        id: "mc-1".to_string(),
        model_name: "gpt-4o".to_string(),
        provider: Some("openai".to_string()),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    // Same model through another provider is not governed by this config.
    assert!(store
        .check_model_budget(&eval(Some("azure"), Some("gpt-4o")), None)
        .is_ok());
    assert!(store
        .check_model_budget(&eval(Some("openai"), Some("gpt-4o")), None)
        .is_err());
}

#[test]
fn test_model_config_model_only_still_applies() {
    let store = store();
    store.insert_budget(Budget::new("b-scoped", 100.0, "1h"));
    store.insert_budget(exhausted_budget("b-global", 50.0));
    store.insert_model_config(ModelConfig {
        id: "mc-scoped".to_string(),
        model_name: "gpt-4".to_string(),
        provider: Some("openai".to_string()),
        budget_id: Some("b-scoped".to_string()),
        rate_limit_id: None,
    });
    store.insert_model_config(ModelConfig {
        id: "mc-global".to_string(),
        model_name: "gpt-4".to_string(),
        provider: None,
        budget_id: Some("b-global".to_string()),
        rate_limit_id: None,
    });

    // The provider-scoped budget has headroom but the model-only budget is
    // exhausted; both lookups apply.
    let err = store
        .check_model_budget(&eval(Some("openai"), Some("gpt-4")), None)
        .unwrap_err();
    assert!(matches!(err, Violation::BudgetExceeded { .. }));
}

#[test]
fn test_model_config_normalized_lookup() {
    let store = store_with_catalog();
    store.insert_budget(exhausted_budget("b1", 50.0));
    store.insert_model_config(ModelConfig {
        id: "mc-1".to_string(),
        model_name: "gpt-4o".to_string(),
        provider: None,
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    // The prefixed form normalizes to the base name for lookup.
    let err = store
        .check_model_budget(&eval(None, Some("openai/gpt-4o")), None)
        .unwrap_err();
    assert!(matches!(err, Violation::BudgetExceeded { .. }));
}

#[test]
fn test_vk_budget_walk_order_most_specific_first() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    // Exhaust every level; the provider-config violation must surface.
    for id in ["b-pc", "b-vk", "b-team", "b-cust"] {
        let mut budget = store.budget(id).unwrap();
        budget.current_usage = budget.max_limit;
        store.insert_budget(budget);
    }

    let err = store
        .check_vk_budget(&vk, &eval(Some("openai"), None), None)
        .unwrap_err();
    assert!(err.to_string().contains("provider config openai"));

    // Clearing the provider-config budget exposes the VK level next.
    let mut budget = store.budget("b-pc").unwrap();
    budget.current_usage = 0.0;
    store.insert_budget(budget);
    let err = store
        .check_vk_budget(&vk, &eval(Some("openai"), None), None)
        .unwrap_err();
    assert!(err.to_string().contains("virtual key test key"));

    let mut budget = store.budget("b-vk").unwrap();
    budget.current_usage = 0.0;
    store.insert_budget(budget);
    let err = store
        .check_vk_budget(&vk, &eval(Some("openai"), None), None)
        .unwrap_err();
    assert!(err.to_string().contains("team research"));

    let mut budget = store.budget("b-team").unwrap();
    budget.current_usage = 0.0;
    store.insert_budget(budget);
    let err = store
        .check_vk_budget(&vk, &eval(Some("openai"), None), None)
        .unwrap_err();
    assert!(err.to_string().contains("customer acme"));
}

#[test]
fn test_vk_budget_skips_expired_level() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    let mut budget = store.budget("b-vk").unwrap();
    budget.current_usage = budget.max_limit;
    budget.last_reset = Utc::now() - Duration::hours(2);
    store.insert_budget(budget);

    assert!(store
        .check_vk_budget(&vk, &eval(Some("openai"), None), None)
        .is_ok());
}

#[test]
fn test_update_vk_usage_hits_every_level() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    store.update_vk_usage(&vk.value, Some("openai"), 2.5);

    for id in ["b-pc", "b-vk", "b-team", "b-cust"] {
        assert_eq!(store.budget(id).unwrap().current_usage, 2.5, "budget {id}");
    }
}

#[test]
fn test_update_without_provider_skips_provider_config_level() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    store.update_vk_usage(&vk.value, None, 1.0);

    assert_eq!(store.budget("b-pc").unwrap().current_usage, 0.0);
    assert_eq!(store.budget("b-vk").unwrap().current_usage, 1.0);
}

#[test]
fn test_customer_counted_once_when_reachable_twice() {
    let store = store();
    let mut vk = hierarchy_fixture(&store);
    // Point the VK directly at the same customer the team belongs to.
    vk.customer_id = Some("cust-1".to_string());
    store.update_virtual_key(vk.clone());

    store.update_vk_usage(&vk.value, Some("openai"), 3.0);

    assert_eq!(store.budget("b-cust").unwrap().current_usage, 3.0);
}

#[test]
fn test_distinct_customers_both_walked() {
    let store = store();
    let mut vk = hierarchy_fixture(&store);

    store.insert_budget(Budget::new("b-cust2", 100.0, "1h"));
    store.insert_customer(Customer {
        id: "cust-2".to_string(),
        name: "globex".to_string(),
        budget_id: Some("b-cust2".to_string()),
    });
    vk.customer_id = Some("cust-2".to_string());
    store.update_virtual_key(vk.clone());

    store.update_vk_usage(&vk.value, Some("openai"), 3.0);

    assert_eq!(store.budget("b-cust").unwrap().current_usage, 3.0);
    assert_eq!(store.budget("b-cust2").unwrap().current_usage, 3.0);
}

#[test]
fn test_update_lazy_reset_then_increment() {
    let store = store();
    let mut budget = exhausted_budget("b1", 100.0);
    budget.last_reset = Utc::now() - Duration::hours(2);
    store.insert_budget(budget);
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    store.update_provider_and_model_usage(None, Some("openai"), 7.0);

    let budget = store.budget("b1").unwrap();
    assert_eq!(budget.current_usage, 7.0);
    assert!(Utc::now() - budget.last_reset < Duration::minutes(1));
}

#[test]
fn test_update_within_window_does_not_reset_again() {
    let store = store();
    store.insert_budget(Budget::new("b1", 100.0, "1h"));
    store.insert_provider_policy(ProviderPolicy {
        name: "openai".to_string(),
        budget_id: Some("b1".to_string()),
        rate_limit_id: None,
    });

    store.update_provider_and_model_usage(None, Some("openai"), 1.0);
    store.update_provider_and_model_usage(None, Some("openai"), 2.0);

    assert_eq!(store.budget("b1").unwrap().current_usage, 3.0);
}

#[test]
fn test_update_vk_rate_bumps_selected_sides() {
    let store = store();
    store.insert_rate_limit(
        RateLimit::new("r1")
            .with_token_limit(10_000, "1m")
            .with_request_limit(100, "1m"),
    );
    let mut vk = VirtualKey::new("vk-1", "sk-test", "test key");
    vk.rate_limit_id = Some("r1".to_string());
    store.insert_virtual_key(vk);

    store.update_vk_rate("sk-test", None, 500, true, true);
    store.update_vk_rate("sk-test", None, 250, true, false);

    let limit = store.rate_limit("r1").unwrap();
    assert_eq!(limit.token_current_usage, 750);
    assert_eq!(limit.request_current_usage, 1);
}

#[test]
fn test_sweep_resets_expired_budgets() {
    let store = store();
    let mut expired = exhausted_budget("b-old", 100.0);
    expired.last_reset = Utc::now() - Duration::hours(2);
    store.insert_budget(expired);
    store.insert_budget(Budget::new("b-live", 100.0, "1h"));

    let swept = store.sweep_expired_budgets();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, "b-old");
    assert_eq!(swept[0].current_usage, 0.0);

    assert_eq!(store.budget("b-old").unwrap().current_usage, 0.0);

    // Second sweep inside the fresh window finds nothing.
    assert!(store.sweep_expired_budgets().is_empty());
}

#[test]
fn test_sweep_rate_limits_per_side() {
    let store = store();
    let mut limit = RateLimit::new("r1")
        .with_token_limit(100, "1m")
        .with_request_limit(10, "1h");
    limit.token_current_usage = 80;
    limit.token_last_reset = Utc::now() - Duration::minutes(5);
    limit.request_current_usage = 4;
    store.insert_rate_limit(limit);

    let swept = store.sweep_expired_rate_limits();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].token_current_usage, 0);
    // The request window has not elapsed; its usage survives.
    assert_eq!(swept[0].request_current_usage, 4);
}

#[test]
fn test_crud_update_budget_preserves_live_fields() {
    let store = store();
    let mut budget = Budget::new("b1", 100.0, "1h");
    budget.current_usage = 42.0;
    let original_reset = budget.last_reset;
    store.insert_budget(budget);

    store.update_budget(Budget::new("b1", 500.0, "1d"));

    let merged = store.budget("b1").unwrap();
    assert_eq!(merged.max_limit, 500.0);
    assert_eq!(merged.reset_duration, "1d");
    assert_eq!(merged.current_usage, 42.0);
    assert_eq!(merged.last_reset, original_reset);
}

#[test]
fn test_crud_update_rate_limit_preserves_live_fields() {
    let store = store();
    let mut limit = RateLimit::new("r1").with_token_limit(100, "1m");
    limit.token_current_usage = 55;
    store.insert_rate_limit(limit);

    store.update_rate_limit(RateLimit::new("r1").with_token_limit(1_000, "1h"));

    let merged = store.rate_limit("r1").unwrap();
    assert_eq!(merged.token_max_limit, Some(1_000));
    assert_eq!(merged.token_reset_duration.as_deref(), Some("1h"));
    assert_eq!(merged.token_current_usage, 55);
}

#[test]
fn test_delete_team_severs_virtual_keys() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    assert!(store.delete_team("team-1").is_some());
    assert!(store.virtual_key(&vk.value).unwrap().team_id.is_none());
}

#[test]
fn test_delete_customer_severs_teams_and_keys() {
    let store = store();
    let mut vk = hierarchy_fixture(&store);
    vk.customer_id = Some("cust-1".to_string());
    store.update_virtual_key(vk.clone());

    assert!(store.delete_customer("cust-1").is_some());
    assert!(store.virtual_key(&vk.value).unwrap().customer_id.is_none());
    assert!(store.team("team-1").unwrap().customer_id.is_none());
}

#[test]
fn test_governance_data_resolves_live_counters() {
    let store = store();
    let vk = hierarchy_fixture(&store);

    store.update_vk_usage(&vk.value, Some("openai"), 9.0);

    let data = store.governance_data();
    let snapshot = data
        .virtual_keys
        .iter()
        .find(|s| s.virtual_key.value == vk.value)
        .unwrap();
    assert_eq!(snapshot.budget.as_ref().unwrap().current_usage, 9.0);
    assert_eq!(
        snapshot
            .provider_config_budgets
            .get("pc-1")
            .unwrap()
            .current_usage,
        9.0
    );
}
