//! Transport intercept: raw header/body rewriting before deserialization.
//!
//! Resolves the virtual key from its header, picks a provider for
//! unprefixed models by weighted random over the key's provider configs
//! (skipping providers already over budget or rate limit), appends a
//! fallbacks list, and composes the MCP tool include-list header.

use super::GovernancePlugin;
use crate::gateway::context::{HEADER_MCP_INCLUDE_TOOLS, HEADER_VIRTUAL_KEY};
use crate::gateway::RequestContext;
use crate::store::{EvalRequest, ProviderConfig, VirtualKey};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use rand::Rng;

impl GovernancePlugin {
    /// Earliest hook: operates on raw headers and the undeserialized JSON
    /// body. Infallible by design; malformed inputs are left untouched.
    pub fn transport_intercept(
        &self,
        ctx: &RequestContext,
        _url: &str,
        headers: &mut HeaderMap,
        body: &mut serde_json::Value,
    ) {
        // HeaderMap lookups are case-insensitive by construction.
        let Some(vk_value) = headers
            .get(HEADER_VIRTUAL_KEY)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
        else {
            return;
        };
        ctx.set_str(HEADER_VIRTUAL_KEY, &vk_value);

        let Some(vk) = self.store().virtual_key(&vk_value) else {
            return;
        };

        self.rewrite_model(&vk, body);
        self.inject_tool_includes(&vk, headers);
    }

    /// Prefix an unprefixed `model` with a provider chosen by weighted
    /// random over the key's viable provider configs, and append a
    /// fallbacks list when more than one provider remains.
    fn rewrite_model(&self, vk: &VirtualKey, body: &mut serde_json::Value) {
        let Some(model) = body.get("model").and_then(|m| m.as_str()) else {
            return;
        };
        if model.contains('/') {
            return;
        }
        let model = model.to_string();

        let viable = self.viable_provider_configs(vk, &model);
        let Some(selected) = weighted_pick(&viable) else {
            return;
        };

        body["model"] = serde_json::Value::String(format!("{}/{}", selected.provider, model));

        if viable.len() > 1 && body.get("fallbacks").is_none() {
            let mut others: Vec<&ProviderConfig> = viable
                .iter()
                .copied()
                .filter(|c| c.id != selected.id)
                .collect();
            others.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            body["fallbacks"] = serde_json::Value::Array(
                others
                    .iter()
                    .map(|c| serde_json::Value::String(format!("{}/{}", c.provider, model)))
                    .collect(),
            );
        }
    }

    /// Provider configs that admit the model and whose provider-level
    /// counters are not already violated (fast in-memory check).
    fn viable_provider_configs<'a>(
        &self,
        vk: &'a VirtualKey,
        model: &str,
    ) -> Vec<&'a ProviderConfig> {
        vk.provider_configs
            .iter()
            .filter(|config| {
                if !config.allowed_models.is_empty()
                    && !config.allowed_models.iter().any(|allowed| allowed == model)
                {
                    return false;
                }

                let eval = EvalRequest {
                    virtual_key: Some(vk.value.clone()),
                    provider: Some(config.provider.clone()),
                    model: Some(model.to_string()),
                    request_id: String::new(),
                };
                let store = self.store();
                if store.check_provider_budget(&eval, None).is_err() {
                    return false;
                }
                if store.check_provider_rate_limit(&eval, None, None).is_err() {
                    return false;
                }
                true
            })
            .collect()
    }

    /// Compose `x-bf-mcp-include-tools` from the key's per-client tool
    /// include-lists. An empty or `*` list for a client collapses to
    /// `client/*`.
    fn inject_tool_includes(&self, vk: &VirtualKey, headers: &mut HeaderMap) {
        if vk.mcp_include_tools.is_empty() {
            return;
        }

        let mut clients: Vec<&String> = vk.mcp_include_tools.keys().collect();
        clients.sort();

        let mut entries: Vec<String> = Vec::new();
        for client in clients {
            let tools = &vk.mcp_include_tools[client];
            if tools.is_empty() || tools.iter().any(|t| t == "*") {
                entries.push(format!("{}/*", client));
            } else {
                for tool in tools {
                    entries.push(format!("{}/{}", client, tool));
                }
            }
        }

        match HeaderValue::from_str(&entries.join(",")) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(HEADER_MCP_INCLUDE_TOOLS), value);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Skipping tool include header: invalid value");
            }
        }
    }
}

/// Weighted random selection; non-positive total weight falls back to the
/// first config.
fn weighted_pick<'a>(configs: &[&'a ProviderConfig]) -> Option<&'a ProviderConfig> {
    if configs.is_empty() {
        return None;
    }

    let total: f64 = configs.iter().map(|c| c.weight.max(0.0)).sum();
    if total <= 0.0 {
        return Some(configs[0]);
    }

    let mut roll = rand::rng().random_range(0.0..total);
    for config in configs {
        roll -= config.weight.max(0.0);
        if roll < 0.0 {
            return Some(config);
        }
    }
    Some(configs[configs.len() - 1])
}
