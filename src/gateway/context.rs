//! Request context contract.
//!
//! The gateway threads a string-keyed slot map through every hook. The keys
//! below are the observable contract: downstream plugins read the identity
//! facts the resolver publishes, and sibling plugins set the pricing-tier
//! hints the tracker consumes.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Header carrying the virtual-key secret (matched case-insensitively).
pub const HEADER_VIRTUAL_KEY: &str = "bf-vk";
/// Correlation ID for the request.
pub const KEY_REQUEST_ID: &str = "bf-request-id";
/// Optional audit identifier headers.
pub const HEADER_TEAM: &str = "bf-team";
pub const HEADER_CUSTOMER: &str = "bf-customer";

/// Set when the pre-hook denies; the post-hook skips accounting.
pub const KEY_GOVERNANCE_REJECTED: &str = "bf-governance-rejected";
/// Pricing-tier hints set by other plugins.
pub const KEY_IS_CACHE_READ: &str = "bf-governance-is-cache-read";
pub const KEY_IS_BATCH: &str = "bf-governance-is-batch";

/// Identity surface published by the resolver on Allow.
pub const KEY_VIRTUAL_KEY_ID: &str = "bf-governance-virtual-key-id";
pub const KEY_VIRTUAL_KEY_NAME: &str = "bf-governance-virtual-key-name";
pub const KEY_TEAM_ID: &str = "bf-governance-team-id";
pub const KEY_TEAM_NAME: &str = "bf-governance-team-name";
pub const KEY_CUSTOMER_ID: &str = "bf-governance-customer-id";
pub const KEY_CUSTOMER_NAME: &str = "bf-governance-customer-name";
/// Per-VK-per-provider upstream credential allow-list.
pub const KEY_INCLUDE_ONLY_KEYS: &str = "bf-governance-include-only-keys";

/// Header injected by the transport intercept with per-client tool
/// include-lists (`client/tool`, `client/*` for all tools of a client).
pub const HEADER_MCP_INCLUDE_TOOLS: &str = "x-bf-mcp-include-tools";

/// String-keyed context slots shared across the hooks of one request.
///
/// Cheap to clone; clones observe the same slots. The post-hook worker
/// carries a clone rather than the request's own context, which the gateway
/// may cancel as soon as it returns to its caller.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    slots: Arc<DashMap<String, Value>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.slots.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.slots.get(key).map(|v| v.value().clone())
    }

    pub fn set_str(&self, key: &str, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    /// Missing or non-boolean slots read as false.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    pub fn set_str_list(&self, key: &str, values: &[String]) {
        self.set(
            key,
            Value::Array(values.iter().map(|v| Value::String(v.clone())).collect()),
        );
    }

    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key) {
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}
