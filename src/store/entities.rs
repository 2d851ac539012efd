//! Policy entities held by the counter store.
//!
//! All entities are identified by opaque string IDs and owned by-value
//! inside the store's tables. Budgets and rate limits are the live
//! counters; the rest reference them by ID.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error parsing a reset interval string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reset interval '{0}'")]
pub struct IntervalParseError(pub String);

/// Parse a reset interval like `30s`, `1m`, `1h`, `1d`, `1w`.
pub fn parse_interval(s: &str) -> Result<Duration, IntervalParseError> {
    let s = s.trim();
    let split = s.len().checked_sub(1).ok_or_else(|| IntervalParseError(s.to_string()))?;
    if !s.is_char_boundary(split) {
        return Err(IntervalParseError(s.to_string()));
    }
    let (value, unit) = s.split_at(split);
    let value: i64 = value
        .parse()
        .map_err(|_| IntervalParseError(s.to_string()))?;
    if value <= 0 {
        return Err(IntervalParseError(s.to_string()));
    }
    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        "w" => Ok(Duration::weeks(value)),
        _ => Err(IntervalParseError(s.to_string())),
    }
}

/// A monetary cap over a resetting time window.
///
/// `current_usage` grows monotonically until the window expires, at which
/// point the next check or update observes it as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    /// Cap in USD; non-negative.
    pub max_limit: f64,
    pub current_usage: f64,
    /// Interval string (`1m`, `1h`, `1d`, `1w`).
    pub reset_duration: String,
    pub last_reset: DateTime<Utc>,
}

impl Budget {
    pub fn new(id: impl Into<String>, max_limit: f64, reset_duration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_limit,
            current_usage: 0.0,
            reset_duration: reset_duration.into(),
            last_reset: Utc::now(),
        }
    }

    /// Whether the window has elapsed. A malformed `reset_duration`
    /// surfaces the parse error so callers can fail open for this counter.
    pub fn window_expired(&self, now: DateTime<Utc>) -> Result<bool, IntervalParseError> {
        let duration = parse_interval(&self.reset_duration)?;
        Ok(now - self.last_reset >= duration)
    }

    /// Usage including a remote-node baseline.
    pub fn effective_usage(&self, baseline: f64) -> f64 {
        self.current_usage + baseline
    }
}

/// Paired token/request caps over independently resetting windows.
///
/// A `None` max on either side disables that side's cap; a `None` reset
/// duration means that side's window never expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: String,

    pub token_max_limit: Option<i64>,
    pub token_current_usage: i64,
    pub token_reset_duration: Option<String>,
    pub token_last_reset: DateTime<Utc>,

    pub request_max_limit: Option<i64>,
    pub request_current_usage: i64,
    pub request_reset_duration: Option<String>,
    pub request_last_reset: DateTime<Utc>,
}

impl RateLimit {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            token_max_limit: None,
            token_current_usage: 0,
            token_reset_duration: None,
            token_last_reset: now,
            request_max_limit: None,
            request_current_usage: 0,
            request_reset_duration: None,
            request_last_reset: now,
        }
    }

    pub fn with_token_limit(mut self, max: i64, reset_duration: impl Into<String>) -> Self {
        self.token_max_limit = Some(max);
        self.token_reset_duration = Some(reset_duration.into());
        self
    }

    pub fn with_request_limit(mut self, max: i64, reset_duration: impl Into<String>) -> Self {
        self.request_max_limit = Some(max);
        self.request_reset_duration = Some(reset_duration.into());
        self
    }

    /// Whether the token-side window has elapsed. `None` duration never
    /// expires.
    pub fn token_window_expired(&self, now: DateTime<Utc>) -> Result<bool, IntervalParseError> {
        match &self.token_reset_duration {
            Some(d) => Ok(now - self.token_last_reset >= parse_interval(d)?),
            None => Ok(false),
        }
    }

    /// Whether the request-side window has elapsed.
    pub fn request_window_expired(&self, now: DateTime<Utc>) -> Result<bool, IntervalParseError> {
        match &self.request_reset_duration {
            Some(d) => Ok(now - self.request_last_reset >= parse_interval(d)?),
            None => Ok(false),
        }
    }
}

/// Per-VK policy for one upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub provider: String,
    /// Models this config admits; empty means all.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Relative weight for load balancing across a VK's providers.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub budget_id: Option<String>,
    pub rate_limit_id: Option<String>,
    /// Ordered upstream credential IDs this config may use.
    #[serde(default)]
    pub credential_ids: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            allowed_models: Vec::new(),
            weight: 1.0,
            budget_id: None,
            rate_limit_id: None,
            credential_ids: Vec::new(),
        }
    }
}

/// The principal presenting a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: String,
    /// The opaque secret the client presents.
    pub value: String,
    pub name: String,
    pub is_active: bool,
    pub budget_id: Option<String>,
    pub rate_limit_id: Option<String>,
    pub team_id: Option<String>,
    pub customer_id: Option<String>,
    #[serde(default)]
    pub provider_configs: Vec<ProviderConfig>,
    /// Per-MCP-client tool include-lists; `*` in the list admits every
    /// tool of that client.
    #[serde(default)]
    pub mcp_include_tools: HashMap<String, Vec<String>>,
}

impl VirtualKey {
    pub fn new(
        id: impl Into<String>,
        value: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            name: name.into(),
            is_active: true,
            budget_id: None,
            rate_limit_id: None,
            team_id: None,
            customer_id: None,
            provider_configs: Vec::new(),
            mcp_include_tools: HashMap::new(),
        }
    }

    /// The provider config matching a provider name, case-insensitively.
    pub fn provider_config(&self, provider: &str) -> Option<&ProviderConfig> {
        self.provider_configs
            .iter()
            .find(|c| c.provider.eq_ignore_ascii_case(provider))
    }
}

/// Optional grouping of virtual keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub budget_id: Option<String>,
    pub customer_id: Option<String>,
}

/// Top-level grouping of teams and virtual keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub budget_id: Option<String>,
}

/// Global per-provider governance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub name: String,
    pub budget_id: Option<String>,
    pub rate_limit_id: Option<String>,
}

/// Global per-model governance, optionally scoped to one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub model_name: String,
    pub provider: Option<String>,
    pub budget_id: Option<String>,
    pub rate_limit_id: Option<String>,
}

impl ModelConfig {
    /// Composite table key: `model` or `model@provider`.
    pub fn key_for(model: &str, provider: Option<&str>) -> String {
        match provider {
            Some(p) => format!("{}@{}", model, p),
            None => model.to_string(),
        }
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.model_name, self.provider.as_deref())
    }
}
