//! Boundary types exchanged with the host gateway.
//!
//! The gateway itself (routing, upstream HTTP, streaming transport) lives
//! outside this crate; these types are the in-process contract it shares
//! with the governance hooks.

pub mod context;
pub mod error;

pub use context::RequestContext;
pub use error::ShortCircuit;

use serde::{Deserialize, Serialize};

/// Token usage statistics carried by an upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The outbound model request as the pre-hook sees it, after the gateway
/// deserialized the body.
///
/// `model` may carry a `provider/` prefix (e.g. `openai/gpt-4o`); the
/// transport intercept writes that prefix when the client omitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,

    #[serde(default)]
    pub stream: bool,

    /// Ordered provider fallbacks, populated by the transport intercept
    /// when more than one provider remains viable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,

    /// Remaining request body fields, passed through untouched.
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            stream: false,
            fallbacks: Vec::new(),
            body: serde_json::Map::new(),
        }
    }

    /// Split `provider/model` into its parts. A model without a prefix
    /// yields `(None, model)`.
    pub fn provider_and_model(&self) -> (Option<&str>, &str) {
        match self.model.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                (Some(provider), model)
            }
            _ => (None, self.model.as_str()),
        }
    }
}

/// Shape of the upstream response handed to the post-hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// A complete, non-streaming response.
    Complete,
    /// One chunk of a streaming response. Only the terminal chunk carries
    /// the usage block.
    StreamChunk { final_chunk: bool },
}

/// Upstream response (or terminal stream chunk) seen by the post-hook.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Model identifier as reported by the upstream, possibly
    /// provider-prefixed.
    pub model: String,
    pub kind: ResponseKind,
    pub usage: Option<TokenUsage>,
}

impl UpstreamResponse {
    pub fn complete(model: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            model: model.into(),
            kind: ResponseKind::Complete,
            usage,
        }
    }

    pub fn chunk(model: impl Into<String>, final_chunk: bool, usage: Option<TokenUsage>) -> Self {
        Self {
            model: model.into(),
            kind: ResponseKind::StreamChunk { final_chunk },
            usage,
        }
    }

    /// Whether this response is the terminal chunk of a stream.
    pub fn is_final_chunk(&self) -> bool {
        matches!(
            self.kind,
            ResponseKind::StreamChunk { final_chunk: true }
        )
    }

    /// Whether the post-hook should account for this response: complete
    /// responses always, stream chunks only when terminal.
    pub fn should_account(&self) -> bool {
        match self.kind {
            ResponseKind::Complete => true,
            ResponseKind::StreamChunk { final_chunk } => final_chunk,
        }
    }

    /// Total tokens consumed, zero when no usage block is present.
    pub fn tokens_used(&self) -> u64 {
        self.usage.map(|u| u.total_tokens).unwrap_or(0)
    }

    /// Split `provider/model` the same way the request side does.
    pub fn provider_and_model(&self) -> (Option<&str>, &str) {
        match self.model.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                (Some(provider), model)
            }
            _ => (None, self.model.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_and_model_split() {
        let req = ModelRequest::new("openai/gpt-4o");
        assert_eq!(req.provider_and_model(), (Some("openai"), "gpt-4o"));

        let req = ModelRequest::new("gpt-4o");
        assert_eq!(req.provider_and_model(), (None, "gpt-4o"));

        // Degenerate prefixes fall back to the whole string
        let req = ModelRequest::new("/gpt-4o");
        assert_eq!(req.provider_and_model(), (None, "/gpt-4o"));
    }

    #[test]
    fn test_should_account() {
        let complete = UpstreamResponse::complete("gpt-4o", None);
        assert!(complete.should_account());
        assert!(!complete.is_final_chunk());

        let mid = UpstreamResponse::chunk("gpt-4o", false, None);
        assert!(!mid.should_account());

        let last = UpstreamResponse::chunk(
            "gpt-4o",
            true,
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        );
        assert!(last.should_account());
        assert!(last.is_final_chunk());
        assert_eq!(last.tokens_used(), 15);
    }

    #[test]
    fn test_tokens_used_without_usage_block() {
        let resp = UpstreamResponse::complete("gpt-4o", None);
        assert_eq!(resp.tokens_used(), 0);
    }

    #[test]
    fn test_request_body_passthrough() {
        let json = serde_json::json!({
            "model": "anthropic/claude-3-sonnet",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let req: ModelRequest = serde_json::from_value(json).unwrap();
        assert!(req.stream);
        assert_eq!(req.model, "anthropic/claude-3-sonnet");
        assert!(req.body.contains_key("messages"));

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["messages"][0]["content"], "hi");
    }
}
