//! Short-circuit error returned from the pre-hook.

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// A pre-hook denial that prevents the gateway from calling the upstream.
///
/// `error_type` carries the decision wire tag (e.g. `budget_exceeded`);
/// `status_code` is one of 400, 402, 403, 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ShortCircuit {
    #[serde(rename = "type")]
    pub error_type: String,
    pub status_code: u16,
    pub message: String,
}

impl ShortCircuit {
    pub fn new(error_type: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            status_code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::FORBIDDEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let sc = ShortCircuit::new("budget_exceeded", 402, "budget exceeded for provider openai");
        let json = serde_json::to_value(&sc).unwrap();
        assert_eq!(json["type"], "budget_exceeded");
        assert_eq!(json["status_code"], 402);
        assert!(json["message"].as_str().unwrap().contains("openai"));
    }

    #[test]
    fn test_status_conversion() {
        let sc = ShortCircuit::new("rate_limited", 429, "rate limit exceeded");
        assert_eq!(sc.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
