use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;

/// Successful outcome of one action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub result: Value,
    /// Injected latency actually incurred on this invocation.
    pub latency_ms: u64,
    /// State version after the invocation committed (unchanged for
    /// read-only actions).
    pub state_version: u64,
}

/// Uniform envelope returned for every tool call: either a result or a
/// structured error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u64>,
}

impl ToolResponse {
    pub fn ok(outcome: InvocationOutcome) -> Self {
        Self {
            success: true,
            result: Some(outcome.result),
            error: None,
            latency_ms: Some(outcome.latency_ms),
            state_version: Some(outcome.state_version),
        }
    }

    pub fn err(payload: impl Into<ErrorPayload>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(payload.into()),
            latency_ms: None,
            state_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvokeError;
    use serde_json::json;

    #[test]
    fn ok_response_omits_error_field() {
        let resp = ToolResponse::ok(InvocationOutcome {
            result: json!({"id": "m-1"}),
            latency_ms: 12,
            state_version: 4,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert_eq!(json["state_version"], 4);
    }

    #[test]
    fn err_response_omits_result_field() {
        let resp = ToolResponse::err(InvokeError::auth("session expired"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["kind"], "auth");
    }
}
