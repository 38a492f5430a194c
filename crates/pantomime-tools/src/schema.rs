use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary of an action's input contract, extracted from the JSON Schema
/// the app definition declares. Only the pieces an agent needs to shape a
/// call are surfaced; the runtime validates against the full schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub properties: serde_json::Map<String, Value>,
    pub required: Vec<String>,
    #[serde(rename = "type")]
    pub schema_type: String,
}

impl InputSchema {
    pub fn from_value(schema: &Value) -> Self {
        let obj = schema.as_object();
        let properties = obj
            .and_then(|o| o.get("properties"))
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let required = obj
            .and_then(|o| o.get("required"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let schema_type = obj
            .and_then(|o| o.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or("object")
            .to_string();

        Self {
            properties,
            required,
            schema_type,
        }
    }
}

/// One callable tool, as advertised to agents. Tool names are
/// `{app_id}_{action_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub output_schema: Value,
}

/// A single tool invocation request from an agent. The `id` doubles as
/// the idempotency key for the underlying action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub parameters: Value,
    pub id: String,
}
