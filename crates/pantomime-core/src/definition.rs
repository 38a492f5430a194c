//! Serde models for the immutable app definition documents produced by
//! the external generator. The runtime treats these as read-only
//! configuration loaded at instance-creation time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AppId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppCategory {
    Email,
    Storage,
    Productivity,
    Crm,
    Finance,
    DeveloperTools,
    Messaging,
    Calendar,
    Operations,
    FileProcessing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// Anyone may call; the auth pipeline stage always passes.
    None,
    ApiKey,
    OAuth {
        /// Seconds until an authenticated session expires.
        expires_in_secs: u64,
    },
}

impl AuthScheme {
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthScheme::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorProfile {
    None,
    Low,
    Medium,
    High,
    /// Every invocation fails with a retryable fault. Test-oriented.
    AlwaysFailTransient,
    /// Every invocation fails with a non-retryable fault. Test-oriented.
    AlwaysFailPermanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LatencyProfile {
    Fast,
    Normal,
    Slow,
    Variable,
}

/// Scope a rate-limit bucket covers: one bucket for the whole instance,
/// or one bucket per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Instance,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum burst the bucket admits.
    pub capacity: u32,
    /// Tokens restored per second. Zero means the bucket never refills.
    pub refill_per_sec: f64,
    pub scope: RateLimitScope,
}

/// The state transition an action performs, as an explicit tagged
/// variant interpreted by one generic executor rather than per-action
/// code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransitionKind {
    /// Insert the input as a new object (with generated `id` and
    /// `created_at`) into the named collection.
    Create { collection: String },
    /// Merge the input's fields into the object whose `id` matches,
    /// stamping `updated_at`.
    Update { collection: String },
    /// Remove the object whose `id` matches.
    Delete { collection: String },
    /// Return the object whose `id` matches. Read-only.
    Get { collection: String },
    /// Return the collection's objects, honoring an optional `limit`
    /// input. Read-only.
    List { collection: String },
    /// Append the input to the array at a dotted path, creating it if
    /// absent.
    Append { path: String },
    /// Shallow-merge the input into the state document root.
    SetFields,
    /// No state change; echoes the input back. Read-only.
    Noop,
}

impl TransitionKind {
    /// Read-only transitions never advance the state version.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            TransitionKind::Get { .. } | TransitionKind::List { .. } | TransitionKind::Noop
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub id: String,
    pub description: String,
    /// JSON Schema the input payload must satisfy.
    pub input_schema: Value,
    /// JSON Schema the result is checked against (advisory; a mismatch
    /// logs a warning but does not fail the invocation).
    pub output_schema: Value,
    pub transition: TransitionKind,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default = "default_true")]
    pub requires_auth: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerKind {
    Polling,
    Webhook,
    Scheduled,
}

/// Predicate a state transition must satisfy for a trigger to fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum TriggerPredicate {
    /// The array at the dotted path gained at least one element.
    CollectionGrew { path: String },
    /// The value at the dotted path changed.
    FieldChanged { path: String },
    /// Any committed state change.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub id: String,
    pub kind: TriggerKind,
    #[serde(default)]
    pub predicate: Option<TriggerPredicate>,
    /// Tick cadence for scheduled triggers, in milliseconds.
    #[serde(default)]
    pub cadence_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    #[serde(default)]
    pub initial_state: Value,
    /// JSON Schema every committed state document must satisfy. An empty
    /// object schema accepts anything.
    #[serde(default)]
    pub state_schema: Value,
}

impl Default for StateDefinition {
    fn default() -> Self {
        Self {
            initial_state: Value::Object(serde_json::Map::new()),
            state_schema: Value::Object(serde_json::Map::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub id: AppId,
    pub name: String,
    pub category: AppCategory,
    pub description: String,
}

/// Complete definition of one simulated app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub metadata: AppMetadata,
    pub auth: AuthScheme,
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    /// App-wide bucket used for actions without their own policy.
    pub rate_limit: RateLimitPolicy,
    pub error_profile: ErrorProfile,
    pub latency_profile: LatencyProfile,
    #[serde(default)]
    pub state: StateDefinition,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl AppDefinition {
    pub fn action(&self, id: &str) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn trigger(&self, id: &str) -> Option<&TriggerDef> {
        self.triggers.iter().find(|t| t.id == id)
    }

    /// The policy governing the bucket an action draws from, and whether
    /// that bucket is scoped to the action or shared by the instance.
    pub fn rate_limit_for(&self, action: &ActionDef) -> RateLimitPolicy {
        action.rate_limit.unwrap_or(self.rate_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_round_trips_through_json() {
        let def: AppDefinition = serde_json::from_value(json!({
            "metadata": {
                "id": "mailbird",
                "name": "Mailbird",
                "category": "email",
                "description": "A simulated email service"
            },
            "auth": {"scheme": "api_key"},
            "actions": [{
                "id": "send_email",
                "description": "Send an email",
                "input_schema": {"type": "object", "required": ["to"]},
                "output_schema": {"type": "object"},
                "transition": {"op": "append", "path": "sentMessages"},
                "rate_limit": {"capacity": 2, "refill_per_sec": 0.0, "scope": "action"}
            }],
            "triggers": [{
                "id": "message_received",
                "kind": "polling",
                "predicate": {"when": "collection_grew", "path": "inbox"}
            }],
            "rate_limit": {"capacity": 60, "refill_per_sec": 1.0, "scope": "instance"},
            "error_profile": "low",
            "latency_profile": "fast"
        }))
        .unwrap();

        assert_eq!(def.metadata.id.as_str(), "mailbird");
        assert!(def.action("send_email").is_some());
        assert!(def.action("missing").is_none());
        assert_eq!(def.triggers[0].kind, TriggerKind::Polling);
        assert_eq!(def.version, "1.0.0");

        let action = def.action("send_email").unwrap();
        assert!(action.requires_auth);
        assert_eq!(def.rate_limit_for(action).capacity, 2);
    }

    #[test]
    fn actions_without_policy_inherit_the_app_bucket() {
        let def: AppDefinition = serde_json::from_value(json!({
            "metadata": {
                "id": "probe",
                "name": "Probe",
                "category": "operations",
                "description": "test"
            },
            "auth": {"scheme": "none"},
            "actions": [{
                "id": "ping",
                "description": "ping",
                "input_schema": {},
                "output_schema": {},
                "transition": {"op": "noop"},
                "requires_auth": false
            }],
            "rate_limit": {"capacity": 10, "refill_per_sec": 0.5, "scope": "instance"},
            "error_profile": "none",
            "latency_profile": "normal"
        }))
        .unwrap();

        let action = def.action("ping").unwrap();
        let policy = def.rate_limit_for(action);
        assert_eq!(policy.capacity, 10);
        assert_eq!(policy.scope, RateLimitScope::Instance);
        assert!(!def.auth.requires_auth());
    }
}
