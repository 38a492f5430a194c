//! Canned app definitions and in-process test doubles used across the
//! crate's tests and by downstream consumers writing their own.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use pantomime_tools::Event;

use crate::definition::{
    ActionDef, AppCategory, AppDefinition, AppMetadata, AuthScheme, ErrorProfile, LatencyProfile,
    RateLimitPolicy, RateLimitScope, StateDefinition, TransitionKind, TriggerDef, TriggerKind,
    TriggerPredicate,
};
use crate::triggers::{TriggerDeliveryError, WebhookTransport};
use crate::types::AppId;

/// A small simulated email service: send appends to `sentMessages`,
/// receive appends to `inbox`, and two triggers watch the inbox.
pub fn email_app() -> AppDefinition {
    AppDefinition {
        metadata: AppMetadata {
            id: AppId::new("mailbird"),
            name: "Mailbird".to_string(),
            category: AppCategory::Email,
            description: "A simulated email service".to_string(),
        },
        auth: AuthScheme::ApiKey,
        actions: vec![
            ActionDef {
                id: "send_email".to_string(),
                description: "Send an email".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "to": {"type": "string"},
                        "subject": {"type": "string"},
                        "body": {"type": "string"}
                    },
                    "required": ["to"]
                }),
                output_schema: json!({"type": "object"}),
                transition: TransitionKind::Append {
                    path: "sentMessages".to_string(),
                },
                rate_limit: None,
                requires_auth: true,
            },
            ActionDef {
                id: "receive_message".to_string(),
                description: "Deliver a message into the inbox".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "body": {"type": "string"}
                    },
                    "required": ["from"]
                }),
                output_schema: json!({"type": "object"}),
                transition: TransitionKind::Append {
                    path: "inbox".to_string(),
                },
                rate_limit: None,
                requires_auth: false,
            },
            ActionDef {
                id: "list_sent".to_string(),
                description: "List sent messages".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"limit": {"type": "integer"}}
                }),
                output_schema: json!({"type": "object"}),
                transition: TransitionKind::List {
                    collection: "sentMessages".to_string(),
                },
                rate_limit: None,
                requires_auth: false,
            },
        ],
        triggers: vec![
            TriggerDef {
                id: "message_received".to_string(),
                kind: TriggerKind::Polling,
                predicate: Some(TriggerPredicate::CollectionGrew {
                    path: "inbox".to_string(),
                }),
                cadence_ms: None,
            },
            TriggerDef {
                id: "message_pushed".to_string(),
                kind: TriggerKind::Webhook,
                predicate: Some(TriggerPredicate::CollectionGrew {
                    path: "inbox".to_string(),
                }),
                cadence_ms: None,
            },
        ],
        rate_limit: RateLimitPolicy {
            capacity: 100,
            refill_per_sec: 10.0,
            scope: RateLimitScope::Instance,
        },
        error_profile: ErrorProfile::None,
        latency_profile: LatencyProfile::Fast,
        state: StateDefinition {
            initial_state: json!({"inbox": [], "sentMessages": []}),
            state_schema: json!({
                "type": "object",
                "properties": {
                    "inbox": {"type": "array"},
                    "sentMessages": {"type": "array"}
                }
            }),
        },
        version: "1.0.0".to_string(),
    }
}

/// A simulated CRM with plain CRUD over a `contacts` collection and no
/// auth requirement.
pub fn crm_app() -> AppDefinition {
    let contact_schema = json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "email": {"type": "string"}
        },
        "required": ["name"]
    });
    let crud = |id: &str, transition: TransitionKind, input: serde_json::Value| ActionDef {
        id: id.to_string(),
        description: format!("{id} on contacts"),
        input_schema: input,
        output_schema: json!({"type": "object"}),
        transition,
        rate_limit: None,
        requires_auth: false,
    };
    AppDefinition {
        metadata: AppMetadata {
            id: AppId::new("pipedream_crm"),
            name: "Pipedream CRM".to_string(),
            category: AppCategory::Crm,
            description: "A simulated CRM".to_string(),
        },
        auth: AuthScheme::None,
        actions: vec![
            crud(
                "create_contact",
                TransitionKind::Create {
                    collection: "contacts".to_string(),
                },
                contact_schema,
            ),
            crud(
                "update_contact",
                TransitionKind::Update {
                    collection: "contacts".to_string(),
                },
                json!({"type": "object", "required": ["id"]}),
            ),
            crud(
                "delete_contact",
                TransitionKind::Delete {
                    collection: "contacts".to_string(),
                },
                json!({"type": "object", "required": ["id"]}),
            ),
            crud(
                "get_contact",
                TransitionKind::Get {
                    collection: "contacts".to_string(),
                },
                json!({"type": "object", "required": ["id"]}),
            ),
            crud(
                "list_contacts",
                TransitionKind::List {
                    collection: "contacts".to_string(),
                },
                json!({"type": "object"}),
            ),
        ],
        triggers: vec![TriggerDef {
            id: "contact_added".to_string(),
            kind: TriggerKind::Polling,
            predicate: Some(TriggerPredicate::CollectionGrew {
                path: "contacts".to_string(),
            }),
            cadence_ms: None,
        }],
        rate_limit: RateLimitPolicy {
            capacity: 1000,
            refill_per_sec: 100.0,
            scope: RateLimitScope::Instance,
        },
        error_profile: ErrorProfile::None,
        latency_profile: LatencyProfile::Fast,
        state: StateDefinition {
            initial_state: json!({"contacts": []}),
            state_schema: json!({}),
        },
        version: "1.0.0".to_string(),
    }
}

/// Records every delivered event and hands them back in order.
pub struct RecordingWebhookTransport {
    tx: mpsc::UnboundedSender<Event>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl RecordingWebhookTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Wait for the next `n` deliveries.
    pub async fn take(&self, n: usize) -> Vec<Event> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match rx.recv().await {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }
}

impl Default for RecordingWebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for RecordingWebhookTransport {
    async fn deliver(&self, _endpoint: &str, event: &Event) -> Result<(), TriggerDeliveryError> {
        self.tx
            .send(event.clone())
            .map_err(|_| TriggerDeliveryError::permanent("recorder closed"))
    }
}

/// Fails the first `n` deliveries with a retryable error, then succeeds.
/// `failing(u32::MAX)` never succeeds.
pub struct FlakyWebhookTransport {
    remaining: AtomicU32,
    success: watch::Sender<bool>,
}

impl FlakyWebhookTransport {
    pub fn failing(n: u32) -> Self {
        let (success, _) = watch::channel(false);
        Self {
            remaining: AtomicU32::new(n),
            success,
        }
    }

    /// Resolves once at least one delivery has succeeded.
    pub async fn delivered(&self) {
        let mut rx = self.success.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[async_trait]
impl WebhookTransport for FlakyWebhookTransport {
    async fn deliver(&self, _endpoint: &str, _event: &Event) -> Result<(), TriggerDeliveryError> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(TriggerDeliveryError::retryable("synthetic delivery failure"));
        }
        self.success.send_replace(true);
        Ok(())
    }
}

/// Install a compact tracing subscriber for a test run. Safe to call
/// more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
