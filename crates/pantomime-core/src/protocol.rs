//! Tool-invocation surface over the registry.
//!
//! Each installed action is exposed as a tool named `{app}_{action}`.
//! Sessions carry the account identity: two sessions with different
//! accounts address disjoint instances of the same app.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pantomime_tools::{
    ErrorPayload, Event, InvokeError, PollResponse, ToolCall, ToolResponse, ToolSchema,
};

use crate::definition::AppDefinition;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::{AccountId, InstanceId, SessionId, SubscriptionId};
use crate::workflow::{WorkflowReport, WorkflowSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: SessionId,
    pub account: AccountId,
}

pub struct SimulatorServer {
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<SessionId, AgentSession>>,
}

impl SimulatorServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn create_session(&self, account: impl Into<AccountId>) -> AgentSession {
        let session = AgentSession {
            id: SessionId::generate(),
            account: account.into(),
        };
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session.id, session.clone());
        debug!(session = %session.id, account = %session.account, "created session");
        session
    }

    pub fn session(&self, id: SessionId) -> Result<AgentSession> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown session {id}")))
    }

    /// One tool per installed action, named `{app}_{action}`.
    pub fn list_tools(&self) -> Vec<ToolSchema> {
        let mut tools = Vec::new();
        for app in self.registry.apps() {
            for action in &app.actions {
                tools.push(tool_schema_for(&app, action));
            }
        }
        tools
    }

    /// Metadata, actions, and triggers of one app, as a JSON document.
    pub fn describe_app(&self, app: &str) -> Result<Value> {
        let definition = self
            .registry
            .definition(&app.into())
            .ok_or_else(|| Error::UnknownApp(app.to_string()))?;
        Ok(json!({
            "app": definition.metadata,
            "version": definition.version,
            "auth": definition.auth,
            "actions": definition.actions.iter().map(|a| json!({
                "id": a.id,
                "description": a.description,
                "requires_auth": a.requires_auth,
            })).collect::<Vec<_>>(),
            "triggers": definition.triggers,
        }))
    }

    /// Authenticate the session's instance of an app.
    pub fn authenticate(&self, session: SessionId, app: &str) -> Result<()> {
        let session = self.session(session)?;
        let instance = self
            .registry
            .instance(&InstanceId::new(app, session.account.as_str()))?;
        instance.authenticate();
        Ok(())
    }

    /// Execute one tool call. Never errors at this layer: failures come
    /// back inside the response envelope. The call id doubles as the
    /// idempotency key, so protocol-level retries of the same call are
    /// safe.
    pub async fn call_tool(&self, session: SessionId, call: &ToolCall) -> ToolResponse {
        let session = match self.session(session) {
            Ok(session) => session,
            Err(_) => {
                return ToolResponse::err(ErrorPayload::from(&InvokeError::auth(
                    "unknown session",
                )));
            }
        };
        let Some((app, action)) = self.resolve_tool(&call.name) else {
            return ToolResponse::err(ErrorPayload::from(&InvokeError::UnknownApp {
                app: call.name.clone(),
            }));
        };
        let instance = InstanceId::new(app.metadata.id.as_str(), session.account.as_str());
        match self
            .registry
            .invoke(
                &instance,
                &action,
                call.parameters.clone(),
                Some(call.id.as_str()),
            )
            .await
        {
            Ok(outcome) => ToolResponse::ok(outcome),
            Err(err) => ToolResponse::err(ErrorPayload::from(err)),
        }
    }

    /// Split `{app}_{action}` back into its parts. App ids may contain
    /// underscores, so match installed ids longest-first rather than
    /// splitting at the first one.
    fn resolve_tool(&self, name: &str) -> Option<(Arc<AppDefinition>, String)> {
        let mut apps = self.registry.apps();
        apps.sort_by_key(|app| std::cmp::Reverse(app.metadata.id.as_str().len()));
        for app in apps {
            let prefix = format!("{}_", app.metadata.id);
            if let Some(action) = name.strip_prefix(&prefix)
                && app.action(action).is_some()
            {
                return Some((app, action.to_string()));
            }
        }
        None
    }

    pub fn subscribe_trigger(
        &self,
        session: SessionId,
        app: &str,
        trigger: &str,
        endpoint: Option<String>,
    ) -> Result<SubscriptionId> {
        let session = self.session(session)?;
        let instance = InstanceId::new(app, session.account.as_str());
        Ok(self.registry.subscribe(&instance, trigger, endpoint)?)
    }

    pub fn poll(&self, subscription: SubscriptionId, cursor: u64) -> Result<PollResponse> {
        Ok(self.registry.dispatcher().poll(subscription, cursor)?)
    }

    pub async fn run_workflow(&self, spec: &WorkflowSpec) -> WorkflowReport {
        self.registry.run_workflow(spec).await
    }

    /// Live notification stream of every trigger event in the process.
    /// The underlying broadcast feed is bounded; a slow consumer loses
    /// the lagged events but the stream keeps going.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<Event> {
        let mut feed = self.registry.dispatcher().subscribe_feed();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged, dropping events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

fn tool_schema_for(app: &AppDefinition, action: &crate::definition::ActionDef) -> ToolSchema {
    ToolSchema {
        name: format!("{}_{}", app.metadata.id, action.id),
        description: format!("[{}] {}", app.metadata.name, action.description),
        input_schema: pantomime_tools::InputSchema::from_value(&action.input_schema),
        output_schema: action.output_schema.clone(),
    }
}
