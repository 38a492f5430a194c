//! The action invocation pipeline.
//!
//! `invoke` short-circuits at the first failing stage: input validation,
//! auth, idempotency replay, rate limiting, chaos injection, then the
//! state transition itself. Chaos is evaluated strictly before the
//! transition, so an injected failure never leaves partial state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use jsonschema::JSONSchema;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use pantomime_tools::{InvocationOutcome, InvokeError};

use crate::chaos::ChaosFailure;
use crate::config::RuntimeConfig;
use crate::definition::{ActionDef, RateLimitScope, TransitionKind};
use crate::instance::{AppInstance, AuthStatus};
use crate::ratelimit::{BucketKey, BucketScope, Decision, RateLimiter};
use crate::store::{StateError, StateStore};
use crate::triggers::TriggerDispatcher;
use crate::types::AppId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SchemaRole {
    Input,
    Output,
}

type SchemaKey = (AppId, String, SchemaRole);

pub struct ActionExecutor {
    store: Arc<dyn StateStore>,
    limiter: Arc<RateLimiter>,
    dispatcher: Arc<TriggerDispatcher>,
    config: RuntimeConfig,
    /// Compiled JSON Schemas, keyed per (app, action, role). Definitions
    /// are immutable, so entries never invalidate.
    schemas: Mutex<HashMap<SchemaKey, Arc<JSONSchema>>>,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        limiter: Arc<RateLimiter>,
        dispatcher: Arc<TriggerDispatcher>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            dispatcher,
            config,
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one action against an instance.
    ///
    /// An invocation that previously completed under the same
    /// `idempotency_key` returns its cached outcome without re-executing
    /// the side effect.
    #[instrument(skip(self, instance, input), fields(instance = %instance.id, action = action_id))]
    pub async fn invoke(
        &self,
        instance: &AppInstance,
        action_id: &str,
        input: Value,
        idempotency_key: Option<&str>,
    ) -> Result<InvocationOutcome, InvokeError> {
        let definition = Arc::clone(&instance.definition);
        let action = definition
            .action(action_id)
            .ok_or_else(|| InvokeError::UnknownAction {
                app: definition.metadata.id.to_string(),
                action: action_id.to_string(),
            })?;

        self.check_input(&definition.metadata.id, action, &input)?;

        if action.requires_auth && definition.auth.requires_auth() {
            match instance.auth_status() {
                AuthStatus::Authenticated => {}
                AuthStatus::Unauthenticated => {
                    return Err(InvokeError::auth("instance is not authenticated"));
                }
                AuthStatus::Expired => {
                    return Err(InvokeError::auth("authentication expired"));
                }
            }
        }

        if !instance.network_available() {
            return Err(InvokeError::transient("network unreachable"));
        }

        if let Some(key) = idempotency_key
            && let Some(prior) = instance.cached_outcome(action_id, key)
        {
            debug!(idempotency_key = key, "returning cached outcome");
            return Ok(prior);
        }

        let policy = definition.rate_limit_for(action);
        let scope = match policy.scope {
            RateLimitScope::Instance => BucketScope::Instance,
            RateLimitScope::Action => BucketScope::Action(action.id.clone()),
        };
        let key = BucketKey {
            instance: instance.id.clone(),
            scope,
        };
        if let Decision::Denied { retry_after } = self.limiter.acquire(key, policy) {
            return Err(InvokeError::RateLimitExceeded {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        let chaos = instance.chaos().decide();
        if !chaos.delay.is_zero() {
            tokio::time::sleep(chaos.delay).await;
        }
        let latency_ms = chaos.delay.as_millis() as u64;
        match chaos.failure {
            Some(ChaosFailure::Transient) => {
                return Err(InvokeError::transient("injected transient backend failure"));
            }
            Some(ChaosFailure::Permanent) => {
                return Err(InvokeError::permanent("injected permanent backend failure"));
            }
            None => {}
        }

        // Single logical writer per instance: conflicts only come from
        // callers bypassing the executor, and are retried a bounded
        // number of times with a fresh read.
        let _writer = instance.commit_lock().lock().await;
        let mut attempts: u32 = 0;
        let (result, state_version, committed) = loop {
            attempts += 1;
            let current = self
                .store
                .read(&instance.id)
                .map_err(|e| surface_state_error(action_id, e, attempts))?;
            let applied = apply_transition(&action.transition, &current.doc, &input)
                .map_err(|message| InvokeError::validation(action_id, message))?;
            match applied.new_doc {
                None => break (applied.result, current.version, None),
                Some(doc) => match self.store.commit(&instance.id, current.version, doc) {
                    Ok(new_state) => {
                        break (applied.result, new_state.version, Some((current.doc, new_state)));
                    }
                    Err(StateError::Conflict { .. })
                        if attempts <= self.config.conflict_retry_limit =>
                    {
                        debug!(attempts, "commit conflict, retrying with fresh read");
                    }
                    Err(err) => return Err(surface_state_error(action_id, err, attempts)),
                },
            }
        };

        self.check_output(&definition.metadata.id, action, &result);

        let outcome = InvocationOutcome {
            result,
            latency_ms,
            state_version,
        };
        if let Some(key) = idempotency_key {
            instance.record_outcome(action_id, key, outcome.clone());
        }
        if let Some((old_doc, new_state)) = committed {
            self.dispatcher.on_commit(&instance.id, &old_doc, &new_state);
        }
        Ok(outcome)
    }

    fn check_input(
        &self,
        app: &AppId,
        action: &ActionDef,
        input: &Value,
    ) -> Result<(), InvokeError> {
        let Some(schema) = self.compiled(app, action, SchemaRole::Input)? else {
            return Ok(());
        };
        if let Err(errors) = schema.validate(input) {
            let message = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(InvokeError::validation(&action.id, message));
        }
        Ok(())
    }

    /// Output contracts are advisory: a definition bug should show up in
    /// logs, not break the caller.
    fn check_output(&self, app: &AppId, action: &ActionDef, result: &Value) {
        let compiled = match self.compiled(app, action, SchemaRole::Output) {
            Ok(Some(schema)) => schema,
            Ok(None) => return,
            Err(err) => {
                warn!(action = action.id, %err, "output schema failed to compile");
                return;
            }
        };
        if let Err(errors) = compiled.validate(result) {
            let message = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(action = action.id, message, "output failed schema validation");
        }
    }

    fn compiled(
        &self,
        app: &AppId,
        action: &ActionDef,
        role: SchemaRole,
    ) -> Result<Option<Arc<JSONSchema>>, InvokeError> {
        let raw = match role {
            SchemaRole::Input => &action.input_schema,
            SchemaRole::Output => &action.output_schema,
        };
        match raw {
            Value::Null => return Ok(None),
            Value::Object(map) if map.is_empty() => return Ok(None),
            _ => {}
        }

        let key = (app.clone(), action.id.clone(), role);
        let mut schemas = self
            .schemas
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = schemas.get(&key) {
            return Ok(Some(Arc::clone(existing)));
        }
        let compiled = JSONSchema::compile(raw).map_err(|e| {
            InvokeError::validation(&action.id, format!("invalid schema in definition: {e}"))
        })?;
        let compiled = Arc::new(compiled);
        schemas.insert(key, Arc::clone(&compiled));
        Ok(Some(compiled))
    }
}

fn surface_state_error(action_id: &str, err: StateError, attempts: u32) -> InvokeError {
    match err {
        StateError::Conflict { .. } => InvokeError::StateConflict { attempts },
        StateError::SchemaViolation { message, .. }
        | StateError::InvalidSchema { message, .. } => {
            InvokeError::validation(action_id, message)
        }
        StateError::UnknownInstance(instance) => {
            InvokeError::validation(action_id, format!("instance {instance} is not registered"))
        }
    }
}

struct Applied {
    /// `None` for read-only transitions; the state version is untouched.
    new_doc: Option<Value>,
    result: Value,
}

/// One generic interpreter for every action's state transition. Objects
/// gain a generated `id` and `created_at` on insert and an `updated_at`
/// on merge.
fn apply_transition(kind: &TransitionKind, doc: &Value, input: &Value) -> Result<Applied, String> {
    match kind {
        TransitionKind::Create { collection } => {
            let mut doc = doc.clone();
            let obj = stamp_new_object(input)?;
            array_at_mut(&mut doc, collection)?.push(obj.clone());
            Ok(Applied {
                new_doc: Some(doc),
                result: obj,
            })
        }
        TransitionKind::Update { collection } => {
            let id = require_id(input)?;
            let mut doc = doc.clone();
            let array = array_at_mut(&mut doc, collection)?;
            let entry = array
                .iter_mut()
                .find(|o| o.get("id").and_then(Value::as_str) == Some(id.as_str()))
                .ok_or_else(|| format!("no object with id {id} in {collection}"))?;
            let target = entry
                .as_object_mut()
                .ok_or_else(|| format!("object {id} in {collection} is not a map"))?;
            let updates = input
                .as_object()
                .ok_or_else(|| "input must be an object".to_string())?;
            for (field, value) in updates {
                if field != "id" {
                    target.insert(field.clone(), value.clone());
                }
            }
            target.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
            let result = entry.clone();
            Ok(Applied {
                new_doc: Some(doc),
                result,
            })
        }
        TransitionKind::Delete { collection } => {
            let id = require_id(input)?;
            let mut doc = doc.clone();
            let array = array_at_mut(&mut doc, collection)?;
            let index = array
                .iter()
                .position(|o| o.get("id").and_then(Value::as_str) == Some(id.as_str()))
                .ok_or_else(|| format!("no object with id {id} in {collection}"))?;
            array.remove(index);
            Ok(Applied {
                new_doc: Some(doc),
                result: json!({"id": id, "status": "deleted"}),
            })
        }
        TransitionKind::Get { collection } => {
            let id = require_id(input)?;
            let found = path_array(doc, collection)
                .and_then(|arr| {
                    arr.iter()
                        .find(|o| o.get("id").and_then(Value::as_str) == Some(id.as_str()))
                })
                .cloned()
                .ok_or_else(|| format!("no object with id {id} in {collection}"))?;
            Ok(Applied {
                new_doc: None,
                result: found,
            })
        }
        TransitionKind::List { collection } => {
            let limit = input
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(50) as usize;
            let all = path_array(doc, collection).cloned().unwrap_or_default();
            let results: Vec<Value> = all.iter().take(limit).cloned().collect();
            Ok(Applied {
                new_doc: None,
                result: json!({"results": results, "count": all.len()}),
            })
        }
        TransitionKind::Append { path } => {
            let mut doc = doc.clone();
            let value = if input.is_object() {
                stamp_new_object(input)?
            } else {
                input.clone()
            };
            array_at_mut(&mut doc, path)?.push(value.clone());
            Ok(Applied {
                new_doc: Some(doc),
                result: value,
            })
        }
        TransitionKind::SetFields => {
            let updates = input
                .as_object()
                .ok_or_else(|| "input must be an object".to_string())?;
            let mut doc = doc.clone();
            let root = doc
                .as_object_mut()
                .ok_or_else(|| "state document is not a map".to_string())?;
            for (field, value) in updates {
                root.insert(field.clone(), value.clone());
            }
            Ok(Applied {
                new_doc: Some(doc),
                result: input.clone(),
            })
        }
        TransitionKind::Noop => Ok(Applied {
            new_doc: None,
            result: input.clone(),
        }),
    }
}

fn stamp_new_object(input: &Value) -> Result<Value, String> {
    let mut obj = input
        .as_object()
        .cloned()
        .ok_or_else(|| "input must be an object".to_string())?;
    obj.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
    obj.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));
    Ok(Value::Object(obj))
}

fn require_id(input: &Value) -> Result<String, String> {
    input
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| "missing 'id' field".to_string())
}

fn path_array<'a>(doc: &'a Value, path: &str) -> Option<&'a Vec<Value>> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    current.as_array()
}

/// Mutable array at a dotted path, creating intermediate objects and the
/// terminal array if absent.
fn array_at_mut<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Vec<Value>, String> {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| "empty path".to_string())?;
    for segment in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| format!("path segment '{segment}' is not a map"))?;
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| json!({}));
    }
    let map = current
        .as_object_mut()
        .ok_or_else(|| format!("path '{path}' does not end in a map"))?;
    map.entry((*last).to_string())
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| format!("'{path}' exists but is not an array"))
}
