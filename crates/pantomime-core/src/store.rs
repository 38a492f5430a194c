//! Versioned, per-instance document storage with optimistic concurrency.
//!
//! Commits are all-or-nothing: the new document is validated against the
//! app's state schema and swapped in under the instance's lock, so no
//! partial mutation is ever observable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;

use crate::types::InstanceId;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedState {
    pub doc: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("stale version for {instance}: presented {presented}, current {current}")]
    Conflict {
        instance: InstanceId,
        presented: u64,
        current: u64,
    },

    #[error("state schema violation for {instance}: {message}")]
    SchemaViolation { instance: InstanceId, message: String },

    #[error("invalid state schema for {instance}: {message}")]
    InvalidSchema { instance: InstanceId, message: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),
}

/// Storage contract the rest of the runtime builds on. In-memory by
/// default, pluggable for anything that can honor the versioning
/// semantics.
pub trait StateStore: Send + Sync {
    /// Install an instance's initial document and state schema. Called
    /// once, at lazy instance creation; calling again is a no-op.
    fn register(
        &self,
        instance: &InstanceId,
        initial: Value,
        schema: &Value,
    ) -> Result<(), StateError>;

    fn read(&self, instance: &InstanceId) -> Result<VersionedState, StateError>;

    /// Replace the document if `presented_version` is still current.
    /// Fails with `Conflict` on a stale version rather than silently
    /// overwriting.
    fn commit(
        &self,
        instance: &InstanceId,
        presented_version: u64,
        doc: Value,
    ) -> Result<VersionedState, StateError>;
}

struct Slot {
    schema: Option<JSONSchema>,
    state: VersionedState,
}

#[derive(Default)]
pub struct MemoryStateStore {
    slots: RwLock<HashMap<InstanceId, Arc<Mutex<Slot>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance: &InstanceId) -> Result<Arc<Mutex<Slot>>, StateError> {
        let slots = self
            .slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots
            .get(instance)
            .cloned()
            .ok_or_else(|| StateError::UnknownInstance(instance.clone()))
    }
}

fn compile_schema(instance: &InstanceId, schema: &Value) -> Result<Option<JSONSchema>, StateError> {
    match schema {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        other => JSONSchema::compile(other)
            .map(Some)
            .map_err(|e| StateError::InvalidSchema {
                instance: instance.clone(),
                message: e.to_string(),
            }),
    }
}

fn check_schema(
    instance: &InstanceId,
    schema: Option<&JSONSchema>,
    doc: &Value,
) -> Result<(), StateError> {
    let Some(schema) = schema else {
        return Ok(());
    };
    if let Err(errors) = schema.validate(doc) {
        let message = errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StateError::SchemaViolation {
            instance: instance.clone(),
            message,
        });
    }
    Ok(())
}

impl StateStore for MemoryStateStore {
    fn register(
        &self,
        instance: &InstanceId,
        initial: Value,
        schema: &Value,
    ) -> Result<(), StateError> {
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.contains_key(instance) {
            return Ok(());
        }
        let compiled = compile_schema(instance, schema)?;
        check_schema(instance, compiled.as_ref(), &initial)?;
        slots.insert(
            instance.clone(),
            Arc::new(Mutex::new(Slot {
                schema: compiled,
                state: VersionedState {
                    doc: initial,
                    version: 0,
                },
            })),
        );
        Ok(())
    }

    fn read(&self, instance: &InstanceId) -> Result<VersionedState, StateError> {
        let slot = self.slot(instance)?;
        let guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(guard.state.clone())
    }

    fn commit(
        &self,
        instance: &InstanceId,
        presented_version: u64,
        doc: Value,
    ) -> Result<VersionedState, StateError> {
        let slot = self.slot(instance)?;
        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.state.version != presented_version {
            return Err(StateError::Conflict {
                instance: instance.clone(),
                presented: presented_version,
                current: guard.state.version,
            });
        }
        check_schema(instance, guard.schema.as_ref(), &doc)?;
        guard.state = VersionedState {
            doc,
            version: presented_version + 1,
        };
        Ok(guard.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceId;
    use serde_json::json;

    fn inst() -> InstanceId {
        InstanceId::new("mailbird", "acct-1")
    }

    #[test]
    fn commit_bumps_version_and_read_sees_it() {
        let store = MemoryStateStore::new();
        store
            .register(&inst(), json!({"inbox": []}), &json!({}))
            .unwrap();

        let read = store.read(&inst()).unwrap();
        assert_eq!(read.version, 0);

        let committed = store
            .commit(&inst(), 0, json!({"inbox": [{"id": "m-1"}]}))
            .unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(store.read(&inst()).unwrap(), committed);
    }

    #[test]
    fn stale_commit_conflicts_without_overwriting() {
        let store = MemoryStateStore::new();
        store.register(&inst(), json!({"n": 0}), &json!({})).unwrap();
        store.commit(&inst(), 0, json!({"n": 1})).unwrap();

        let err = store.commit(&inst(), 0, json!({"n": 99})).unwrap_err();
        assert!(matches!(err, StateError::Conflict { presented: 0, current: 1, .. }));
        assert_eq!(store.read(&inst()).unwrap().doc, json!({"n": 1}));
    }

    #[test]
    fn schema_violation_leaves_state_untouched() {
        let store = MemoryStateStore::new();
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        });
        store
            .register(&inst(), json!({"count": 0}), &schema)
            .unwrap();

        let err = store
            .commit(&inst(), 0, json!({"count": "not a number"}))
            .unwrap_err();
        assert!(matches!(err, StateError::SchemaViolation { .. }));

        let read = store.read(&inst()).unwrap();
        assert_eq!(read.version, 0);
        assert_eq!(read.doc, json!({"count": 0}));
    }

    #[test]
    fn register_is_idempotent() {
        let store = MemoryStateStore::new();
        store.register(&inst(), json!({"a": 1}), &json!({})).unwrap();
        store.commit(&inst(), 0, json!({"a": 2})).unwrap();
        // A second registration must not reset existing state.
        store.register(&inst(), json!({"a": 1}), &json!({})).unwrap();
        assert_eq!(store.read(&inst()).unwrap().version, 1);
    }

    #[test]
    fn unknown_instance_is_reported() {
        let store = MemoryStateStore::new();
        assert!(matches!(
            store.read(&inst()),
            Err(StateError::UnknownInstance(_))
        ));
    }
}
