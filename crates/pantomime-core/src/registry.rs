//! Owns installed app definitions and their per-account instances.
//!
//! Instances are created lazily on first touch and live for the
//! registry's lifetime. Everything hangs off one `Registry` value; there
//! are no process-wide singletons.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use pantomime_tools::{InvocationOutcome, InvokeError};

use crate::chaos::{ChaosInjector, ChaosPolicy};
use crate::config::RuntimeConfig;
use crate::definition::AppDefinition;
use crate::error::{Error, Result};
use crate::executor::ActionExecutor;
use crate::instance::AppInstance;
use crate::ratelimit::RateLimiter;
use crate::store::{MemoryStateStore, StateStore};
use crate::triggers::{DiscardWebhookTransport, TriggerDispatcher, WebhookTransport};
use crate::types::{AppId, InstanceId};
use crate::workflow::{self, WorkflowReport, WorkflowSpec};

pub struct Registry {
    config: RuntimeConfig,
    store: Arc<dyn StateStore>,
    dispatcher: Arc<TriggerDispatcher>,
    executor: ActionExecutor,
    definitions: RwLock<HashMap<AppId, Arc<AppDefinition>>>,
    instances: Mutex<HashMap<InstanceId, Arc<AppInstance>>>,
}

impl Registry {
    pub fn new(config: RuntimeConfig, transport: Arc<dyn WebhookTransport>) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(
            config.default_retry_after_ms,
        )));
        let dispatcher = Arc::new(TriggerDispatcher::new(config.clone(), transport));
        let executor = ActionExecutor::new(
            Arc::clone(&store),
            limiter,
            Arc::clone(&dispatcher),
            config.clone(),
        );
        Self {
            config,
            store,
            dispatcher,
            executor,
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with no outbound webhook delivery; events are still
    /// logged per subscription and published on the feed.
    pub fn in_memory(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(DiscardWebhookTransport))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<TriggerDispatcher> {
        &self.dispatcher
    }

    /// Install one app definition. Installing the same app id twice is a
    /// configuration error; existing instances would silently keep the
    /// old definition otherwise.
    pub fn install(&self, definition: AppDefinition) -> Result<()> {
        let id = definition.metadata.id.clone();
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if definitions.contains_key(&id) {
            return Err(Error::Configuration(format!(
                "app '{id}' is already installed"
            )));
        }
        info!(app = %id, actions = definition.actions.len(), "installed app definition");
        definitions.insert(id, Arc::new(definition));
        Ok(())
    }

    /// Load every `*.json` definition from a directory, in name order.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let raw = std::fs::read_to_string(&path)?;
            let definition: AppDefinition = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), app = %definition.metadata.id, "loading definition");
            self.install(definition)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn definition(&self, app: &AppId) -> Option<Arc<AppDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(app)
            .cloned()
    }

    /// Installed definitions, sorted by app id.
    pub fn apps(&self) -> Vec<Arc<AppDefinition>> {
        let mut apps: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.metadata.id.as_str().cmp(b.metadata.id.as_str()));
        apps
    }

    /// The instance for (app, account), creating and registering it on
    /// first touch. Each instance gets its own chaos stream, derived
    /// deterministically from the runtime seed and the instance key.
    pub fn instance(&self, id: &InstanceId) -> Result<Arc<AppInstance>> {
        if let Some(existing) = self
            .instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
        {
            return Ok(Arc::clone(existing));
        }

        let definition = self
            .definition(&id.app)
            .ok_or_else(|| Error::UnknownApp(id.app.to_string()))?;
        self.store.register(
            id,
            definition.state.initial_state.clone(),
            &definition.state.state_schema,
        )?;

        let policy = ChaosPolicy::derive(
            definition.error_profile,
            definition.latency_profile,
            self.config.chaos_level,
        );
        let instance = Arc::new(AppInstance::new(
            id.clone(),
            definition,
            ChaosInjector::new(policy, instance_seed(self.config.seed, id)),
            self.config.idempotency_cache_cap,
        ));

        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // A racing caller may have created it between the lookup and now.
        Ok(Arc::clone(
            instances.entry(id.clone()).or_insert(instance),
        ))
    }

    /// Invoke an action on an instance, creating the instance if needed.
    pub async fn invoke(
        &self,
        id: &InstanceId,
        action: &str,
        input: Value,
        idempotency_key: Option<&str>,
    ) -> std::result::Result<InvocationOutcome, InvokeError> {
        let instance = self.instance(id).map_err(|_| InvokeError::UnknownApp {
            app: id.app.to_string(),
        })?;
        self.executor
            .invoke(&instance, action, input, idempotency_key)
            .await
    }

    pub fn subscribe(
        &self,
        id: &InstanceId,
        trigger_id: &str,
        endpoint: Option<String>,
    ) -> std::result::Result<crate::types::SubscriptionId, InvokeError> {
        let instance = self.instance(id).map_err(|_| InvokeError::UnknownApp {
            app: id.app.to_string(),
        })?;
        self.dispatcher
            .subscribe(id, &instance.definition, trigger_id, endpoint)
    }

    pub async fn run_workflow(&self, spec: &WorkflowSpec) -> WorkflowReport {
        workflow::run(self, spec).await
    }

    /// Current committed state for an instance, mainly for inspection.
    pub fn state(&self, id: &InstanceId) -> Result<crate::store::VersionedState> {
        let _ = self.instance(id)?;
        Ok(self.store.read(id)?)
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Stable per-instance seed so distinct instances see distinct chaos
/// streams while the whole run stays reproducible.
fn instance_seed(base: u64, id: &InstanceId) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    base ^ hasher.finish()
}
