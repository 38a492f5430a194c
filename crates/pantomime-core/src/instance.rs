//! The per-(app, account) runtime object. Created lazily on first use by
//! the registry and never implicitly destroyed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pantomime_tools::InvocationOutcome;

use crate::chaos::ChaosInjector;
use crate::definition::{AppDefinition, AuthScheme};
use crate::types::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticated,
    Expired,
}

/// Bounded cache of prior invocation outcomes keyed by
/// (action, idempotency key). Oldest entries are evicted first.
struct IdempotencyCache {
    cap: usize,
    entries: HashMap<(String, String), InvocationOutcome>,
    order: VecDeque<(String, String)>,
}

impl IdempotencyCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &(String, String)) -> Option<InvocationOutcome> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: (String, String), outcome: InvocationOutcome) {
        if self.entries.insert(key.clone(), outcome).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

pub struct AppInstance {
    pub id: InstanceId,
    pub definition: Arc<AppDefinition>,
    auth: Mutex<AuthState>,
    network_available: AtomicBool,
    /// Per-instance exclusive section for the read-transition-commit
    /// cycle; keeps optimistic-concurrency conflicts rare rather than
    /// the primary mechanism.
    commit_lock: tokio::sync::Mutex<()>,
    idempotency: Mutex<IdempotencyCache>,
    chaos: ChaosInjector,
}

struct AuthState {
    status: AuthStatus,
    expires_at: Option<Instant>,
}

impl AppInstance {
    pub fn new(
        id: InstanceId,
        definition: Arc<AppDefinition>,
        chaos: ChaosInjector,
        idempotency_cap: usize,
    ) -> Self {
        let status = if definition.auth.requires_auth() {
            AuthStatus::Unauthenticated
        } else {
            AuthStatus::Authenticated
        };
        Self {
            id,
            definition,
            auth: Mutex::new(AuthState {
                status,
                expires_at: None,
            }),
            network_available: AtomicBool::new(true),
            commit_lock: tokio::sync::Mutex::new(()),
            idempotency: Mutex::new(IdempotencyCache::new(idempotency_cap)),
            chaos,
        }
    }

    pub fn auth_status(&self) -> AuthStatus {
        let mut auth = self
            .auth
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if auth.status == AuthStatus::Authenticated
            && auth.expires_at.is_some_and(|at| Instant::now() >= at)
        {
            auth.status = AuthStatus::Expired;
            auth.expires_at = None;
        }
        auth.status
    }

    /// Mark the instance authenticated. OAuth-style schemes carry an
    /// expiry after which the status reads as Expired.
    pub fn authenticate(&self) {
        let expires_at = match self.definition.auth {
            AuthScheme::OAuth { expires_in_secs } => {
                Some(Instant::now() + Duration::from_secs(expires_in_secs))
            }
            _ => None,
        };
        let mut auth = self
            .auth
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        auth.status = AuthStatus::Authenticated;
        auth.expires_at = expires_at;
    }

    /// Force the session into the Expired state, as a fault-injection
    /// knob.
    pub fn expire_auth(&self) {
        let mut auth = self
            .auth
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        auth.status = AuthStatus::Expired;
        auth.expires_at = None;
    }

    /// Simulated network reachability. An unreachable instance fails
    /// every action with a transient error before any side effect.
    pub fn set_network_available(&self, available: bool) {
        self.network_available.store(available, Ordering::Relaxed);
    }

    pub fn network_available(&self) -> bool {
        self.network_available.load(Ordering::Relaxed)
    }

    pub fn chaos(&self) -> &ChaosInjector {
        &self.chaos
    }

    pub(crate) fn commit_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.commit_lock
    }

    pub fn cached_outcome(&self, action: &str, idempotency_key: &str) -> Option<InvocationOutcome> {
        let cache = self
            .idempotency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.get(&(action.to_string(), idempotency_key.to_string()))
    }

    pub fn record_outcome(&self, action: &str, idempotency_key: &str, outcome: InvocationOutcome) {
        let mut cache = self
            .idempotency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(
            (action.to_string(), idempotency_key.to_string()),
            outcome,
        );
    }
}
