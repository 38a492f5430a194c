use serde::Deserialize;

/// Process-wide runtime knobs. Constructed explicitly and passed into the
/// registry; nothing here lives in global state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seed for chaos decisions. A fixed seed reproduces an identical
    /// sequence of injected faults and latencies across runs.
    pub seed: u64,
    /// Multiplier applied to every profile-derived failure probability.
    /// Combined multiplicatively and clamped to 0.95.
    pub chaos_level: f64,
    /// Internal retries for `StateConflict` before surfacing it.
    pub conflict_retry_limit: u32,
    /// Cached idempotency records kept per instance.
    pub idempotency_cache_cap: usize,
    /// Events retained per subscription for polling replay.
    pub event_log_cap: usize,
    /// Webhook delivery attempts before a subscription transitions to
    /// Failed.
    pub webhook_retry_limit: u32,
    /// Base delay for webhook exponential backoff, in milliseconds.
    pub webhook_backoff_base_ms: u64,
    /// Upper bound on a single webhook backoff delay, in milliseconds.
    pub webhook_backoff_cap_ms: u64,
    /// Advisory retry-after reported when a bucket never refills, in
    /// milliseconds.
    pub default_retry_after_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            chaos_level: 1.0,
            conflict_retry_limit: 3,
            idempotency_cache_cap: 1024,
            event_log_cap: 1024,
            webhook_retry_limit: 5,
            webhook_backoff_base_ms: 50,
            webhook_backoff_cap_ms: 5_000,
            default_retry_after_ms: 60_000,
        }
    }
}

impl RuntimeConfig {
    /// Config with chaos disabled entirely, regardless of app profiles.
    pub fn deterministic() -> Self {
        Self {
            chaos_level: 0.0,
            ..Self::default()
        }
    }
}
