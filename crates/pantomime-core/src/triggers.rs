//! Trigger subscriptions and event emission.
//!
//! All three subscription kinds funnel through one append path that
//! allocates the subscription's next sequence number. Polling is purely
//! pull-driven; webhook delivery and scheduled ticking run as explicit
//! background tasks whose lifecycle is tied to the subscription via a
//! cancellation token.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pantomime_tools::{Event, InvokeError, PollResponse};

use crate::config::RuntimeConfig;
use crate::definition::{AppDefinition, TriggerDef, TriggerKind, TriggerPredicate};
use crate::store::VersionedState;
use crate::types::{InstanceId, SubscriptionId};

const FEED_CHANNEL_SIZE: usize = 256;
const DEFAULT_CADENCE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Paused,
    /// Delivery exhausted its retry budget; no events are emitted until
    /// an explicit reset.
    Failed { reason: String },
}

/// Outbound push seam. Real deployments can put an HTTP client behind
/// this; tests use in-process transports.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, endpoint: &str, event: &Event) -> Result<(), TriggerDeliveryError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TriggerDeliveryError {
    pub message: String,
    /// Permanently unreachable endpoints skip the retry budget.
    pub permanent: bool,
}

impl TriggerDeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

/// Transport that accepts everything and logs. Useful for polling-only
/// universes.
pub struct DiscardWebhookTransport;

#[async_trait]
impl WebhookTransport for DiscardWebhookTransport {
    async fn deliver(&self, endpoint: &str, event: &Event) -> Result<(), TriggerDeliveryError> {
        debug!(endpoint, seq = event.seq, "discarding webhook delivery");
        Ok(())
    }
}

struct Subscription {
    id: SubscriptionId,
    instance: InstanceId,
    trigger: TriggerDef,
    status: SubscriptionStatus,
    next_seq: u64,
    log: VecDeque<Event>,
    delivery_tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Subscription {
    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

pub struct TriggerDispatcher {
    config: RuntimeConfig,
    transport: Arc<dyn WebhookTransport>,
    subs: Mutex<HashMap<SubscriptionId, Arc<Mutex<Subscription>>>>,
    by_instance: Mutex<HashMap<InstanceId, Vec<SubscriptionId>>>,
    feed: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl TriggerDispatcher {
    pub fn new(config: RuntimeConfig, transport: Arc<dyn WebhookTransport>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CHANNEL_SIZE);
        Self {
            config,
            transport,
            subs: Mutex::new(HashMap::new()),
            by_instance: Mutex::new(HashMap::new()),
            feed,
            cancel: CancellationToken::new(),
        }
    }

    /// Process-wide feed of every emitted event, for protocol-level
    /// notifications.
    pub fn subscribe_feed(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }

    /// Stop all background delivery and ticking tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(
        self: &Arc<Self>,
        instance: &InstanceId,
        definition: &AppDefinition,
        trigger_id: &str,
        endpoint: Option<String>,
    ) -> Result<SubscriptionId, InvokeError> {
        let trigger = definition
            .trigger(trigger_id)
            .ok_or_else(|| InvokeError::UnknownAction {
                app: definition.metadata.id.to_string(),
                action: trigger_id.to_string(),
            })?
            .clone();

        if trigger.kind == TriggerKind::Webhook && endpoint.is_none() {
            return Err(InvokeError::validation(
                trigger_id,
                "webhook trigger requires a callback endpoint",
            ));
        }

        let id = SubscriptionId::generate();
        let mut delivery_tx = None;

        if trigger.kind == TriggerKind::Webhook {
            let (tx, rx) = mpsc::unbounded_channel();
            delivery_tx = Some(tx);
            if let Some(endpoint) = endpoint {
                self.spawn_webhook_worker(id, endpoint, rx);
            }
        }

        let sub = Arc::new(Mutex::new(Subscription {
            id,
            instance: instance.clone(),
            trigger: trigger.clone(),
            status: SubscriptionStatus::Active,
            next_seq: 1,
            log: VecDeque::new(),
            delivery_tx,
        }));

        lock(&self.subs).insert(id, sub);
        lock(&self.by_instance)
            .entry(instance.clone())
            .or_default()
            .push(id);

        if trigger.kind == TriggerKind::Scheduled {
            self.spawn_scheduled_ticker(id, trigger.cadence_ms.unwrap_or(DEFAULT_CADENCE_MS));
        }

        debug!(subscription = %id, instance = %instance, trigger = trigger.id, "subscribed");
        Ok(id)
    }

    /// Explicit unsubscribe pauses the subscription; it is never silently
    /// dropped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), InvokeError> {
        self.set_status(id, SubscriptionStatus::Paused)
    }

    pub fn pause(&self, id: SubscriptionId) -> Result<(), InvokeError> {
        self.set_status(id, SubscriptionStatus::Paused)
    }

    pub fn resume(&self, id: SubscriptionId) -> Result<(), InvokeError> {
        self.set_status(id, SubscriptionStatus::Active)
    }

    /// Bring a Failed subscription back to Active. Also clears Paused.
    pub fn reset(&self, id: SubscriptionId) -> Result<(), InvokeError> {
        self.set_status(id, SubscriptionStatus::Active)
    }

    pub fn status(&self, id: SubscriptionId) -> Result<SubscriptionStatus, InvokeError> {
        let sub = self.lookup(id)?;
        let guard = lock_sub(&sub);
        Ok(guard.status.clone())
    }

    /// Pull every event after `cursor`. Sequence numbers are gap-free for
    /// a monotonically advancing cursor (until log eviction, which only
    /// touches events older than `event_log_cap`).
    pub fn poll(&self, id: SubscriptionId, cursor: u64) -> Result<PollResponse, InvokeError> {
        let sub = self.lookup(id)?;
        let guard = lock_sub(&sub);
        let events: Vec<Event> = guard
            .log
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect();
        let next_cursor = events.last().map_or(cursor, |e| e.seq);
        Ok(PollResponse { events, next_cursor })
    }

    /// Evaluate every subscription on `instance` against a committed
    /// state transition. Called by the action executor after each
    /// successful commit.
    pub fn on_commit(&self, instance: &InstanceId, old_doc: &Value, new_state: &VersionedState) {
        let ids = lock(&self.by_instance)
            .get(instance)
            .cloned()
            .unwrap_or_default();
        for id in ids {
            let Ok(sub) = self.lookup(id) else { continue };
            let payload = {
                let guard = lock_sub(&sub);
                if guard.status != SubscriptionStatus::Active
                    || guard.trigger.kind == TriggerKind::Scheduled
                {
                    continue;
                }
                match evaluate_predicate(
                    guard.trigger.predicate.as_ref(),
                    &guard.trigger.id,
                    old_doc,
                    &new_state.doc,
                    new_state.version,
                ) {
                    Some(payload) => payload,
                    None => continue,
                }
            };
            self.append_event(&sub, payload);
        }
    }

    fn append_event(&self, sub: &Arc<Mutex<Subscription>>, payload: Value) {
        let event = {
            let mut guard = lock_sub(sub);
            let seq = guard.allocate_seq();
            let event = Event {
                subscription_id: guard.id.0,
                seq,
                payload,
                occurred_at: Utc::now(),
            };
            guard.log.push_back(event.clone());
            while guard.log.len() > self.config.event_log_cap {
                guard.log.pop_front();
            }
            if guard.trigger.kind == TriggerKind::Webhook
                && let Some(tx) = &guard.delivery_tx
            {
                let _ = tx.send(event.clone());
            }
            event
        };
        // Nobody listening on the feed is fine.
        let _ = self.feed.send(event);
    }

    fn spawn_scheduled_ticker(self: &Arc<Self>, id: SubscriptionId, cadence_ms: u64) {
        let dispatcher = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(cadence_ms.max(1)));
            // Missed ticks are not backfilled beyond one pending tick.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; a subscription should not.
            interval.tick().await;
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tick += 1;
                        dispatcher.scheduled_tick(id, tick);
                    }
                }
            }
        });
    }

    fn scheduled_tick(&self, id: SubscriptionId, tick: u64) {
        let Ok(sub) = self.lookup(id) else { return };
        let trigger_id = {
            let guard = lock_sub(&sub);
            if guard.status != SubscriptionStatus::Active {
                return;
            }
            guard.trigger.id.clone()
        };
        self.append_event(&sub, json!({ "trigger": trigger_id, "tick": tick }));
    }

    fn spawn_webhook_worker(
        self: &Arc<Self>,
        id: SubscriptionId,
        endpoint: String,
        mut rx: mpsc::UnboundedReceiver<Event>,
    ) {
        let dispatcher = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe = rx.recv() => {
                        let Some(event) = maybe else { break };
                        dispatcher.deliver_with_retry(id, &endpoint, event, &cancel).await;
                    }
                }
            }
        });
    }

    async fn deliver_with_retry(
        &self,
        id: SubscriptionId,
        endpoint: &str,
        event: Event,
        cancel: &CancellationToken,
    ) {
        let mut attempt: u32 = 0;
        loop {
            match self.status(id) {
                Ok(SubscriptionStatus::Active) => {}
                // Paused or Failed subscriptions stop future retries;
                // recorded events are never rolled back.
                _ => return,
            }
            match self.transport.deliver(endpoint, &event).await {
                Ok(()) => {
                    debug!(subscription = %id, seq = event.seq, "webhook delivered");
                    return;
                }
                Err(err) if err.permanent || attempt + 1 >= self.config.webhook_retry_limit => {
                    warn!(
                        subscription = %id,
                        seq = event.seq,
                        attempts = attempt + 1,
                        error = %err,
                        "webhook delivery exhausted, failing subscription"
                    );
                    let _ = self.set_status(
                        id,
                        SubscriptionStatus::Failed {
                            reason: InvokeError::TriggerDeliveryFailure {
                                message: err.message,
                            }
                            .to_string(),
                        },
                    );
                    return;
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    debug!(
                        subscription = %id,
                        seq = event.seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "webhook delivery failed, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.webhook_backoff_base_ms.max(1);
        let ms = base.saturating_mul(1_u64 << attempt.min(20));
        Duration::from_millis(ms.min(self.config.webhook_backoff_cap_ms))
    }

    fn set_status(&self, id: SubscriptionId, status: SubscriptionStatus) -> Result<(), InvokeError> {
        let sub = self.lookup(id)?;
        let mut guard = lock_sub(&sub);
        guard.status = status;
        Ok(())
    }

    fn lookup(&self, id: SubscriptionId) -> Result<Arc<Mutex<Subscription>>, InvokeError> {
        lock(&self.subs)
            .get(&id)
            .cloned()
            .ok_or_else(|| InvokeError::UnknownSubscription { id: id.to_string() })
    }
}

impl Drop for TriggerDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_sub(sub: &Arc<Mutex<Subscription>>) -> std::sync::MutexGuard<'_, Subscription> {
    sub.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn path_lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn evaluate_predicate(
    predicate: Option<&TriggerPredicate>,
    trigger_id: &str,
    old_doc: &Value,
    new_doc: &Value,
    new_version: u64,
) -> Option<Value> {
    match predicate.unwrap_or(&TriggerPredicate::Any) {
        TriggerPredicate::CollectionGrew { path } => {
            let old_len = path_lookup(old_doc, path)
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let new_items = path_lookup(new_doc, path).and_then(Value::as_array)?;
            if new_items.len() > old_len {
                Some(json!({
                    "trigger": trigger_id,
                    "path": path,
                    "new_items": new_items[old_len..].to_vec(),
                }))
            } else {
                None
            }
        }
        TriggerPredicate::FieldChanged { path } => {
            let old_value = path_lookup(old_doc, path);
            let new_value = path_lookup(new_doc, path);
            if old_value != new_value {
                Some(json!({
                    "trigger": trigger_id,
                    "path": path,
                    "from": old_value.cloned().unwrap_or(Value::Null),
                    "to": new_value.cloned().unwrap_or(Value::Null),
                }))
            } else {
                None
            }
        }
        TriggerPredicate::Any => Some(json!({
            "trigger": trigger_id,
            "version": new_version,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FlakyWebhookTransport, RecordingWebhookTransport, email_app};
    use crate::types::InstanceId;

    fn dispatcher(transport: Arc<dyn WebhookTransport>) -> Arc<TriggerDispatcher> {
        let config = RuntimeConfig {
            webhook_backoff_base_ms: 1,
            webhook_backoff_cap_ms: 4,
            webhook_retry_limit: 3,
            event_log_cap: 4,
            ..RuntimeConfig::deterministic()
        };
        Arc::new(TriggerDispatcher::new(config, transport))
    }

    fn inst() -> InstanceId {
        InstanceId::new("mailbird", "acct-1")
    }

    fn commit(version: u64, doc: Value) -> VersionedState {
        VersionedState { doc, version }
    }

    #[tokio::test]
    async fn polling_sees_gap_free_sequences() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_received", None)
            .unwrap();

        let old = json!({"inbox": []});
        let one = json!({"inbox": [{"id": "m-1"}]});
        let two = json!({"inbox": [{"id": "m-1"}, {"id": "m-2"}]});
        d.on_commit(&inst(), &old, &commit(1, one.clone()));
        d.on_commit(&inst(), &one, &commit(2, two));

        let resp = d.poll(sub, 0).unwrap();
        assert_eq!(resp.events.len(), 2);
        assert_eq!(resp.events[0].seq, 1);
        assert_eq!(resp.events[1].seq, 2);
        assert_eq!(resp.next_cursor, 2);

        let empty = d.poll(sub, 2).unwrap();
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_cursor, 2);
    }

    #[tokio::test]
    async fn predicate_filters_unrelated_commits() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_received", None)
            .unwrap();

        // sentMessages changed, inbox did not: no event.
        let old = json!({"inbox": [], "sentMessages": []});
        let new = json!({"inbox": [], "sentMessages": [{"id": "s-1"}]});
        d.on_commit(&inst(), &old, &commit(1, new));

        assert!(d.poll(sub, 0).unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn paused_subscription_emits_nothing_until_resumed() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_received", None)
            .unwrap();
        d.pause(sub).unwrap();

        let old = json!({"inbox": []});
        let new = json!({"inbox": [{"id": "m-1"}]});
        d.on_commit(&inst(), &old, &commit(1, new.clone()));
        assert!(d.poll(sub, 0).unwrap().events.is_empty());

        d.resume(sub).unwrap();
        let newer = json!({"inbox": [{"id": "m-1"}, {"id": "m-2"}]});
        d.on_commit(&inst(), &new, &commit(2, newer));
        let resp = d.poll(sub, 0).unwrap();
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].seq, 1);
    }

    #[tokio::test]
    async fn event_log_is_bounded() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_received", None)
            .unwrap();

        let mut inbox = Vec::new();
        let mut old = json!({"inbox": []});
        for i in 0..6 {
            inbox.push(json!({"id": format!("m-{i}")}));
            let new = json!({"inbox": inbox.clone()});
            d.on_commit(&inst(), &old, &commit(i + 1, new.clone()));
            old = new;
        }

        // event_log_cap is 4: seqs 1 and 2 were evicted.
        let resp = d.poll(sub, 0).unwrap();
        assert_eq!(resp.events.first().map(|e| e.seq), Some(3));
        assert_eq!(resp.next_cursor, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_delivery_retries_then_succeeds() {
        let transport = Arc::new(FlakyWebhookTransport::failing(2));
        let d = dispatcher(transport.clone());
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_pushed", Some("cb://here".into()))
            .unwrap();

        let old = json!({"inbox": []});
        let new = json!({"inbox": [{"id": "m-1"}]});
        d.on_commit(&inst(), &old, &commit(1, new));

        // Two failures then success, inside the 3-attempt budget.
        tokio::time::timeout(Duration::from_secs(5), transport.delivered())
            .await
            .unwrap();
        assert_eq!(d.status(sub).unwrap(), SubscriptionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_exhaustion_fails_the_subscription() {
        let transport = Arc::new(FlakyWebhookTransport::failing(u32::MAX));
        let d = dispatcher(transport);
        let def = email_app();
        let sub = d
            .subscribe(&inst(), &def, "message_pushed", Some("cb://gone".into()))
            .unwrap();

        let old = json!({"inbox": []});
        let new = json!({"inbox": [{"id": "m-1"}]});
        d.on_commit(&inst(), &old, &commit(1, new.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(d.status(sub).unwrap(), SubscriptionStatus::Failed { .. }) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // Failed subscription stops emitting: the commit below appends
        // nothing new.
        let before = d.poll(sub, 0).unwrap().next_cursor;
        let newer = json!({"inbox": [{"id": "m-1"}, {"id": "m-2"}]});
        d.on_commit(&inst(), &new, &commit(2, newer));
        assert_eq!(d.poll(sub, 0).unwrap().next_cursor, before);

        // Until explicitly reset.
        d.reset(sub).unwrap();
        assert_eq!(d.status(sub).unwrap(), SubscriptionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_trigger_ticks_on_cadence() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let mut def = email_app();
        def.triggers.push(TriggerDef {
            id: "daily_digest".to_string(),
            kind: TriggerKind::Scheduled,
            predicate: None,
            cadence_ms: Some(100),
        });
        let sub = d.subscribe(&inst(), &def, "daily_digest", None).unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        // Give the ticker task a chance to run after each advance.
        tokio::task::yield_now().await;

        let resp = d.poll(sub, 0).unwrap();
        assert!(
            (3..=4).contains(&resp.events.len()),
            "expected ~3 ticks, got {}",
            resp.events.len()
        );
        assert_eq!(resp.events[0].payload["trigger"], "daily_digest");
        assert_eq!(resp.events[0].payload["tick"], 1);
    }

    #[tokio::test]
    async fn webhook_events_reach_the_transport_in_order() {
        let transport = Arc::new(RecordingWebhookTransport::new());
        let d = dispatcher(transport.clone());
        let def = email_app();
        d.subscribe(&inst(), &def, "message_pushed", Some("cb://sink".into()))
            .unwrap();

        let old = json!({"inbox": []});
        let one = json!({"inbox": [{"id": "m-1"}]});
        let two = json!({"inbox": [{"id": "m-1"}, {"id": "m-2"}]});
        d.on_commit(&inst(), &old, &commit(1, one.clone()));
        d.on_commit(&inst(), &one, &commit(2, two));

        let delivered = tokio::time::timeout(Duration::from_secs(5), transport.take(2))
            .await
            .unwrap();
        assert_eq!(delivered[0].seq, 1);
        assert_eq!(delivered[1].seq, 2);
        assert_eq!(delivered[0].payload["new_items"][0]["id"], "m-1");
    }

    #[tokio::test]
    async fn unknown_subscription_is_reported() {
        let d = dispatcher(Arc::new(DiscardWebhookTransport));
        let err = d.poll(SubscriptionId::generate(), 0).unwrap_err();
        assert!(matches!(err, InvokeError::UnknownSubscription { .. }));
    }
}
