use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One emitted trigger event. `seq` is unique and strictly increasing per
/// subscription, giving consumers a total order for replay and dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub subscription_id: Uuid,
    pub seq: u64,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

/// Result of polling a subscription: every event after the supplied
/// cursor, plus the cursor to pass next time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<Event>,
    pub next_cursor: u64,
}
