use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Token counters for one provider call.
///
/// Built once from a parsed provider payload and never mutated — when a
/// later stream chunk carries updated totals, a new instance replaces it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl UsageCounters {
    /// Probe a provider `usage` JSON object. Missing fields default to 0.
    pub fn from_json(usage: &Value) -> Self {
        let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: field("input_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
            output_tokens: field("output_tokens"),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

/// Context attached to a usage event.
///
/// The recognized keys are typed fields; anything else a producer wants to
/// carry rides in `extra` (ordered, so event identity stays deterministic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub endpoint: Option<String>,
    pub feature: Option<String>,
    /// Business timestamp of the usage occurrence, distinct from when the
    /// event is processed.
    pub occur_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl EventMetadata {
    /// Build metadata from a loose scalar map. Recognized keys are lifted
    /// into typed fields when they carry the expected scalar type;
    /// everything else stays in `extra`.
    pub fn from_scalars(map: BTreeMap<String, Value>) -> Self {
        let mut meta = Self::default();
        for (key, value) in map {
            match (key.as_str(), &value) {
                ("request_id", Value::String(s)) => meta.request_id = Some(s.clone()),
                ("model", Value::String(s)) => meta.model = Some(s.clone()),
                ("stop_reason", Value::String(s)) => meta.stop_reason = Some(s.clone()),
                ("endpoint", Value::String(s)) => meta.endpoint = Some(s.clone()),
                ("feature", Value::String(s)) => meta.feature = Some(s.clone()),
                ("occur_time", v) => match parse_occur_time(v) {
                    Some(ts) => meta.occur_time = Some(ts),
                    None => {
                        meta.extra.insert(key, value);
                    }
                },
                _ => {
                    meta.extra.insert(key, value);
                }
            }
        }
        meta
    }
}

/// Accepts an RFC 3339 string or an epoch-seconds integer.
fn parse_occur_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Queue submission priority. Attributed traffic jumps the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

/// One unit of queued work: a single provider-call's token usage plus
/// identity context. Immutable after construction; the event id is derived
/// from the content, so identical inputs always produce the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub counters: UsageCounters,
    pub access_key_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: EventMetadata,
    event_id: String,
}

impl UsageEvent {
    pub fn new(
        counters: UsageCounters,
        access_key_id: Option<String>,
        user_id: Option<String>,
        metadata: EventMetadata,
    ) -> Self {
        let event_id = compute_event_id(&counters, &access_key_id, &user_id, &metadata);
        Self {
            counters,
            access_key_id,
            user_id,
            metadata,
            event_id,
        }
    }

    /// The deterministic idempotency key for this event.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn priority(&self) -> Priority {
        if self.access_key_id.is_some() || self.user_id.is_some() {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

/// SHA-256 over a tagged, length-unambiguous rendering of every field.
fn compute_event_id(
    counters: &UsageCounters,
    access_key_id: &Option<String>,
    user_id: &Option<String>,
    metadata: &EventMetadata,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tokenledger.usage-event.v1\0");
    for n in [
        counters.input_tokens,
        counters.cache_creation_input_tokens,
        counters.cache_read_input_tokens,
        counters.output_tokens,
    ] {
        hasher.update(n.to_be_bytes());
    }
    let mut field = |tag: &str, value: Option<&str>| {
        hasher.update(tag.as_bytes());
        hasher.update(b"=");
        if let Some(v) = value {
            hasher.update((v.len() as u64).to_be_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(b"\0");
    };
    field("access_key_id", access_key_id.as_deref());
    field("user_id", user_id.as_deref());
    field("request_id", metadata.request_id.as_deref());
    field("model", metadata.model.as_deref());
    field("stop_reason", metadata.stop_reason.as_deref());
    field("endpoint", metadata.endpoint.as_deref());
    field("feature", metadata.feature.as_deref());
    let occur = metadata.occur_time.map(|t| t.timestamp_millis().to_string());
    field("occur_time", occur.as_deref());
    for (key, value) in &metadata.extra {
        // serde_json renders object keys sorted, so this is stable
        let rendered = value.to_string();
        field(key, Some(&rendered));
    }
    hex::encode(hasher.finalize())
}
