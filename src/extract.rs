//! Usage extraction from raw provider response bodies.
//!
//! Handles both plain JSON responses and Server-Sent-Events streams.
//! Extraction is strictly best-effort: malformed input never raises, it
//! just yields "no usage data".

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::models::usage::UsageCounters;

static MODEL_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""model"\s*:\s*"([^"]+)""#).unwrap());
static MESSAGE_ID_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*"(msg_[^"]+)""#).unwrap());

/// Extract token-usage counters from a response body.
///
/// Streaming bodies are scanned record by record and the **last** non-empty
/// `usage` object wins — providers emit cumulative usage over the stream and
/// the final record carries the authoritative totals. Non-streaming bodies
/// are decoded once and probed for a top-level `usage` object.
///
/// Returns `None` when no usage object is found anywhere. A `Some` holding
/// empty counters means a usage object existed but carried nothing; callers
/// treat both outcomes identically.
pub fn extract_usage(body: &[u8]) -> Option<UsageCounters> {
    let text = std::str::from_utf8(body).ok()?;
    if looks_like_stream(text) {
        extract_from_stream(text)
    } else {
        let root: Value = serde_json::from_str(text).ok()?;
        root.get("usage")
            .filter(|u| u.is_object())
            .map(UsageCounters::from_json)
    }
}

fn looks_like_stream(text: &str) -> bool {
    let head = text.trim_start();
    head.starts_with("event:") || head.starts_with("data:") || text.contains("\ndata:")
}

fn extract_from_stream(text: &str) -> Option<UsageCounters> {
    let mut last_non_empty: Option<UsageCounters> = None;
    let mut saw_usage = false;

    for line in text.lines() {
        let line = line.trim();
        // comments, event names, blank keep-alives
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let data = match line.strip_prefix("data:") {
            Some(rest) => rest.trim(),
            None => continue,
        };
        if data == "[DONE]" {
            continue;
        }
        // one bad record must not poison the rest of the stream
        let record: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let usage = record
            .get("usage")
            .or_else(|| record.get("message").and_then(|m| m.get("usage")));
        if let Some(usage) = usage.filter(|u| u.is_object()) {
            saw_usage = true;
            let counters = UsageCounters::from_json(usage);
            if !counters.is_empty() {
                last_non_empty = Some(counters);
            }
        }
    }

    match last_non_empty {
        Some(counters) => Some(counters),
        None if saw_usage => Some(UsageCounters::default()),
        None => None,
    }
}

/// Best-effort model name extraction, independent of the usage path.
///
/// Prefers a top-level `model` string when the body is standalone JSON,
/// otherwise falls back to a permissive fragment match.
pub fn extract_model(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    if let Ok(root) = serde_json::from_str::<Value>(text) {
        if let Some(model) = root.get("model").and_then(Value::as_str) {
            return Some(model.to_string());
        }
    }
    MODEL_FRAGMENT
        .captures(text)
        .map(|c| c[1].to_string())
}

/// Best-effort message id extraction (`msg_…`), independent of the usage path.
pub fn extract_request_id(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    if let Ok(root) = serde_json::from_str::<Value>(text) {
        if let Some(id) = root.get("id").and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    MESSAGE_ID_FRAGMENT
        .captures(text)
        .map(|c| c[1].to_string())
}
