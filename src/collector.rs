//! Usage collection ingress.
//!
//! The `Collector` turns extracted counters plus identity context into
//! immutable usage events and hands them to the channel (or, on the
//! synchronous path, straight to the ingestion handler). The
//! `ResponseForwardListener` is the glue the forwarding layer calls after a
//! completed exchange; nothing in here may ever fail the caller's response
//! flow.

use std::sync::Arc;

use crate::extract;
use crate::ingest::IngestHandler;
use crate::models::usage::{EventMetadata, UsageCounters, UsageEvent};
use crate::queue::UsageQueue;

/// Per-item outcome of a bulk submission.
#[derive(Debug)]
pub struct BatchCollectResult {
    /// Aligned with the input batch: `true` where submission succeeded.
    pub accepted: Vec<bool>,
}

impl BatchCollectResult {
    pub fn accepted_count(&self) -> usize {
        self.accepted.iter().filter(|ok| **ok).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.accepted.len() - self.accepted_count()
    }
}

pub struct Collector {
    queue: UsageQueue,
    handler: Arc<IngestHandler>,
}

impl Collector {
    pub fn new(queue: UsageQueue, handler: Arc<IngestHandler>) -> Self {
        Self { queue, handler }
    }

    /// Build a usage event and submit it to the asynchronous channel.
    /// Returns whether *submission* succeeded; persistence is decoupled.
    pub fn collect_usage(
        &self,
        counters: UsageCounters,
        access_key_id: Option<String>,
        user_id: Option<String>,
        metadata: EventMetadata,
    ) -> bool {
        let event = UsageEvent::new(counters, access_key_id, user_id, metadata);
        self.queue.submit(event)
    }

    /// Bypass the queue and persist inline. Returns whether the event was
    /// handled to completion (a no-identity no-op counts as handled).
    pub async fn collect_usage_sync(
        &self,
        counters: UsageCounters,
        access_key_id: Option<String>,
        user_id: Option<String>,
        metadata: EventMetadata,
    ) -> bool {
        let event = UsageEvent::new(counters, access_key_id, user_id, metadata);
        match self.handler.handle(&event).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(event_id = %event.event_id(), "synchronous usage collection failed: {e}");
                false
            }
        }
    }

    /// Bulk submission. Partial failure is expected and reported per item.
    pub fn collect_batch_usage(&self, events: Vec<UsageEvent>) -> BatchCollectResult {
        let accepted = events
            .into_iter()
            .map(|event| self.queue.submit(event))
            .collect();
        BatchCollectResult { accepted }
    }
}

/// Paths that count as the provider's API surface. Only completed calls to
/// these carry usage worth recording.
const PROVIDER_API_PATHS: &[&str] = &["/v1/messages", "/v1/chat/completions", "/v1/completions"];

pub fn is_provider_path(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    PROVIDER_API_PATHS
        .iter()
        .any(|p| path == *p || path.ends_with(*p))
}

/// Hooked in by the forwarding layer after an upstream exchange completes.
///
/// Filters out non-2xx responses and non-provider paths before any parsing
/// happens, extracts usage plus companion metadata, and submits. Failures
/// are logged and swallowed — telemetry must never break the response path.
pub struct ResponseForwardListener {
    collector: Arc<Collector>,
}

impl ResponseForwardListener {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }

    pub fn on_response_complete(
        &self,
        path: &str,
        status: u16,
        body: &[u8],
        access_key_id: Option<String>,
        user_id: Option<String>,
    ) {
        if !(200..300).contains(&status) || !is_provider_path(path) {
            return;
        }
        let Some(counters) = extract::extract_usage(body) else {
            return;
        };
        // absent and present-but-empty are the same: nothing to record
        if counters.is_empty() {
            return;
        }

        let mut metadata = EventMetadata::default();
        metadata.model = extract::extract_model(body);
        metadata.request_id = extract::extract_request_id(body);
        metadata.endpoint = Some(path.split('?').next().unwrap_or(path).to_string());

        if !self
            .collector
            .collect_usage(counters, access_key_id, user_id, metadata)
        {
            tracing::warn!(path, "usage submission failed, telemetry dropped for this call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::errors::IngestError;
    use crate::identity::IdentityLookup;
    use crate::models::stats::UsageLogEntry;
    use crate::queue::usage_channel;
    use crate::store::UsageStore;

    struct OpenLookup;

    #[async_trait]
    impl IdentityLookup for OpenLookup {
        async fn find_access_key(&self, id: &str) -> Result<Option<String>, IngestError> {
            Ok(Some(id.to_string()))
        }

        async fn find_user(&self, id: &str) -> Result<Option<String>, IngestError> {
            Ok(Some(id.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        rows: Mutex<Vec<UsageLogEntry>>,
    }

    #[async_trait]
    impl UsageStore for RecordingStore {
        async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<u64, IngestError> {
            let mut rows = self.rows.lock().unwrap();
            let mut written = 0;
            for entry in entries {
                let duplicate = rows
                    .iter()
                    .any(|r| r.event_id == entry.event_id && r.owner == entry.owner);
                if !duplicate {
                    rows.push(entry.clone());
                    written += 1;
                }
            }
            Ok(written)
        }
    }

    fn pipeline(capacity: usize) -> (Arc<Collector>, Arc<RecordingStore>, Arc<crate::queue::UsageReceiver>) {
        let store = Arc::new(RecordingStore::default());
        let handler = Arc::new(IngestHandler::new(store.clone(), Arc::new(OpenLookup)));
        let (queue, rx) = usage_channel(capacity);
        (Arc::new(Collector::new(queue, handler)), store, rx)
    }

    fn counters() -> UsageCounters {
        UsageCounters {
            input_tokens: 5,
            output_tokens: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_collect_usage_reports_submission_only() {
        let (collector, store, rx) = pipeline(4);
        assert!(collector.collect_usage(
            counters(),
            Some("ak_1".into()),
            None,
            EventMetadata::default(),
        ));
        // submitted but not yet persisted
        assert!(store.rows.lock().unwrap().is_empty());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_collect_usage_sync_persists_inline() {
        let (collector, store, _rx) = pipeline(4);
        assert!(
            collector
                .collect_usage_sync(
                    counters(),
                    Some("ak_1".into()),
                    None,
                    EventMetadata::default(),
                )
                .await
        );
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collect_batch_reports_per_item() {
        let (collector, _store, _rx) = pipeline(2);
        let events: Vec<_> = (0..4)
            .map(|n| {
                UsageEvent::new(
                    UsageCounters {
                        input_tokens: n,
                        ..Default::default()
                    },
                    None,
                    None,
                    EventMetadata::default(),
                )
            })
            .collect();
        let result = collector.collect_batch_usage(events);
        // lane capacity 2: first two accepted, rest rejected
        assert_eq!(result.accepted, vec![true, true, false, false]);
        assert_eq!(result.accepted_count(), 2);
        assert_eq!(result.rejected_count(), 2);
    }

    // ── Listener filtering ──────────────────────────────────────

    const BODY: &[u8] = br#"{"id":"msg_123456","model":"claude-3-opus","usage":{"input_tokens":100,"cache_creation_input_tokens":50,"cache_read_input_tokens":25,"output_tokens":75}}"#;

    #[tokio::test]
    async fn test_listener_records_successful_provider_call() {
        let (collector, _store, rx) = pipeline(4);
        let listener = ResponseForwardListener::new(collector);
        listener.on_response_complete("/v1/messages", 200, BODY, Some("ak_1".into()), None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.access_key_id.as_deref(), Some("ak_1"));
        assert_eq!(event.counters.input_tokens, 100);
        assert_eq!(event.counters.total_tokens(), 250);
    }

    #[tokio::test]
    async fn test_listener_ignores_error_status() {
        let (collector, _store, rx) = pipeline(4);
        let listener = ResponseForwardListener::new(collector);
        listener.on_response_complete("/v1/messages", 500, BODY, Some("ak_1".into()), None);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_listener_ignores_non_provider_path() {
        let (collector, _store, rx) = pipeline(4);
        let listener = ResponseForwardListener::new(collector);
        listener.on_response_complete("/v1/models", 200, BODY, Some("ak_1".into()), None);
        listener.on_response_complete("/healthz", 200, BODY, None, None);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_listener_ignores_body_without_usage() {
        let (collector, _store, rx) = pipeline(4);
        let listener = ResponseForwardListener::new(collector);
        listener.on_response_complete(
            "/v1/messages",
            200,
            br#"{"id":"msg_1","content":[]}"#,
            Some("ak_1".into()),
            None,
        );
        listener.on_response_complete("/v1/messages", 200, br#"{"usage":{}}"#, None, None);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_listener_populates_companion_metadata() {
        let (collector, _store, rx) = pipeline(4);
        let listener = ResponseForwardListener::new(collector);
        listener.on_response_complete("/v1/messages", 200, BODY, Some("ak_1".into()), None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.metadata.model.as_deref(), Some("claude-3-opus"));
        assert_eq!(event.metadata.request_id.as_deref(), Some("msg_123456"));
        assert_eq!(event.metadata.endpoint.as_deref(), Some("/v1/messages"));
        assert_eq!(event.counters.total_tokens(), 250);
    }

    #[test]
    fn test_provider_path_matching() {
        assert!(is_provider_path("/v1/messages"));
        assert!(is_provider_path("/v1/chat/completions"));
        assert!(is_provider_path("/proxy/v1/messages"));
        assert!(is_provider_path("/v1/messages?beta=true"));
        assert!(!is_provider_path("/v1/models"));
        assert!(!is_provider_path("/v1/messages/count_tokens"));
    }
}
