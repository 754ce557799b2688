//! Usage message consumer: resolves identity references and persists the
//! per-dimension log rows for one event as a single atomic unit.
//!
//! The handler never retries; any failure propagates to the delivery layer,
//! which owns retry/backoff/poison policy. An event that resolves no
//! identity at all is a logged no-op, handled successfully.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::errors::IngestError;
use crate::identity::IdentityLookup;
use crate::models::stats::{Dimension, UsageLogEntry};
use crate::models::usage::UsageEvent;
use crate::queue::UsageReceiver;
use crate::store::UsageStore;

/// How a message left the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// At least one log row was staged and the unit committed.
    /// `rows_written` is zero when every entry was a redelivery.
    Committed { rows_written: u64 },
    /// Neither identity resolved; nothing was persisted.
    NoIdentity,
}

pub struct IngestHandler {
    store: Arc<dyn UsageStore>,
    identities: Arc<dyn IdentityLookup>,
}

impl IngestHandler {
    pub fn new(store: Arc<dyn UsageStore>, identities: Arc<dyn IdentityLookup>) -> Self {
        Self { store, identities }
    }

    /// Process one usage message to completion.
    pub async fn handle(&self, event: &UsageEvent) -> Result<IngestOutcome, IngestError> {
        // An access-key reference is expected to resolve; a dangling id is
        // fatal for this message.
        let access_key = match &event.access_key_id {
            Some(id) => Some(self.identities.find_required_access_key(id).await?),
            None => None,
        };
        // The user reference is optional today; unresolved ids are tolerated.
        let user = match &event.user_id {
            Some(id) => self.identities.find_user(id).await?,
            None => None,
        };

        let occur_time = event.metadata.occur_time.unwrap_or_else(Utc::now);

        let mut entries = Vec::with_capacity(2);
        if let Some(access_key_id) = &access_key {
            entries.push(self.build_entry(
                event,
                Dimension::AccessKey,
                access_key_id.clone(),
                user.clone(),
                occur_time,
            ));
        }
        if let Some(user_id) = &user {
            entries.push(self.build_entry(
                event,
                Dimension::User,
                user_id.clone(),
                access_key.clone(),
                occur_time,
            ));
        }

        if entries.is_empty() {
            tracing::warn!(
                event_id = %event.event_id(),
                "usage event resolved no identity, dropping"
            );
            return Ok(IngestOutcome::NoIdentity);
        }

        let rows_written = self.store.append_usage(&entries).await?;
        tracing::debug!(
            event_id = %event.event_id(),
            rows = rows_written,
            "usage event persisted"
        );
        Ok(IngestOutcome::Committed { rows_written })
    }

    fn build_entry(
        &self,
        event: &UsageEvent,
        owner: Dimension,
        owner_id: String,
        cross_ref_id: Option<String>,
        occur_time: chrono::DateTime<Utc>,
    ) -> UsageLogEntry {
        let meta = &event.metadata;
        UsageLogEntry {
            owner,
            owner_id,
            cross_ref_id,
            event_id: event.event_id().to_string(),
            counters: event.counters,
            request_id: meta.request_id.clone(),
            model: meta.model.clone(),
            stop_reason: meta.stop_reason.clone(),
            endpoint: meta.endpoint.clone(),
            feature: meta.feature.clone(),
            occur_time,
        }
    }
}

/// Spawn the consumer pool. Workers exit once the channel closes and drains.
pub fn spawn_consumers(
    handler: Arc<IngestHandler>,
    receiver: Arc<UsageReceiver>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let handler = handler.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    if let Err(e) = handler.handle(&event).await {
                        tracing::error!(
                            event_id = %event.event_id(),
                            worker,
                            "usage ingestion failed: {e}"
                        );
                    }
                }
                tracing::debug!(worker, "usage consumer stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use crate::models::usage::{EventMetadata, UsageCounters};

    struct FakeLookup {
        access_keys: HashSet<String>,
        users: HashSet<String>,
    }

    #[async_trait]
    impl IdentityLookup for FakeLookup {
        async fn find_access_key(&self, id: &str) -> Result<Option<String>, IngestError> {
            Ok(self.access_keys.contains(id).then(|| id.to_string()))
        }

        async fn find_user(&self, id: &str) -> Result<Option<String>, IngestError> {
            Ok(self.users.contains(id).then(|| id.to_string()))
        }
    }

    /// Atomic in-memory store: all entries land in one locked push,
    /// deduplicated by event id like the real table constraint.
    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<Vec<UsageLogEntry>>,
        fail: bool,
    }

    #[async_trait]
    impl UsageStore for FakeStore {
        async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<u64, IngestError> {
            if self.fail {
                return Err(IngestError::Database(sqlx::Error::PoolClosed));
            }
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

    fn handler_with(
        access_keys: &[&str],
        users: &[&str],
    ) -> (IngestHandler, Arc<FakeStore>) {
        let store = Arc::new(FakeStore::default());
        let lookup = Arc::new(FakeLookup {
            access_keys: access_keys.iter().map(|s| s.to_string()).collect(),
            users: users.iter().map(|s| s.to_string()).collect(),
        });
        (IngestHandler::new(store.clone(), lookup), store)
    }

    fn event(access_key: Option<&str>, user: Option<&str>) -> UsageEvent {
        let counters = UsageCounters {
            input_tokens: 10,
            output_tokens: 20,
            ..Default::default()
        };
        let mut meta = EventMetadata::default();
        meta.model = Some("claude-3-opus".into());
        meta.request_id = Some("msg_1".into());
        UsageEvent::new(
            counters,
            access_key.map(String::from),
            user.map(String::from),
            meta,
        )
    }

    #[tokio::test]
    async fn test_access_key_only_writes_one_row() {
        let (handler, store) = handler_with(&["ak_1"], &[]);
        let outcome = handler.handle(&event(Some("ak_1"), None)).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Committed { rows_written: 1 });

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, Dimension::AccessKey);
        assert_eq!(rows[0].owner_id, "ak_1");
        assert!(rows[0].cross_ref_id.is_none());
        assert_eq!(rows[0].model.as_deref(), Some("claude-3-opus"));
    }

    #[tokio::test]
    async fn test_dual_identity_writes_both_rows_cross_referenced() {
        let (handler, store) = handler_with(&["ak_1"], &["u_1"]);
        let outcome = handler
            .handle(&event(Some("ak_1"), Some("u_1")))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Committed { rows_written: 2 });

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 2);
        let ak_row = rows.iter().find(|r| r.owner == Dimension::AccessKey).unwrap();
        let user_row = rows.iter().find(|r| r.owner == Dimension::User).unwrap();
        assert_eq!(ak_row.cross_ref_id.as_deref(), Some("u_1"));
        assert_eq!(user_row.cross_ref_id.as_deref(), Some("ak_1"));
        assert_eq!(ak_row.event_id, user_row.event_id);
    }

    #[tokio::test]
    async fn test_missing_access_key_is_fatal() {
        let (handler, store) = handler_with(&[], &[]);
        let err = handler
            .handle(&event(Some("ak_missing"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::IdentityNotFound { .. }));
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_user_is_tolerated() {
        let (handler, store) = handler_with(&["ak_1"], &[]);
        let outcome = handler
            .handle(&event(Some("ak_1"), Some("u_unknown")))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Committed { rows_written: 1 });
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, Dimension::AccessKey);
    }

    #[tokio::test]
    async fn test_no_identity_is_a_successful_no_op() {
        let (handler, store) = handler_with(&[], &["u_1"]);
        let outcome = handler.handle(&event(None, Some("u_x"))).await.unwrap();
        assert_eq!(outcome, IngestOutcome::NoIdentity);
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(FakeStore {
            fail: true,
            ..Default::default()
        });
        let lookup = Arc::new(FakeLookup {
            access_keys: HashSet::from(["ak_1".to_string()]),
            users: HashSet::new(),
        });
        let handler = IngestHandler::new(store, lookup);
        let err = handler.handle(&event(Some("ak_1"), None)).await.unwrap_err();
        assert!(matches!(err, IngestError::Database(_)));
    }

    #[tokio::test]
    async fn test_redelivery_commits_as_no_op() {
        let (handler, store) = handler_with(&["ak_1"], &[]);
        let ev = event(Some("ak_1"), None);
        let first = handler.handle(&ev).await.unwrap();
        let second = handler.handle(&ev).await.unwrap();
        assert_eq!(first, IngestOutcome::Committed { rows_written: 1 });
        assert_eq!(second, IngestOutcome::Committed { rows_written: 0 });
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_occur_time_prefers_metadata() {
        let (handler, store) = handler_with(&["ak_1"], &[]);
        let occur = chrono::DateTime::parse_from_rfc3339("2025-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut meta = EventMetadata::default();
        meta.occur_time = Some(occur);
        let ev = UsageEvent::new(
            UsageCounters {
                input_tokens: 1,
                ..Default::default()
            },
            Some("ak_1".into()),
            None,
            meta,
        );
        handler.handle(&ev).await.unwrap();
        assert_eq!(store.rows.lock().unwrap()[0].occur_time, occur);
    }

    #[tokio::test]
    async fn test_occur_time_defaults_to_processing_instant() {
        let (handler, store) = handler_with(&["ak_1"], &[]);
        let before = Utc::now();
        handler.handle(&event(Some("ak_1"), None)).await.unwrap();
        let after = Utc::now();
        let occur = store.rows.lock().unwrap()[0].occur_time;
        assert!(before <= occur && occur <= after);
    }
}
