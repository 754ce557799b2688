pub mod postgres;

use async_trait::async_trait;

use crate::errors::IngestError;
use crate::models::stats::UsageLogEntry;

/// The one thing the pipeline needs from a storage engine: appending a
/// message's staged log rows as a single atomic unit.
///
/// Implementations must commit all entries or none — a dual-identity event
/// may never leave exactly one of its two rows behind. Appends are expected
/// to be idempotent per event id, so redelivered messages land as no-ops.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Persist the entries atomically. Returns how many rows were newly
    /// written (redelivered entries count zero).
    async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<u64, IngestError>;
}

pub use postgres::PgStore;
