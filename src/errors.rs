use thiserror::Error;

use crate::models::stats::Dimension;

/// Failures that abort ingestion of a single usage message.
///
/// Parse failures never appear here — the extractor returns an absent
/// result instead of raising. A message that resolves no identity is a
/// logged no-op, not an error.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A referenced identity id was expected to exist but does not.
    /// Fatal for the current message; the delivery layer owns retry policy.
    #[error("{dimension} not found: {id}")]
    IdentityNotFound { dimension: Dimension, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The usage channel has shut down; no further messages can be submitted.
    #[error("usage channel closed")]
    ChannelClosed,
}
