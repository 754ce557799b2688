//! Identity lookup — the caller-identity collaborator behind a seam.
//!
//! The ingestion handler never talks to identity storage directly; it is
//! handed an implementation of this trait so tests (and alternative hosts)
//! can swap in their own resolution.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::errors::IngestError;
use crate::models::stats::Dimension;

#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Resolve an access-key id. `Ok(None)` means the id does not exist.
    async fn find_access_key(&self, id: &str) -> Result<Option<String>, IngestError>;

    /// Resolve a user id. `Ok(None)` means the id does not exist.
    async fn find_user(&self, id: &str) -> Result<Option<String>, IngestError>;

    /// Required access-key resolution: a missing id is an error.
    async fn find_required_access_key(&self, id: &str) -> Result<String, IngestError> {
        self.find_access_key(id).await?.ok_or_else(|| {
            IngestError::IdentityNotFound {
                dimension: Dimension::AccessKey,
                id: id.to_string(),
            }
        })
    }
}

/// Postgres-backed lookup against the `access_keys` / `users` tables.
#[derive(Clone)]
pub struct PgIdentityLookup {
    pool: PgPool,
}

impl PgIdentityLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityLookup for PgIdentityLookup {
    async fn find_access_key(&self, id: &str) -> Result<Option<String>, IngestError> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT id FROM access_keys WHERE id = $1 AND is_active = true",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }

    async fn find_user(&self, id: &str) -> Result<Option<String>, IngestError> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT id FROM users WHERE id = $1 AND is_active = true",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found)
    }
}
