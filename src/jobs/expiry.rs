//! Background job: expire old statistics buckets.
//!
//! Runs hourly. Deletes only derived statistics rows — raw usage logs are
//! the source of truth and follow their own retention policy.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time;

use crate::aggregate;

/// Spawn the statistics expiry task. Call this once at startup.
pub fn spawn(pool: PgPool, retention_days: i64) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(3600));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - ChronoDuration::days(retention_days);
            match aggregate::cleanup_expired_data(&pool, cutoff).await {
                Ok(0) => {}
                Ok(deleted) => {
                    tracing::info!(rows = deleted, %cutoff, "expired statistics buckets deleted");
                }
                Err(e) => tracing::error!("statistics expiry job failed: {e}"),
            }
        }
    });
}
