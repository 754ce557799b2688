//! Background job: fold new usage log rows into statistics buckets.
//!
//! Each tick aggregates `[watermark, now)` and advances the watermark in the
//! same transaction, so scheduled windows never overlap even across worker
//! restarts.

use sqlx::PgPool;
use std::time::Duration;
use tokio::time;

use crate::aggregate;

/// Spawn the aggregation scheduler. Call this once at startup.
pub fn spawn(pool: PgPool, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match aggregate::run_scheduled_aggregation(&pool).await {
                Ok(outcome) if outcome.processed_count > 0 => {
                    tracing::info!(
                        processed = outcome.processed_count,
                        updated = outcome.updated_stat_rows,
                        "usage aggregation tick"
                    );
                }
                Ok(_) => {}
                // window rolled back whole; next tick retries it
                Err(e) => tracing::error!("aggregation job failed: {e}"),
            }
        }
    });
}
