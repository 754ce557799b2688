//! Aggregation of raw usage logs into time-bucketed statistics.
//!
//! Incremental aggregation folds a window of log rows into the statistics
//! table with additive upserts; one window is one transaction, so a failed
//! window can be retried without double-folding the granularities that had
//! already succeeded. Rebuild is the idempotent repair path: it recomputes
//! whole buckets from the raw log and replaces the existing rows.

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::IngestError;
use crate::models::stats::{Dimension, Period};
use crate::store::postgres::log_table;

/// Outcome of one incremental aggregation window.
#[derive(Debug, Default)]
pub struct AggregationOutcome {
    /// Log rows scanned in the window, across both dimensions.
    pub processed_count: u64,
    /// Statistics rows inserted or updated.
    pub updated_stat_rows: u64,
    pub errors: Vec<String>,
}

const DIMENSIONS: [Dimension; 2] = [Dimension::AccessKey, Dimension::User];

/// Lookback for the very first scheduled run, before a watermark exists.
const INITIAL_LOOKBACK_HOURS: i64 = 1;

fn upsert_sql(dimension: Dimension, period: Period) -> String {
    let (table, owner) = log_table(dimension);
    let dim = dimension.as_str();
    let p = period.as_str();
    format!(
        r#"INSERT INTO usage_statistics
               (dimension_type, dimension_id, period_type, period_start, period_end,
                input_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                output_tokens, total_requests, last_update_time)
           SELECT '{dim}', {owner}, '{p}', date_trunc('{p}', occur_time),
                  date_trunc('{p}', occur_time) + interval '1 {p}',
                  SUM(input_tokens), SUM(cache_creation_input_tokens),
                  SUM(cache_read_input_tokens), SUM(output_tokens),
                  COUNT(*), NOW()
           FROM {table}
           WHERE occur_time >= $1 AND occur_time < $2
           GROUP BY {owner}, date_trunc('{p}', occur_time)
           ON CONFLICT (dimension_type, dimension_id, period_type, period_start)
           DO UPDATE SET
               input_tokens = usage_statistics.input_tokens + EXCLUDED.input_tokens,
               cache_creation_input_tokens = usage_statistics.cache_creation_input_tokens + EXCLUDED.cache_creation_input_tokens,
               cache_read_input_tokens = usage_statistics.cache_read_input_tokens + EXCLUDED.cache_read_input_tokens,
               output_tokens = usage_statistics.output_tokens + EXCLUDED.output_tokens,
               total_requests = usage_statistics.total_requests + EXCLUDED.total_requests,
               period_end = EXCLUDED.period_end,
               last_update_time = NOW()"#,
    )
}

fn rebuild_insert_sql(dimension: Dimension, period: Period) -> String {
    let (table, owner) = log_table(dimension);
    let dim = dimension.as_str();
    let p = period.as_str();
    format!(
        r#"INSERT INTO usage_statistics
               (dimension_type, dimension_id, period_type, period_start, period_end,
                input_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                output_tokens, total_requests, last_update_time)
           SELECT '{dim}', {owner}, '{p}', date_trunc('{p}', occur_time),
                  date_trunc('{p}', occur_time) + interval '1 {p}',
                  SUM(input_tokens), SUM(cache_creation_input_tokens),
                  SUM(cache_read_input_tokens), SUM(output_tokens),
                  COUNT(*), NOW()
           FROM {table}
           WHERE {owner} = $1 AND occur_time >= $2 AND occur_time < $3
           GROUP BY {owner}, date_trunc('{p}', occur_time)"#,
    )
}

async fn aggregate_window(
    tx: &mut Transaction<'_, Postgres>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<(u64, u64), sqlx::Error> {
    let mut processed = 0u64;
    let mut updated = 0u64;
    for dimension in DIMENSIONS {
        let (table, _) = log_table(dimension);
        let count_sql =
            format!("SELECT COUNT(*)::bigint FROM {table} WHERE occur_time >= $1 AND occur_time < $2");
        let scanned = sqlx::query_scalar::<_, i64>(&count_sql)
            .bind(from)
            .bind(to)
            .fetch_one(&mut **tx)
            .await?;
        processed += scanned as u64;
        if scanned == 0 {
            continue;
        }
        for period in Period::ALL {
            let result = sqlx::query(&upsert_sql(dimension, period))
                .bind(from)
                .bind(to)
                .execute(&mut **tx)
                .await?;
            updated += result.rows_affected();
        }
    }
    Ok((processed, updated))
}

/// Fold log rows with `occur_time` in `[from, to)` into the statistics
/// table, for every dimension and granularity.
///
/// The whole window runs in one transaction and fails as a unit. Safe to
/// invoke repeatedly only over non-overlapping windows — the caller owns
/// that guarantee; re-aggregating an already-folded window double-counts.
/// Errors are reported in the outcome, not raised.
pub async fn perform_incremental_aggregation(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> AggregationOutcome {
    let mut outcome = AggregationOutcome::default();
    if to <= from {
        return outcome;
    }
    let result: Result<(u64, u64), sqlx::Error> = async {
        let mut tx = pool.begin().await?;
        let counts = aggregate_window(&mut tx, from, to).await?;
        tx.commit().await?;
        Ok(counts)
    }
    .await;
    match result {
        Ok((processed, updated)) => {
            outcome.processed_count = processed;
            outcome.updated_stat_rows = updated;
        }
        Err(e) => {
            tracing::error!(%from, %to, "incremental aggregation failed: {e}");
            outcome.errors.push(e.to_string());
        }
    }
    outcome
}

/// Scheduled entry point: aggregate `[watermark, now)` and advance the
/// watermark in the same transaction. The `FOR UPDATE` row lock keeps two
/// schedulers from folding the same window.
pub async fn run_scheduled_aggregation(pool: &PgPool) -> anyhow::Result<AggregationOutcome> {
    let to = Utc::now();
    let mut tx = pool.begin().await?;
    let from = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT watermark FROM aggregation_watermark WHERE id = 1 FOR UPDATE",
    )
    .fetch_optional(&mut *tx)
    .await?
    .unwrap_or_else(|| to - Duration::hours(INITIAL_LOOKBACK_HOURS));

    let mut outcome = AggregationOutcome::default();
    if to <= from {
        return Ok(outcome);
    }
    let (processed, updated) = aggregate_window(&mut tx, from, to).await?;
    sqlx::query(
        r#"INSERT INTO aggregation_watermark (id, watermark)
           VALUES (1, $1)
           ON CONFLICT (id) DO UPDATE SET watermark = EXCLUDED.watermark"#,
    )
    .bind(to)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    outcome.processed_count = processed;
    outcome.updated_stat_rows = updated;
    tracing::debug!(
        %from, %to,
        processed = outcome.processed_count,
        updated = outcome.updated_stat_rows,
        "aggregation window folded"
    );
    Ok(outcome)
}

/// Widen `[start, end)` to whole bucket boundaries for a granularity, so a
/// rebuild can never split a bucket between old and recomputed totals.
fn widen_to_buckets(
    period: Period,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let (widened_start, _) = period.bounds(start);
    let (end_bucket_start, end_bucket_end) = period.bounds(end);
    let widened_end = if end == end_bucket_start {
        end
    } else {
        end_bucket_end
    };
    (widened_start, widened_end)
}

/// Recompute every statistics bucket for one dimension over a range from
/// the raw log, replacing whatever was there. Idempotent: identical inputs
/// produce identical rows on every run.
pub async fn rebuild_aggregate_data(
    pool: &PgPool,
    dimension: Dimension,
    dimension_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<u64, IngestError> {
    if end <= start {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut rebuilt = 0u64;
    for period in Period::ALL {
        let (widened_start, widened_end) = widen_to_buckets(period, start, end);
        sqlx::query(
            r#"DELETE FROM usage_statistics
               WHERE dimension_type = $1 AND dimension_id = $2 AND period_type = $3
                 AND period_start >= $4 AND period_start < $5"#,
        )
        .bind(dimension.as_str())
        .bind(dimension_id)
        .bind(period.as_str())
        .bind(widened_start)
        .bind(widened_end)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(&rebuild_insert_sql(dimension, period))
            .bind(dimension_id)
            .bind(widened_start)
            .bind(widened_end)
            .execute(&mut *tx)
            .await?;
        rebuilt += result.rows_affected();
    }
    tx.commit().await?;
    tracing::info!(
        dimension = %dimension,
        dimension_id,
        %start, %end,
        rows = rebuilt,
        "statistics rebuilt"
    );
    Ok(rebuilt)
}

/// Delete statistics buckets that ended before the cutoff. Raw log rows are
/// never touched — their retention is a separate policy.
pub async fn cleanup_expired_data(
    pool: &PgPool,
    before: DateTime<Utc>,
) -> Result<u64, IngestError> {
    let result = sqlx::query("DELETE FROM usage_statistics WHERE period_end < $1")
        .bind(before)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
