use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::IngestError;
use crate::models::stats::{
    Dimension, DimensionTotalsRow, Period, TopConsumerRow, UsageLogEntry, UsageLogRow,
    UsageStatisticsRow,
};
use crate::store::UsageStore;

/// Physical table and owner column for a dimension's usage log.
pub(crate) fn log_table(dimension: Dimension) -> (&'static str, &'static str) {
    match dimension {
        Dimension::AccessKey => ("access_key_usage_log", "access_key_id"),
        Dimension::User => ("user_usage_log", "user_id"),
    }
}

fn cross_ref_column(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::AccessKey => "user_id",
        Dimension::User => "access_key_id",
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Statistics Queries --

    /// Statistics buckets for one dimension over `[start, end)`, ascending
    /// by period start.
    pub async fn get_statistics(
        &self,
        dimension: Dimension,
        dimension_id: &str,
        period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageStatisticsRow>> {
        let rows = sqlx::query_as::<_, UsageStatisticsRow>(
            r#"SELECT dimension_type, dimension_id, period_type, period_start, period_end,
                      input_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                      output_tokens, total_requests, last_update_time
               FROM usage_statistics
               WHERE dimension_type = $1 AND dimension_id = $2 AND period_type = $3
                 AND period_start >= $4 AND period_start < $5
               ORDER BY period_start ASC"#,
        )
        .bind(dimension.as_str())
        .bind(dimension_id)
        .bind(period.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every statistics bucket in `[start, end)` regardless of dimension,
    /// for bulk export.
    pub async fn export_statistics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageStatisticsRow>> {
        let rows = sqlx::query_as::<_, UsageStatisticsRow>(
            r#"SELECT dimension_type, dimension_id, period_type, period_start, period_end,
                      input_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                      output_tokens, total_requests, last_update_time
               FROM usage_statistics
               WHERE period_start >= $1 AND period_start < $2
               ORDER BY dimension_type ASC, dimension_id ASC, period_type ASC, period_start ASC"#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Usage Log Queries --

    /// Paginated detail listing for one owner, newest first.
    pub async fn list_usage_log(
        &self,
        dimension: Dimension,
        owner_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<UsageLogRow>> {
        let (table, owner) = log_table(dimension);
        let cross = cross_ref_column(dimension);
        let sql = format!(
            r#"SELECT id, {owner} AS owner_id, {cross} AS cross_ref_id, event_id,
                      input_tokens, cache_creation_input_tokens, cache_read_input_tokens,
                      output_tokens, request_id, model, stop_reason, endpoint, feature,
                      occur_time, created_at
               FROM {table}
               WHERE {owner} = $1 AND occur_time >= $2 AND occur_time < $3
               ORDER BY occur_time DESC
               LIMIT $4 OFFSET $5"#,
        );
        let rows = sqlx::query_as::<_, UsageLogRow>(&sql)
            .bind(owner_id)
            .bind(start)
            .bind(end)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Top consumers by total tokens over `[start, end)`, from the raw log
    /// so first/last usage times are exact.
    pub async fn top_dimensions(
        &self,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TopConsumerRow>> {
        let (table, owner) = log_table(dimension);
        let sql = format!(
            r#"SELECT {owner} AS dimension_id,
                      COUNT(*)::bigint AS total_requests,
                      COALESCE(SUM(input_tokens), 0)::bigint AS input_tokens,
                      COALESCE(SUM(cache_creation_input_tokens), 0)::bigint AS cache_creation_input_tokens,
                      COALESCE(SUM(cache_read_input_tokens), 0)::bigint AS cache_read_input_tokens,
                      COALESCE(SUM(output_tokens), 0)::bigint AS output_tokens,
                      COALESCE(SUM(input_tokens + cache_creation_input_tokens
                                   + cache_read_input_tokens + output_tokens), 0)::bigint AS total_tokens,
                      MIN(occur_time) AS first_usage_time,
                      MAX(occur_time) AS last_usage_time
               FROM {table}
               WHERE occur_time >= $1 AND occur_time < $2
               GROUP BY {owner}
               ORDER BY total_tokens DESC
               LIMIT $3"#,
        );
        let rows = sqlx::query_as::<_, TopConsumerRow>(&sql)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// System-wide totals for one dimension's log over `[start, end)`.
    pub async fn dimension_totals(
        &self,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<DimensionTotalsRow> {
        let (table, owner) = log_table(dimension);
        let sql = format!(
            r#"SELECT COUNT(*)::bigint AS total_requests,
                      COALESCE(SUM(input_tokens), 0)::bigint AS input_tokens,
                      COALESCE(SUM(cache_creation_input_tokens), 0)::bigint AS cache_creation_input_tokens,
                      COALESCE(SUM(cache_read_input_tokens), 0)::bigint AS cache_read_input_tokens,
                      COALESCE(SUM(output_tokens), 0)::bigint AS output_tokens,
                      COUNT(DISTINCT {owner})::bigint AS active_dimensions
               FROM {table}
               WHERE occur_time >= $1 AND occur_time < $2"#,
        );
        let row = sqlx::query_as::<_, DimensionTotalsRow>(&sql)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// Raw log row count for one dimension over `[start, end)`.
    pub async fn count_log_rows(
        &self,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let (table, _) = log_table(dimension);
        let sql =
            format!("SELECT COUNT(*)::bigint FROM {table} WHERE occur_time >= $1 AND occur_time < $2");
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Aggregated request count for one dimension over `[start, end)`,
    /// measured on the day granularity so each request counts once.
    pub async fn sum_aggregated_requests(
        &self,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let sum = sqlx::query_scalar::<_, i64>(
            r#"SELECT COALESCE(SUM(total_requests), 0)::bigint
               FROM usage_statistics
               WHERE dimension_type = $1 AND period_type = 'day'
                 AND period_start >= $2 AND period_start < $3"#,
        )
        .bind(dimension.as_str())
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn append_usage(&self, entries: &[UsageLogEntry]) -> Result<u64, IngestError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for entry in entries {
            let (table, owner) = log_table(entry.owner);
            let cross = cross_ref_column(entry.owner);
            let sql = format!(
                r#"INSERT INTO {table}
                       ({owner}, {cross}, event_id,
                        input_tokens, cache_creation_input_tokens,
                        cache_read_input_tokens, output_tokens,
                        request_id, model, stop_reason, endpoint, feature, occur_time)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                   ON CONFLICT (event_id) DO NOTHING"#,
            );
            let result = sqlx::query(&sql)
                .bind(&entry.owner_id)
                .bind(&entry.cross_ref_id)
                .bind(&entry.event_id)
                .bind(entry.counters.input_tokens as i64)
                .bind(entry.counters.cache_creation_input_tokens as i64)
                .bind(entry.counters.cache_read_input_tokens as i64)
                .bind(entry.counters.output_tokens as i64)
                .bind(&entry.request_id)
                .bind(&entry.model)
                .bind(&entry.stop_reason)
                .bind(&entry.endpoint)
                .bind(&entry.feature)
                .bind(entry.occur_time)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}
