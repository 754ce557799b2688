//! Read surfaces over the recorded usage data: the per-dimension query
//! service consumed by dashboards and the admin service consumed by
//! reporting/export tooling. Thin facades — the SQL lives in the store.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::stats::{
    Dimension, DimensionTotalsRow, Period, TopConsumerRow, UsageLogRow, UsageStatisticsRow,
};
use crate::store::PgStore;

/// Window + granularity selector shared by the statistics queries.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsFilter {
    pub period: Period,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One point of a trend series, derived from a statistics bucket.
#[derive(Debug, Serialize)]
pub struct TrendPoint {
    pub bucket: DateTime<Utc>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub avg_tokens_per_request: f64,
}

impl From<&UsageStatisticsRow> for TrendPoint {
    fn from(row: &UsageStatisticsRow) -> Self {
        Self {
            bucket: row.period_start,
            total_requests: row.total_requests,
            total_tokens: row.total_tokens(),
            avg_tokens_per_request: row.avg_tokens_per_request(),
        }
    }
}

/// System-wide totals for one dimension over a window.
#[derive(Debug, Serialize)]
pub struct DimensionOverview {
    pub dimension: Dimension,
    pub total_requests: i64,
    pub input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub active_dimensions: i64,
    pub avg_tokens_per_request: f64,
}

impl DimensionOverview {
    fn from_totals(dimension: Dimension, totals: DimensionTotalsRow) -> Self {
        let total_tokens = totals.input_tokens
            + totals.cache_creation_input_tokens
            + totals.cache_read_input_tokens
            + totals.output_tokens;
        let avg = if totals.total_requests == 0 {
            0.0
        } else {
            total_tokens as f64 / totals.total_requests as f64
        };
        Self {
            dimension,
            total_requests: totals.total_requests,
            input_tokens: totals.input_tokens,
            cache_creation_input_tokens: totals.cache_creation_input_tokens,
            cache_read_input_tokens: totals.cache_read_input_tokens,
            output_tokens: totals.output_tokens,
            total_tokens,
            active_dimensions: totals.active_dimensions,
            avg_tokens_per_request: avg,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SystemOverview {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub access_keys: DimensionOverview,
    pub users: DimensionOverview,
}

/// Drift between the raw log and the day-granularity aggregates for one
/// dimension. Non-zero drift means a window has not been folded yet (or a
/// rebuild is due).
#[derive(Debug, Serialize)]
pub struct DimensionHealth {
    pub dimension: Dimension,
    pub raw_log_rows: i64,
    pub aggregated_requests: i64,
}

impl DimensionHealth {
    pub fn drift(&self) -> i64 {
        self.raw_log_rows - self.aggregated_requests
    }
}

const MAX_PAGE_SIZE: i64 = 1000;

/// Per-dimension statistics reads for dashboards.
#[derive(Clone)]
pub struct UsageQueryService {
    store: PgStore,
}

impl UsageQueryService {
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    pub async fn statistics(
        &self,
        dimension: Dimension,
        dimension_id: &str,
        filter: StatisticsFilter,
    ) -> anyhow::Result<Vec<UsageStatisticsRow>> {
        self.store
            .get_statistics(dimension, dimension_id, filter.period, filter.start, filter.end)
            .await
    }

    /// Paginated detail listing, newest first.
    pub async fn list_usage(
        &self,
        dimension: Dimension,
        dimension_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<UsageLogRow>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.store
            .list_usage_log(dimension, dimension_id, start, end, limit, offset.max(0))
            .await
    }

    pub async fn trend(
        &self,
        dimension: Dimension,
        dimension_id: &str,
        filter: StatisticsFilter,
    ) -> anyhow::Result<Vec<TrendPoint>> {
        let rows = self.statistics(dimension, dimension_id, filter).await?;
        Ok(rows.iter().map(TrendPoint::from).collect())
    }

    pub async fn top_access_keys(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TopConsumerRow>> {
        self.store
            .top_dimensions(Dimension::AccessKey, start, end, limit.clamp(1, MAX_PAGE_SIZE))
            .await
    }

    pub async fn top_users(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> anyhow::Result<Vec<TopConsumerRow>> {
        self.store
            .top_dimensions(Dimension::User, start, end, limit.clamp(1, MAX_PAGE_SIZE))
            .await
    }
}

/// Administrative reads: overview, bulk export, data health.
#[derive(Clone)]
pub struct UsageAdminService {
    store: PgStore,
}

impl UsageAdminService {
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    pub async fn system_overview(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<SystemOverview> {
        let access_keys = self
            .store
            .dimension_totals(Dimension::AccessKey, start, end)
            .await?;
        let users = self.store.dimension_totals(Dimension::User, start, end).await?;
        Ok(SystemOverview {
            window_start: start,
            window_end: end,
            access_keys: DimensionOverview::from_totals(Dimension::AccessKey, access_keys),
            users: DimensionOverview::from_totals(Dimension::User, users),
        })
    }

    pub async fn export_statistics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageStatisticsRow>> {
        self.store.export_statistics(start, end).await
    }

    pub async fn data_health(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DimensionHealth>> {
        let mut health = Vec::with_capacity(2);
        for dimension in [Dimension::AccessKey, Dimension::User] {
            let raw_log_rows = self.store.count_log_rows(dimension, start, end).await?;
            let aggregated_requests = self
                .store
                .sum_aggregated_requests(dimension, start, end)
                .await?;
            health.push(DimensionHealth {
                dimension,
                raw_log_rows,
                aggregated_requests,
            });
        }
        Ok(health)
    }
}
