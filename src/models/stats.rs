use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usage::UsageCounters;

/// The axis statistics are grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    AccessKey,
    User,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::AccessKey => "access_key",
            Dimension::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "access_key" => Some(Dimension::AccessKey),
            "user" => Some(Dimension::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statistics bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hour,
    Day,
    Month,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Hour, Period::Day, Period::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Period::Hour),
            "day" => Some(Period::Day),
            "month" => Some(Period::Month),
            _ => None,
        }
    }

    /// The bucket `[start, end)` containing `at`.
    pub fn bounds(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            Period::Hour => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0)
                    .unwrap();
                (start, start + chrono::Duration::hours(1))
            }
            Period::Day => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
                    .unwrap();
                (start, start + chrono::Duration::days(1))
            }
            Period::Month => {
                let start = Utc
                    .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
                    .unwrap();
                let next = if at.month() == 12 {
                    NaiveDate::from_ymd_opt(at.year() + 1, 1, 1).unwrap()
                } else {
                    NaiveDate::from_ymd_opt(at.year(), at.month() + 1, 1).unwrap()
                };
                (start, next.and_hms_opt(0, 0, 0).unwrap().and_utc())
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only usage occurrence, owned by a single dimension with the
/// other dimension carried as an optional cross-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub owner: Dimension,
    pub owner_id: String,
    pub cross_ref_id: Option<String>,
    pub event_id: String,
    pub counters: UsageCounters,
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub endpoint: Option<String>,
    pub feature: Option<String>,
    /// Business timestamp; always set (processing instant when the event
    /// carried none).
    pub occur_time: DateTime<Utc>,
}

/// A persisted usage log row, as read back for detail listings.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct UsageLogRow {
    pub id: Uuid,
    pub owner_id: String,
    pub cross_ref_id: Option<String>,
    pub event_id: String,
    pub input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub output_tokens: i64,
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub endpoint: Option<String>,
    pub feature: Option<String>,
    pub occur_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One rolled-up statistics bucket. At most one row exists per
/// (dimension_type, dimension_id, period_type, period_start).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct UsageStatisticsRow {
    pub dimension_type: String,
    pub dimension_id: String,
    pub period_type: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub output_tokens: i64,
    pub total_requests: i64,
    pub last_update_time: DateTime<Utc>,
}

/// One entry of a top-N consumers ranking, computed from the raw log.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TopConsumerRow {
    pub dimension_id: String,
    pub total_requests: i64,
    pub input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub first_usage_time: DateTime<Utc>,
    pub last_usage_time: DateTime<Utc>,
}

/// System-wide totals for one dimension's raw log over a window.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DimensionTotalsRow {
    pub total_requests: i64,
    pub input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub output_tokens: i64,
    pub active_dimensions: i64,
}

impl UsageStatisticsRow {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.output_tokens
    }

    pub fn avg_tokens_per_request(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_tokens() as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_hour_bounds() {
        let (start, end) = Period::Hour.bounds(at("2025-06-15T13:45:12Z"));
        assert_eq!(start, at("2025-06-15T13:00:00Z"));
        assert_eq!(end, at("2025-06-15T14:00:00Z"));
    }

    #[test]
    fn test_day_bounds() {
        let (start, end) = Period::Day.bounds(at("2025-06-15T13:45:12Z"));
        assert_eq!(start, at("2025-06-15T00:00:00Z"));
        assert_eq!(end, at("2025-06-16T00:00:00Z"));
    }

    #[test]
    fn test_month_bounds() {
        let (start, end) = Period::Month.bounds(at("2025-06-15T13:45:12Z"));
        assert_eq!(start, at("2025-06-01T00:00:00Z"));
        assert_eq!(end, at("2025-07-01T00:00:00Z"));
    }

    #[test]
    fn test_month_bounds_december_rollover() {
        let (start, end) = Period::Month.bounds(at("2025-12-31T23:59:59Z"));
        assert_eq!(start, at("2025-12-01T00:00:00Z"));
        assert_eq!(end, at("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_bucket_start_is_idempotent() {
        let t = at("2025-02-28T08:30:00Z");
        for period in Period::ALL {
            let (start, end) = period.bounds(t);
            let (again, _) = period.bounds(start);
            assert_eq!(start, again, "{period} bucket start must be a fixpoint");
            assert!(start <= t && t < end);
        }
    }

    #[test]
    fn test_dimension_round_trip() {
        for dim in [Dimension::AccessKey, Dimension::User] {
            assert_eq!(Dimension::parse(dim.as_str()), Some(dim));
        }
        assert_eq!(Dimension::parse("tenant"), None);
    }

    #[test]
    fn test_avg_tokens_per_request_zero_requests() {
        let row = UsageStatisticsRow {
            dimension_type: "access_key".into(),
            dimension_id: "ak_1".into(),
            period_type: "day".into(),
            period_start: at("2025-06-15T00:00:00Z"),
            period_end: at("2025-06-16T00:00:00Z"),
            input_tokens: 0,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            output_tokens: 0,
            total_requests: 0,
            last_update_time: at("2025-06-16T00:00:00Z"),
        };
        assert_eq!(row.avg_tokens_per_request(), 0.0);
    }

    #[test]
    fn test_avg_tokens_per_request() {
        let row = UsageStatisticsRow {
            dimension_type: "user".into(),
            dimension_id: "u_1".into(),
            period_type: "hour".into(),
            period_start: at("2025-06-15T13:00:00Z"),
            period_end: at("2025-06-15T14:00:00Z"),
            input_tokens: 60,
            cache_creation_input_tokens: 20,
            cache_read_input_tokens: 10,
            output_tokens: 30,
            total_requests: 3,
            last_update_time: at("2025-06-15T14:00:00Z"),
        };
        assert_eq!(row.total_tokens(), 120);
        assert_eq!(row.avg_tokens_per_request(), 40.0);
    }
}
