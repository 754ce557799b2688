use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Bounded capacity of each usage lane (attributed / anonymous).
    /// Set via TOKENLEDGER_QUEUE_CAPACITY. Default: 4096.
    pub queue_capacity: usize,
    /// Number of ingestion consumers. Set via TOKENLEDGER_INGEST_WORKERS.
    /// Default: 4.
    pub ingest_workers: usize,
    /// Seconds between scheduled aggregation windows.
    /// Set via TOKENLEDGER_AGGREGATION_INTERVAL_SECS. Default: 300.
    pub aggregation_interval_secs: u64,
    /// Days to keep statistics buckets before expiry.
    /// Set via TOKENLEDGER_STATS_RETENTION_DAYS. Default: 400.
    pub stats_retention_days: i64,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    Ok(Config {
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/tokenledger".into()),
        queue_capacity: std::env::var("TOKENLEDGER_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096),
        ingest_workers: std::env::var("TOKENLEDGER_INGEST_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4),
        aggregation_interval_secs: std::env::var("TOKENLEDGER_AGGREGATION_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
        stats_retention_days: std::env::var("TOKENLEDGER_STATS_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(400),
    })
}
