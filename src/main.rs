use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenledger::cli::{Cli, Commands};
use tokenledger::models::stats::Dimension;
use tokenledger::store::PgStore;
use tokenledger::{aggregate, config, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tokenledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = Cli::parse();

    let store = PgStore::connect(&cfg.database_url).await?;
    store.migrate().await?;

    match args.command.unwrap_or(Commands::Work) {
        Commands::Work => {
            jobs::aggregation::spawn(store.pool().clone(), cfg.aggregation_interval_secs);
            jobs::expiry::spawn(store.pool().clone(), cfg.stats_retention_days);
            tracing::info!(
                interval_secs = cfg.aggregation_interval_secs,
                retention_days = cfg.stats_retention_days,
                "tokenledger worker started"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
        }
        Commands::Aggregate { from, to } => {
            let outcome = aggregate::perform_incremental_aggregation(
                store.pool(),
                parse_time(&from)?,
                parse_time(&to)?,
            )
            .await;
            if outcome.errors.is_empty() {
                println!(
                    "processed {} log rows, {} statistics rows updated",
                    outcome.processed_count, outcome.updated_stat_rows
                );
            } else {
                anyhow::bail!("aggregation failed: {}", outcome.errors.join("; "));
            }
        }
        Commands::Rebuild {
            dimension,
            id,
            start,
            end,
        } => {
            let dimension = Dimension::parse(&dimension)
                .with_context(|| format!("unknown dimension '{dimension}' (expected access_key or user)"))?;
            let rows = aggregate::rebuild_aggregate_data(
                store.pool(),
                dimension,
                &id,
                parse_time(&start)?,
                parse_time(&end)?,
            )
            .await?;
            println!("{rows} statistics rows rebuilt");
        }
        Commands::Cleanup { before } => {
            let deleted =
                aggregate::cleanup_expired_data(store.pool(), parse_time(&before)?).await?;
            println!("{deleted} statistics rows deleted");
        }
    }

    Ok(())
}

/// Accepts an RFC 3339 timestamp or a bare date (midnight UTC).
fn parse_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date: NaiveDate = s
        .parse()
        .with_context(|| format!("'{s}' is neither an RFC 3339 timestamp nor YYYY-MM-DD"))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc())
}
