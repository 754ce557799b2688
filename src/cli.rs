use clap::{Parser, Subcommand};

/// Tokenledger — token-usage telemetry pipeline
#[derive(Parser)]
#[command(name = "tokenledger", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the aggregation scheduler and statistics expiry
    Work,

    /// One-shot incremental aggregation over an explicit window
    Aggregate {
        /// Window start (RFC 3339 timestamp or YYYY-MM-DD)
        #[arg(long)]
        from: String,
        /// Window end, exclusive
        #[arg(long)]
        to: String,
    },

    /// Rebuild statistics for one dimension over a range (idempotent repair)
    Rebuild {
        /// access_key or user
        #[arg(long)]
        dimension: String,
        #[arg(long)]
        id: String,
        /// Range start (RFC 3339 timestamp or YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Range end, exclusive
        #[arg(long)]
        end: String,
    },

    /// Delete statistics buckets that ended before the cutoff
    Cleanup {
        /// Cutoff (RFC 3339 timestamp or YYYY-MM-DD)
        #[arg(long)]
        before: String,
    },
}
