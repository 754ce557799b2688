//! Tokenledger — token-usage telemetry pipeline for LLM API traffic.
//!
//! The forwarding layer hands completed exchanges to the
//! [`collector::ResponseForwardListener`]; usage counters are extracted,
//! wrapped into content-addressed events, queued, and persisted as
//! per-dimension log rows by a pool of [`ingest`] consumers. The
//! [`aggregate`] module folds log rows into hour/day/month statistics
//! buckets and owns the rebuild and expiry paths.

pub mod aggregate;
pub mod cli;
pub mod collector;
pub mod config;
pub mod errors;
pub mod extract;
pub mod identity;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod query;
pub mod queue;
pub mod store;
