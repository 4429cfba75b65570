//! Caifu market-state indexer library
//!
//! Derives authoritative off-chain state for two-outcome constant-product
//! prediction markets from EVM event logs: pool reserves, execution prices,
//! 5-minute candles, rolling volume, and an append-only trade feed, served
//! over HTTP and server-sent events.

pub mod amm;
pub mod api;
pub mod bus;
pub mod chain;
pub mod config;
pub mod database;
pub mod error;
pub mod indexer;
pub mod live;
pub mod models;
pub mod queue;
pub mod recon;
pub mod summary;

// Re-export commonly used types
pub use config::IndexerConfig;
pub use database::Store;
pub use error::{IndexerError, IndexerResult};
