//! Historical block indexer for CometBFT chains.
//!
//! Walks the chain from a start height to its tip through the node's
//! JSON-RPC interface, persists blocks, transactions and events into SQLite
//! and keeps following the tip once caught up.
pub mod chain;
pub mod cli;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod provider;
pub mod server;
pub mod store;
