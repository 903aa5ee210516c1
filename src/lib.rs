//! Relayer delivering CosmWasm bridge packets to the TON bridge adapter.
//!
//! A poller per direction walks source blocks, the extractor turns bridge
//! events into packets, and the submission pipeline proves each packet
//! against the destination light client and broadcasts it.

pub mod api;
pub mod bounded_cache;
pub mod chain;
pub mod config;
pub mod confirmation;
pub mod db;
pub mod error;
pub mod metrics;
pub mod proof;
pub mod store;
pub mod types;
pub mod watchers;
pub mod writers;

pub use error::RelayError;
