//! Local-first data layer for the SmartCart shopping assistant.
//!
//! Components, bottom-up:
//!
//! - [`kv`]: durable key-value backends (SQLite, memory)
//! - [`store`]: validated storage of the state slices
//! - [`migration`]: schema versioning, run once before any slice is read
//! - [`cache`]: two-tier TTL cache, independent of domain state
//! - [`sync`]: persisted outbox drained to a remote while online
//! - [`backup`]: checksummed backup files of the slices
//! - [`context`]: [`DataLayer`], which starts and stops all of the above
//!
//! No failure inside the layer blocks startup. Corrupted slices are dropped,
//! failed migrations reset local data, and failed syncs leave changes queued.

pub mod backup;
pub mod cache;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod kv;
pub mod migration;
pub mod store;
pub mod sync;

pub use context::{DataLayer, DataLayerOptions};
