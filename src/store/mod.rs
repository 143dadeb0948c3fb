//! Local persistent store.
//!
//! A single SQLite database owns everything that must survive a restart:
//! - versioned cache partitions and the responses cached in them
//! - the outbound mutation queue
//! - per-clinic scope rows (last sync, record counts)
//! - pending sync-tag registrations and small lifecycle metadata
//!
//! Nothing else in the crate keeps state across requests; every decision is
//! re-derived from here.

mod entries;
mod key;
mod mutations;
mod scopes;
mod storage;
mod types;

pub use key::CacheKey;
pub use storage::SqliteStore;
pub use types::{
  ClinicCacheScope, MutationStatus, NewMutation, OutboundMutation, Partition, StorageStats,
};
