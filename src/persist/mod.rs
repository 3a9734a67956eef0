//! Write-back cache persisted to a [`BackingStore`].
//!
//! Remote results are written here so a restarted client can serve them
//! before the first round trip completes.

mod cache;
mod store;

pub use cache::{PersistedCache, PersistedCacheOptions, VERSION_KEY};
pub use store::{BackingStore, MemoryStore};
