//! Cache-first data access for tenant-scoped collections.
//!
//! This module provides:
//! - the [`Entity`] trait every cached record implements
//! - [`CacheSync`], the per-table controller that prefers the local store,
//!   refreshes from the remote on demand and merges results back
//! - snapshot/recency types views subscribe to

mod layer;
mod recency;
mod traits;

pub use layer::{CacheSync, SyncSnapshot};
pub use recency::format_time_ago;
pub use traits::{CacheSource, Entity, EntityId, IndexField, IndexValues, LoadOutcome, SyncNotice};
