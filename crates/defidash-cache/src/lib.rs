//! `defidash-cache`: SQLite-backed key/value cache with TTL.
//!
//! Entries live in the shared `cache` table so every process sees the same
//! values. A read only returns rows whose `expires` is still in the future;
//! expired rows stay on disk until the `cleanup` job calls
//! [`Cache::purge_expired`].
//!
//! [`Cache::get_or_set_with`] computes and stores a value on a miss. It does
//! not coordinate concurrent cold callers: if several callers miss the same
//! key at once, each runs its fallback and the last write wins.

pub mod cache;
pub mod db;
pub mod error;

pub use cache::Cache;
pub use error::{CacheError, Result};
