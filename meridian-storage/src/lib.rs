//! # Meridian Storage
//!
//! Root-scoped key-value storage used by the rest of the metadata service to
//! persist cluster and table metadata.
//!
//! ## Implementations
//!
//! - [`CoordKvStorage`] - backed by any coordination store [`KvClient`](meridian_core::KvClient)
//! - [`MemKvStorage`] - kept in memory, for callers without a store
//!
//! ## Example
//!
//! ```rust
//! use meridian_storage::{KvStorage, MemKvStorage};
//!
//! # tokio_test::block_on(async {
//! let storage = MemKvStorage::new("/meta");
//! storage.save("cluster/1", "defaultCluster").await.unwrap();
//! assert_eq!(storage.load("cluster/1").await.unwrap(), "defaultCluster");
//! assert_eq!(storage.load("cluster/2").await.unwrap(), "");
//! # });
//! ```

pub mod coord;
pub mod in_memory;

pub use coord::{CoordKvStorage, StorageConfig, DEFAULT_REQUEST_TIMEOUT};
pub use in_memory::MemKvStorage;

use async_trait::async_trait;
use meridian_core::MetaResult;

/// Separator between the root path and a key.
pub(crate) const DELIMITER: &str = "/";

/// Basic key-value access scoped under a root path.
///
/// Keys passed in and returned are relative to the root path. Values are
/// UTF-8 text; a stored value that is not fails to load.
#[async_trait]
pub trait KvStorage: Send + Sync {
    /// Loads the value of `key`, or an empty string when it is absent.
    async fn load(&self, key: &str) -> MetaResult<String>;

    /// Loads up to `limit` pairs in `[key, end_key)`, ordered by key.
    async fn load_range(
        &self,
        key: &str,
        end_key: &str,
        limit: usize,
    ) -> MetaResult<(Vec<String>, Vec<String>)>;

    /// Stores `value` under `key`.
    async fn save(&self, key: &str, value: &str) -> MetaResult<()>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> MetaResult<()>;
}

pub(crate) fn join_key(root_path: &str, key: &str) -> String {
    [root_path, key].join(DELIMITER)
}

pub(crate) fn strip_root<'a>(root_path: &str, full_key: &'a str) -> &'a str {
    let relative = full_key.strip_prefix(root_path).unwrap_or(full_key);
    relative.strip_prefix(DELIMITER).unwrap_or(relative)
}
