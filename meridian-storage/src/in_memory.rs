use crate::{join_key, strip_root, KvStorage};
use async_trait::async_trait;
use meridian_core::MetaResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Simple in-memory storage implementation.
///
/// Keys are scoped under a root path exactly like [`CoordKvStorage`](crate::CoordKvStorage),
/// so the two can be swapped without changing what callers observe. Nothing
/// survives the process.
#[derive(Debug, Clone)]
pub struct MemKvStorage {
    root_path: String,
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemKvStorage {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl KvStorage for MemKvStorage {
    async fn load(&self, key: &str) -> MetaResult<String> {
        let key = join_key(&self.root_path, key);
        Ok(self.data.read().get(&key).cloned().unwrap_or_default())
    }

    async fn load_range(
        &self,
        key: &str,
        end_key: &str,
        limit: usize,
    ) -> MetaResult<(Vec<String>, Vec<String>)> {
        let key = join_key(&self.root_path, key);
        let end_key = join_key(&self.root_path, end_key);
        if end_key <= key {
            return Ok((Vec::new(), Vec::new()));
        }

        let data = self.data.read();
        let range = data.range::<str, _>((Bound::Included(key.as_str()), Bound::Excluded(end_key.as_str())));
        let take = if limit == 0 { usize::MAX } else { limit };
        let (keys, values): (Vec<String>, Vec<String>) = range
            .take(take)
            .map(|(k, v)| (strip_root(&self.root_path, k).to_string(), v.clone()))
            .unzip();
        Ok((keys, values))
    }

    async fn save(&self, key: &str, value: &str) -> MetaResult<()> {
        let key = join_key(&self.root_path, key);
        self.data.write().insert(key, value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> MetaResult<()> {
        let key = join_key(&self.root_path, key);
        self.data.write().remove(&key);
        Ok(())
    }
}
