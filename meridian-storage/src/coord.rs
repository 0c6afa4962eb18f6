use crate::{join_key, strip_root, KvStorage};
use async_trait::async_trait;
use bytes::Bytes;
use meridian_core::store::{GetOptions, KvClient};
use meridian_core::{MetaError, MetaResult, StoreError, StoreResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Timeout applied to every storage request unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`CoordKvStorage`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Prefix every key is stored under
    pub root_path: String,
    /// Upper bound for a single store request
    pub request_timeout: Duration,
}

impl StorageConfig {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Key-value storage on top of a coordination store.
///
/// Every call is bounded by the configured request timeout and store
/// failures are wrapped into the matching `Kv*Failed` kind together with
/// the full key.
#[derive(Clone)]
pub struct CoordKvStorage {
    client: Arc<dyn KvClient>,
    config: StorageConfig,
}

impl CoordKvStorage {
    pub fn new(client: Arc<dyn KvClient>, config: StorageConfig) -> Self {
        Self { client, config }
    }

    pub fn root_path(&self) -> &str {
        &self.config.root_path
    }

    fn decode_value(key: &str, value: &[u8]) -> MetaResult<String> {
        std::str::from_utf8(value)
            .map(str::to_owned)
            .map_err(|e| MetaError::KvValueInvalid {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn bounded<T, F>(&self, operation: &str, request: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::deadline_exceeded(operation)),
        }
    }
}

#[async_trait]
impl KvStorage for CoordKvStorage {
    async fn load(&self, key: &str) -> MetaResult<String> {
        let key = join_key(&self.config.root_path, key);

        let response = self
            .bounded("load", self.client.get(&key, GetOptions::new()))
            .await
            .map_err(|source| MetaError::KvGetFailed {
                key: key.clone(),
                source,
            })?;

        match response.kvs.as_slice() {
            [] => Ok(String::new()),
            [kv] => Self::decode_value(&kv.key, &kv.value),
            kvs => Err(MetaError::KvGetResponse {
                key,
                count: kvs.len(),
            }),
        }
    }

    async fn load_range(
        &self,
        key: &str,
        end_key: &str,
        limit: usize,
    ) -> MetaResult<(Vec<String>, Vec<String>)> {
        let key = join_key(&self.config.root_path, key);
        let end_key = join_key(&self.config.root_path, end_key);

        let options = GetOptions::new().with_range(end_key).with_limit(limit);
        let response = self
            .bounded("load range", self.client.get(&key, options))
            .await
            .map_err(|source| MetaError::KvGetFailed {
                key: key.clone(),
                source,
            })?;

        let mut keys = Vec::with_capacity(response.kvs.len());
        let mut values = Vec::with_capacity(response.kvs.len());
        for kv in &response.kvs {
            keys.push(strip_root(&self.config.root_path, &kv.key).to_string());
            values.push(Self::decode_value(&kv.key, &kv.value)?);
        }
        Ok((keys, values))
    }

    async fn save(&self, key: &str, value: &str) -> MetaResult<()> {
        let key = join_key(&self.config.root_path, key);

        let value = Bytes::copy_from_slice(value.as_bytes());
        if let Err(source) = self.bounded("save", self.client.put(&key, value, None)).await {
            let e = MetaError::KvPutFailed { key, source };
            error!("Save to store failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> MetaResult<()> {
        let key = join_key(&self.config.root_path, key);

        if let Err(source) = self.bounded("remove", self.client.delete(&key)).await {
            let e = MetaError::KvDeleteFailed { key, source };
            error!("Remove from store failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
