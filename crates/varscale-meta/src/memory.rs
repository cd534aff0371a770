use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{KeyValue, KvBackend, StoreResult, WatchEvent, WatchStream};

/// Process-local backend for tests and single-binary runs.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> WatchEvent {
        let revision = self.bump();
        self.kv.insert(key.to_string(), (value.clone(), revision));
        WatchEvent {
            key: key.to_string(),
            value: Some(value),
            revision,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| KeyValue {
            key: key.to_string(),
            value: v.clone(),
            revision: *rev,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        let event = self.inner.write().await.write(key, value);
        let rev = event.revision;
        self.emit(event);
        Ok(rev)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            if inner.kv.remove(key).is_none() {
                return Ok(inner.revision);
            }
            let rev = inner.bump();
            (
                rev,
                WatchEvent {
                    key: key.to_string(),
                    value: None,
                    revision: rev,
                },
            )
        };
        self.emit(event);
        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KeyValue {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<Result<u64, u64>> {
        let event = {
            let mut inner = self.inner.write().await;
            let current = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if current != expected_revision {
                return Ok(Err(current));
            }
            inner.write(key, value)
        };
        let rev = event.revision;
        self.emit(event);
        Ok(Ok(rev))
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |msg| match msg {
            Ok(ev) if ev.key.starts_with(&prefix) => Some(ev),
            Ok(_) => None,
            // Lagged receivers skip ahead; the reconcile loop re-reads state anyway.
            Err(_) => None,
        });
        Ok(Box::pin(stream))
    }
}
