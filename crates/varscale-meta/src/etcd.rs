use std::sync::Arc;

use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{KeyValue, KvBackend, StoreError, StoreResult, WatchEvent, WatchStream};

#[derive(Clone)]
pub struct EtcdBackend {
    client: Arc<Mutex<Client>>,
}

impl EtcdBackend {
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let c = Client::connect(endpoints, None).await.map_err(unavailable)?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }
}

fn unavailable(e: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> u64 {
    header.map(|h| h.revision()).unwrap_or_default().max(0) as u64
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).to_string(),
        value: kv.value().to_vec(),
        revision: kv.mod_revision().max(0) as u64,
    }
}

#[async_trait::async_trait]
impl KvBackend for EtcdBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await.map_err(unavailable)?;
        Ok(resp.kvs().first().map(to_key_value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.put(key, value, None).await.map_err(unavailable)?;
        Ok(header_revision(resp.header()))
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await.map_err(unavailable)?;
        Ok(header_revision(resp.header()))
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        Ok(resp.kvs().iter().map(to_key_value).collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<Result<u64, u64>> {
        let mut cli = self.client.lock().await;

        // mod_revision 0 matches a missing key.
        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, None)])
            .or_else([TxnOp::get(key, None)]);
        let resp = cli.txn(txn).await.map_err(unavailable)?;

        if resp.succeeded() {
            return Ok(Ok(header_revision(resp.header())));
        }

        let current = cli.get(key, None).await.map_err(unavailable)?;
        let actual = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision().max(0) as u64)
            .unwrap_or(0);
        Ok(Err(actual))
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut cli = self.client.lock().await;
        let (watcher, mut stream) = cli
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(1024);
        tokio::spawn(async move {
            // Dropping the watcher cancels the etcd watch.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(r)) => r,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "etcd watch stream failed");
                        return;
                    }
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = WatchEvent {
                        key: String::from_utf8_lossy(kv.key()).to_string(),
                        value,
                        revision: kv.mod_revision().max(0) as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
