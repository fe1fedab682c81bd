//! KVDB client.
//!
//! A string-keyed, string-valued store reachable from every game. Requests are
//! queued to a single worker task, so operations issued by one game execute in
//! issue order. Every request resolves exactly once, with its value or an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{WorldError, WorldResult};

/// Durable KV storage collaborator.
#[async_trait]
pub trait KvdbBackend: Send + Sync {
    async fn get(&self, key: &str) -> WorldResult<Option<String>>;

    async fn put(&self, key: &str, val: &str) -> WorldResult<()>;

    /// Pairs with `begin <= key < end`, in key order.
    async fn get_range(&self, begin: &str, end: &str) -> WorldResult<Vec<(String, String)>>;
}

/// In-memory KVDB backend.
#[derive(Default)]
pub struct MemoryKvdb {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvdb {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> WorldError {
    WorldError::Storage("kvdb lock poisoned".into())
}

#[async_trait]
impl KvdbBackend for MemoryKvdb {
    async fn get(&self, key: &str) -> WorldResult<Option<String>> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, val: &str) -> WorldResult<()> {
        let mut data = self.data.write().map_err(|_| poisoned())?;
        data.insert(key.to_string(), val.to_string());
        Ok(())
    }

    async fn get_range(&self, begin: &str, end: &str) -> WorldResult<Vec<(String, String)>> {
        if begin >= end {
            return Ok(Vec::new());
        }
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data
            .range(begin.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

enum Request {
    Get {
        key: String,
        reply: oneshot::Sender<WorldResult<Option<String>>>,
    },
    Put {
        key: String,
        val: String,
        reply: oneshot::Sender<WorldResult<()>>,
    },
    GetOrPut {
        key: String,
        default: String,
        reply: oneshot::Sender<WorldResult<String>>,
    },
    GetRange {
        begin: String,
        end: String,
        reply: oneshot::Sender<WorldResult<Vec<(String, String)>>>,
    },
}

/// Handle to the KVDB worker. Cheap to clone.
#[derive(Clone)]
pub struct KvdbClient {
    tx: mpsc::UnboundedSender<Request>,
}

fn worker_gone() -> WorldError {
    WorldError::Storage("kvdb worker stopped".into())
}

impl KvdbClient {
    /// Spawns the worker on the current tokio runtime.
    pub fn start(backend: Arc<dyn KvdbBackend>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(backend, timeout, rx));
        Self { tx }
    }

    fn submit(&self, req: Request) -> WorldResult<()> {
        self.tx.send(req).map_err(|_| worker_gone())
    }

    /// Queues a get. The request is enqueued before this returns.
    pub fn get(&self, key: &str) -> impl Future<Output = WorldResult<Option<String>>> + Send {
        let (reply, rx) = oneshot::channel();
        let sent = self.submit(Request::Get {
            key: key.to_string(),
            reply,
        });
        async move {
            sent?;
            rx.await.map_err(|_| worker_gone())?
        }
    }

    pub fn put(&self, key: &str, val: &str) -> impl Future<Output = WorldResult<()>> + Send {
        let (reply, rx) = oneshot::channel();
        let sent = self.submit(Request::Put {
            key: key.to_string(),
            val: val.to_string(),
            reply,
        });
        async move {
            sent?;
            rx.await.map_err(|_| worker_gone())?
        }
    }

    /// Returns the stored value, or writes and returns `default` when the key
    /// is absent or empty.
    ///
    /// Not a compare-and-swap: two games racing on the same absent key can both
    /// see their own default, and the store keeps whichever write lands last.
    pub fn get_or_put(
        &self,
        key: &str,
        default: &str,
    ) -> impl Future<Output = WorldResult<String>> + Send {
        let (reply, rx) = oneshot::channel();
        let sent = self.submit(Request::GetOrPut {
            key: key.to_string(),
            default: default.to_string(),
            reply,
        });
        async move {
            sent?;
            rx.await.map_err(|_| worker_gone())?
        }
    }

    pub fn get_range(
        &self,
        begin: &str,
        end: &str,
    ) -> impl Future<Output = WorldResult<Vec<(String, String)>>> + Send {
        let (reply, rx) = oneshot::channel();
        let sent = self.submit(Request::GetRange {
            begin: begin.to_string(),
            end: end.to_string(),
            reply,
        });
        async move {
            sent?;
            rx.await.map_err(|_| worker_gone())?
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = WorldResult<T>>,
) -> WorldResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| WorldError::Timeout(format!("kvdb {what}")))?
}

async fn run_worker(
    backend: Arc<dyn KvdbBackend>,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(req) = rx.recv().await {
        // A dropped receiver just means the caller stopped caring.
        let delivered = match req {
            Request::Get { key, reply } => {
                let res = bounded(timeout, "get", backend.get(&key)).await;
                reply.send(res).is_ok()
            }
            Request::Put { key, val, reply } => {
                let res = bounded(timeout, "put", backend.put(&key, &val)).await;
                reply.send(res).is_ok()
            }
            Request::GetOrPut {
                key,
                default,
                reply,
            } => {
                let res = bounded(timeout, "get_or_put", async {
                    match backend.get(&key).await? {
                        Some(existing) if !existing.is_empty() => Ok(existing),
                        _ => {
                            backend.put(&key, &default).await?;
                            Ok(default)
                        }
                    }
                })
                .await;
                reply.send(res).is_ok()
            }
            Request::GetRange { begin, end, reply } => {
                let res = bounded(timeout, "get_range", backend.get_range(&begin, &end)).await;
                reply.send(res).is_ok()
            }
        };
        if !delivered {
            warn!("kvdb reply dropped by caller");
        }
    }
    debug!("kvdb worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KvdbClient {
        KvdbClient::start(Arc::new(MemoryKvdb::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn get_or_put_keeps_first_value() -> anyhow::Result<()> {
        let kv = client();
        assert_eq!(kv.get_or_put("k", "v1").await?, "v1");
        assert_eq!(kv.get_or_put("k", "v2").await?, "v1");
        assert_eq!(kv.get("k").await?, Some("v1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn empty_value_counts_as_absent() -> anyhow::Result<()> {
        let kv = client();
        kv.put("k", "").await?;
        assert_eq!(kv.get_or_put("k", "fresh").await?, "fresh");
        Ok(())
    }

    #[tokio::test]
    async fn requests_run_in_issue_order() -> anyhow::Result<()> {
        let kv = client();
        let put = kv.put("k", "a");
        let get = kv.get("k");
        let put2 = kv.put("k", "b");
        // Awaited out of order, still executed in issue order.
        assert_eq!(get.await?, Some("a".to_string()));
        put2.await?;
        put.await?;
        assert_eq!(kv.get("k").await?, Some("b".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn range_is_half_open_and_sorted() -> anyhow::Result<()> {
        let kv = client();
        for k in ["b", "a", "c", "d"] {
            kv.put(k, k).await?;
        }
        let got = kv.get_range("a", "c").await?;
        assert_eq!(
            got,
            vec![("a".into(), "a".into()), ("b".into(), "b".into())]
        );
        Ok(())
    }
}
