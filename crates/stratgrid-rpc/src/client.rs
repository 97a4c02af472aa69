//! RemoteStore: [`CoordinationStore`] over gRPC.
//!
//! Requests are spread over every configured endpoint through a balanced
//! tonic channel, so any reachable store replica can serve a call.

use std::time::Duration;

use async_trait::async_trait;
use stratgrid_store::{
    CoordinationStore, KeyValue, LeaseId, RangeResult, Revision, StoreError, StoreResult,
    WatchEvent, WatchStream,
};
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::messages::*;
use crate::proto::store_client::StoreClient;

/// Per-watcher queue between the gRPC stream and the consumer.
const FEED_BUFFER: usize = 256;

/// gRPC client for a remote coordination store.
#[derive(Clone)]
pub struct RemoteStore {
    client: StoreClient<Channel>,
}

impl RemoteStore {
    /// Build a client balanced over `endpoints` (`host:port`).
    ///
    /// Connections are established lazily; unreachable endpoints surface as
    /// [`StoreError::Unavailable`] on the first call.
    pub fn connect(endpoints: &[String], connect_timeout: Duration) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no store endpoints configured".into()));
        }

        let mut parsed = Vec::with_capacity(endpoints.len());
        for addr in endpoints {
            let uri = if addr.contains("://") {
                addr.clone()
            } else {
                format!("http://{addr}")
            };
            let endpoint = Endpoint::from_shared(uri.clone())
                .map_err(|e| StoreError::Unavailable(format!("invalid endpoint {uri}: {e}")))?
                .connect_timeout(connect_timeout)
                .tcp_nodelay(true);
            parsed.push(endpoint);
        }

        debug!(endpoints = ?endpoints, "remote store client created");
        let channel = Channel::balance_list(parsed.into_iter());
        Ok(Self {
            client: StoreClient::new(channel),
        })
    }

    async fn write(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>, only_if_absent: bool) -> StoreResult<PutResponse> {
        let response = self
            .client
            .clone()
            .put(PutRequest {
                key: key.to_string(),
                value,
                lease,
                only_if_absent,
            })
            .await
            .map_err(|s| store_error(s, lease))?;
        Ok(response.into_inner())
    }
}

/// Map a gRPC status back to the store error the server started from.
fn store_error(status: Status, lease: Option<LeaseId>) -> StoreError {
    match (status.code(), lease) {
        (Code::NotFound, Some(id)) => StoreError::LeaseNotFound(id),
        (Code::DataLoss, _) => StoreError::WatchLagged(0),
        (Code::DeadlineExceeded, _) => StoreError::Timeout,
        (code, _) => StoreError::Unavailable(format!("{code}: {}", status.message())),
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<Revision> {
        Ok(self.write(key, value, lease, false).await?.revision)
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<bool> {
        Ok(self.write(key, value, lease, true).await?.written)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let response = self
            .client
            .clone()
            .get(GetRequest { key: key.to_string() })
            .await
            .map_err(|s| store_error(s, None))?;
        Ok(response.into_inner().kv.map(Into::into))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let response = self
            .client
            .clone()
            .delete(DeleteRequest { key: key.to_string() })
            .await
            .map_err(|s| store_error(s, None))?;
        Ok(response.into_inner().deleted)
    }

    async fn range(&self, prefix: &str) -> StoreResult<RangeResult> {
        let response = self
            .client
            .clone()
            .range(RangeRequest {
                prefix: prefix.to_string(),
            })
            .await
            .map_err(|s| store_error(s, None))?
            .into_inner();
        Ok(RangeResult {
            revision: response.revision,
            kvs: response.kvs.into_iter().map(Into::into).collect(),
        })
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut stream = self
            .client
            .clone()
            .watch(WatchRequest {
                prefix: prefix.to_string(),
            })
            .await
            .map_err(|s| store_error(s, None))?
            .into_inner();

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => match message {
                        Ok(Some(msg)) => {
                            if tx.send(Ok(WatchEvent::from(msg))).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = tx
                                .send(Err(StoreError::Unavailable("watch stream ended".into())))
                                .await;
                            break;
                        }
                        Err(status) => {
                            warn!(%prefix, error = %status, "remote watch failed");
                            let _ = tx.send(Err(store_error(status, None))).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let response = self
            .client
            .clone()
            .lease_grant(LeaseGrantRequest {
                ttl_ms: ttl.as_millis() as u64,
            })
            .await
            .map_err(|s| store_error(s, None))?;
        Ok(response.into_inner().lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.client
            .clone()
            .lease_keep_alive(LeaseRequest { lease })
            .await
            .map_err(|s| store_error(s, Some(lease)))?;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.client
            .clone()
            .lease_revoke(LeaseRequest { lease })
            .await
            .map_err(|s| store_error(s, Some(lease)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use stratgrid_store::EmbeddedStore;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;

    use super::*;
    use crate::server::StoreService;

    struct Harness {
        remote: RemoteStore,
        local: EmbeddedStore,
        _shutdown: oneshot::Sender<()>,
    }

    async fn start() -> Harness {
        let local = EmbeddedStore::open_in_memory().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let service = StoreService::new(Arc::new(local.clone())).into_service();
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        let remote = RemoteStore::connect(&[addr.to_string()], Duration::from_secs(2)).unwrap();
        Harness {
            remote,
            local,
            _shutdown: tx,
        }
    }

    #[tokio::test]
    async fn kv_operations_round_trip() {
        let h = start().await;

        let rev = h.remote.put("desired-task/t", b"spec".to_vec(), None).await.unwrap();
        let kv = h.remote.get("desired-task/t").await.unwrap().unwrap();
        assert_eq!(kv.value, b"spec");
        assert_eq!(kv.mod_revision, rev);

        assert!(!h.remote.create("desired-task/t", b"x".to_vec(), None).await.unwrap());
        assert!(h.remote.create("desired-task/u", b"x".to_vec(), None).await.unwrap());

        let range = h.remote.range("desired-task/").await.unwrap();
        assert_eq!(range.kvs.len(), 2);
        assert_eq!(range.revision, h.local.revision());

        assert!(h.remote.delete("desired-task/t").await.unwrap());
        assert!(h.remote.get("desired-task/t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_streams_remote_events() {
        let h = start().await;
        let mut feed = h.remote.watch("placement/").await.unwrap();

        h.local.put("placement/t", b"n1".to_vec(), None).await.unwrap();
        h.local.delete("placement/t").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(first, WatchEvent::Put(ref kv) if kv.key == "placement/t"));

        let second = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(second, WatchEvent::Delete { ref key, .. } if key == "placement/t"));
    }

    #[tokio::test]
    async fn lease_errors_survive_the_wire() {
        let h = start().await;
        let lease = h.remote.grant_lease(Duration::from_secs(5)).await.unwrap();
        h.remote
            .put("worker-registration/grid/n1", b"{}".to_vec(), Some(lease))
            .await
            .unwrap();
        h.remote.keep_alive(lease).await.unwrap();

        h.remote.revoke_lease(lease).await.unwrap();
        assert!(h.local.get("worker-registration/grid/n1").await.unwrap().is_none());
        assert!(matches!(
            h.remote.keep_alive(lease).await,
            Err(StoreError::LeaseNotFound(id)) if id == lease
        ));
        assert!(matches!(
            h.remote.put("k", b"v".to_vec(), Some(lease)).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[test]
    fn connect_requires_endpoints() {
        assert!(matches!(
            RemoteStore::connect(&[], Duration::from_secs(1)),
            Err(StoreError::Unavailable(_))
        ));
    }
}
