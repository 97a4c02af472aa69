//! Store gRPC server.
//!
//! Wraps a [`SharedStore`] and implements the generated `Store` service.
//! Each RPC forwards to the store; store errors become gRPC statuses the
//! client maps back.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use stratgrid_store::{SharedStore, StoreError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::messages::*;
use crate::proto::store_server::{Store, StoreServer};

/// gRPC implementation of the store service.
pub struct StoreService {
    store: SharedStore,
}

impl StoreService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> StoreServer<Self> {
        StoreServer::new(self)
    }
}

/// Serve `store` on `addr` until `shutdown` resolves.
pub async fn serve<F>(store: SharedStore, addr: SocketAddr, shutdown: F) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()>,
{
    info!(%addr, "store gRPC server listening");
    Server::builder()
        .add_service(StoreService::new(store).into_service())
        .serve_with_shutdown(addr, shutdown)
        .await
}

pub(crate) fn status_of(e: StoreError) -> Status {
    match e {
        StoreError::LeaseNotFound(id) => Status::not_found(format!("lease {id}")),
        StoreError::WatchLagged(_) => Status::data_loss(e.to_string()),
        StoreError::Timeout => Status::deadline_exceeded(e.to_string()),
        StoreError::Unavailable(_) => Status::unavailable(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl Store for StoreService {
    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        let response = if req.only_if_absent {
            let written = self
                .store
                .create(&req.key, req.value, req.lease)
                .await
                .map_err(status_of)?;
            PutResponse { revision: 0, written }
        } else {
            let revision = self
                .store
                .put(&req.key, req.value, req.lease)
                .await
                .map_err(status_of)?;
            PutResponse { revision, written: true }
        };
        Ok(Response::new(response))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let kv = self
            .store
            .get(&request.into_inner().key)
            .await
            .map_err(status_of)?;
        Ok(Response::new(GetResponse { kv: kv.map(Into::into) }))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<DeleteResponse>, Status> {
        let deleted = self
            .store
            .delete(&request.into_inner().key)
            .await
            .map_err(status_of)?;
        Ok(Response::new(DeleteResponse { deleted }))
    }

    async fn range(&self, request: Request<RangeRequest>) -> Result<Response<RangeResponse>, Status> {
        let result = self
            .store
            .range(&request.into_inner().prefix)
            .await
            .map_err(status_of)?;
        Ok(Response::new(RangeResponse {
            revision: result.revision,
            kvs: result.kvs.into_iter().map(Into::into).collect(),
        }))
    }

    type WatchStream = EventStream;

    async fn watch(&self, request: Request<WatchRequest>) -> Result<Response<Self::WatchStream>, Status> {
        let prefix = request.into_inner().prefix;
        let feed = self.store.watch(&prefix).await.map_err(status_of)?;
        debug!(%prefix, "watch opened");

        let stream = ReceiverStream::new(feed).map(|item| item.map(WatchResponse::from).map_err(status_of));
        Ok(Response::new(Box::pin(stream) as Self::WatchStream))
    }

    async fn lease_grant(
        &self,
        request: Request<LeaseGrantRequest>,
    ) -> Result<Response<LeaseGrantResponse>, Status> {
        let ttl = Duration::from_millis(request.into_inner().ttl_ms);
        if ttl.is_zero() {
            return Err(Status::invalid_argument("lease ttl must be positive"));
        }
        let lease = self.store.grant_lease(ttl).await.map_err(status_of)?;
        Ok(Response::new(LeaseGrantResponse { lease }))
    }

    async fn lease_keep_alive(&self, request: Request<LeaseRequest>) -> Result<Response<LeaseResponse>, Status> {
        self.store
            .keep_alive(request.into_inner().lease)
            .await
            .map_err(status_of)?;
        Ok(Response::new(LeaseResponse {}))
    }

    async fn lease_revoke(&self, request: Request<LeaseRequest>) -> Result<Response<LeaseResponse>, Status> {
        self.store
            .revoke_lease(request.into_inner().lease)
            .await
            .map_err(status_of)?;
        Ok(Response::new(LeaseResponse {}))
    }
}
