//! Generates the `Store` gRPC service stubs.
//!
//! Messages are hand-written prost types in `src/messages.rs`, so no
//! `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::messages::{input}"))
        .output_type(format!("crate::messages::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("Store")
        .package("stratgrid.store")
        .method(unary("put", "Put", "PutRequest", "PutResponse"))
        .method(unary("get", "Get", "GetRequest", "GetResponse"))
        .method(unary("delete", "Delete", "DeleteRequest", "DeleteResponse"))
        .method(unary("range", "Range", "RangeRequest", "RangeResponse"))
        .method(
            Method::builder()
                .name("watch")
                .route_name("Watch")
                .input_type("crate::messages::WatchRequest")
                .output_type("crate::messages::WatchResponse")
                .codec_path("tonic::codec::ProstCodec")
                .server_streaming()
                .build(),
        )
        .method(unary("lease_grant", "LeaseGrant", "LeaseGrantRequest", "LeaseGrantResponse"))
        .method(unary("lease_keep_alive", "LeaseKeepAlive", "LeaseRequest", "LeaseResponse"))
        .method(unary("lease_revoke", "LeaseRevoke", "LeaseRequest", "LeaseResponse"))
        .build();

    Builder::new().compile(&[service]);
}
