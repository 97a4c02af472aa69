//! Wire messages for the `stratgrid.store.Store` service.

use stratgrid_store::{KeyValue, WatchEvent};

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValueMsg {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub mod_revision: u64,
    #[prost(uint64, optional, tag = "4")]
    pub lease: Option<u64>,
}

impl From<KeyValue> for KeyValueMsg {
    fn from(kv: KeyValue) -> Self {
        Self {
            key: kv.key,
            value: kv.value,
            mod_revision: kv.mod_revision,
            lease: kv.lease,
        }
    }
}

impl From<KeyValueMsg> for KeyValue {
    fn from(msg: KeyValueMsg) -> Self {
        Self {
            key: msg.key,
            value: msg.value,
            mod_revision: msg.mod_revision,
            lease: msg.lease,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutRequest {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(uint64, optional, tag = "3")]
    pub lease: Option<u64>,
    /// Create-if-absent instead of overwrite.
    #[prost(bool, tag = "4")]
    pub only_if_absent: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PutResponse {
    #[prost(uint64, tag = "1")]
    pub revision: u64,
    /// False when `only_if_absent` found the key already present.
    #[prost(bool, tag = "2")]
    pub written: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetResponse {
    #[prost(message, optional, tag = "1")]
    pub kv: Option<KeyValueMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteRequest {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteResponse {
    #[prost(bool, tag = "1")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeRequest {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeResponse {
    #[prost(uint64, tag = "1")]
    pub revision: u64,
    #[prost(message, repeated, tag = "2")]
    pub kvs: Vec<KeyValueMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchRequest {
    #[prost(string, tag = "1")]
    pub prefix: String,
}

/// One watch event. `kv` is set for puts; deletes carry only key and revision.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchResponse {
    #[prost(message, optional, tag = "1")]
    pub kv: Option<KeyValueMsg>,
    #[prost(string, tag = "2")]
    pub deleted_key: String,
    #[prost(uint64, tag = "3")]
    pub revision: u64,
}

impl From<WatchEvent> for WatchResponse {
    fn from(event: WatchEvent) -> Self {
        match event {
            WatchEvent::Put(kv) => Self {
                revision: kv.mod_revision,
                kv: Some(kv.into()),
                deleted_key: String::new(),
            },
            WatchEvent::Delete { key, revision } => Self {
                kv: None,
                deleted_key: key,
                revision,
            },
        }
    }
}

impl From<WatchResponse> for WatchEvent {
    fn from(msg: WatchResponse) -> Self {
        match msg.kv {
            Some(kv) => WatchEvent::Put(kv.into()),
            None => WatchEvent::Delete {
                key: msg.deleted_key,
                revision: msg.revision,
            },
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaseGrantRequest {
    #[prost(uint64, tag = "1")]
    pub ttl_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaseGrantResponse {
    #[prost(uint64, tag = "1")]
    pub lease: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaseRequest {
    #[prost(uint64, tag = "1")]
    pub lease: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaseResponse {}
