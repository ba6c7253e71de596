//! Request and response shapes exchanged with a broker.
//!
//! The wire encoding of these types belongs to the transport, see [`Connection`](crate::connection::Connection).
use std::collections::BTreeMap;

use bytes::Bytes;

use crate::message::{Ack, AckPolicy, StartPosition};

/// Response of the `FetchMetadata` RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMetadataResponse {
    /// All brokers in the cluster.
    pub brokers: Vec<BrokerMetadata>,

    /// All streams with their partitions.
    pub streams: Vec<StreamMetadata>,
}

/// A broker as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// A stream as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub name: String,
    pub subject: String,
    pub partitions: Vec<PartitionMetadata>,
}

/// A stream partition as reported by the cluster. Brokers are referenced by ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: i32,

    /// `None` while no leader is elected.
    pub leader: Option<String>,

    pub replicas: Vec<String>,
    pub isr: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStreamRequest {
    pub name: String,
    pub subject: String,
    pub replication_factor: i32,
    pub group: String,
    pub partitions: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStreamRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub stream: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: BTreeMap<String, Bytes>,
    pub ack_policy: AckPolicy,
    pub ack_inbox: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishToSubjectRequest {
    pub subject: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: BTreeMap<String, Bytes>,
    pub ack_policy: AckPolicy,
    pub ack_inbox: Option<String>,
    pub correlation_id: Option<String>,
}

/// Response of both publish RPCs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResponse {
    /// Present if the broker waited for the ack policy to be satisfied.
    pub ack: Option<Ack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub stream: String,
    pub partition: i32,
    pub start_position: StartPosition,
    pub read_isr_replica: bool,
}
