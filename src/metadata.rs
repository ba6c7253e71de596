//! Cluster-wide stream metadata.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::protocol::messages::FetchMetadataResponse;

/// A broker in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerInfo {
    /// The broker ID
    pub id: String,

    /// The broker hostname
    pub host: String,

    /// The broker port
    pub port: u16,
}

impl BrokerInfo {
    /// Address to dial, `host:port`.
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl Display for BrokerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Placement of a single stream partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,

    /// `None` while the partition has no elected leader.
    pub leader: Option<Arc<BrokerInfo>>,

    /// All brokers hosting this partition.
    pub replicas: Vec<Arc<BrokerInfo>>,

    /// Replicas that are caught up with the leader.
    pub isr: Vec<Arc<BrokerInfo>>,
}

/// A stream and its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub subject: String,
    pub partitions: HashMap<i32, PartitionInfo>,
}

impl StreamInfo {
    pub fn partition(&self, id: i32) -> Option<&PartitionInfo> {
        self.partitions.get(&id)
    }
}

/// Immutable snapshot of the cluster topology.
///
/// Every metadata refresh builds a new snapshot, so a snapshot can be held for as long as needed without ever
/// observing a partial update.
#[derive(Debug, Clone)]
pub struct Metadata {
    created_at: DateTime<Utc>,
    brokers: HashMap<String, Arc<BrokerInfo>>,
    streams: HashMap<String, StreamInfo>,
    bootstrap_addrs: BTreeSet<String>,
}

impl Metadata {
    /// Snapshot that knows nothing but the bootstrap addresses.
    pub fn empty(bootstrap_addrs: BTreeSet<String>) -> Self {
        Self {
            created_at: Utc::now(),
            brokers: HashMap::new(),
            streams: HashMap::new(),
            bootstrap_addrs,
        }
    }

    /// Builds a snapshot from a `FetchMetadata` response.
    ///
    /// Brokers referenced by a partition but missing from the broker list are skipped.
    pub fn from_response(
        response: FetchMetadataResponse,
        bootstrap_addrs: BTreeSet<String>,
    ) -> Self {
        let brokers: HashMap<String, Arc<BrokerInfo>> = response
            .brokers
            .into_iter()
            .map(|b| {
                let info = Arc::new(BrokerInfo {
                    id: b.id,
                    host: b.host,
                    port: b.port,
                });
                (info.id.clone(), info)
            })
            .collect();

        let lookup = |id: &str| {
            let broker = brokers.get(id).map(Arc::clone);
            if broker.is_none() {
                warn!(broker = id, "partition references unknown broker");
            }
            broker
        };
        // a broker listed twice would be picked twice as often from the ISR
        let lookup_all = |ids: &[String]| -> Vec<Arc<BrokerInfo>> {
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(id.as_str()))
                .filter_map(|id| lookup(id.as_str()))
                .collect()
        };

        let streams = response
            .streams
            .into_iter()
            .map(|s| {
                let partitions = s
                    .partitions
                    .into_iter()
                    .map(|p| {
                        let partition = PartitionInfo {
                            id: p.id,
                            leader: p.leader.as_deref().and_then(lookup),
                            replicas: lookup_all(&p.replicas),
                            isr: lookup_all(&p.isr),
                        };
                        (p.id, partition)
                    })
                    .collect();
                let stream = StreamInfo {
                    name: s.name,
                    subject: s.subject,
                    partitions,
                };
                (stream.name.clone(), stream)
            })
            .collect();

        Self {
            created_at: Utc::now(),
            brokers,
            streams,
            bootstrap_addrs,
        }
    }

    /// Time this snapshot was built.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn brokers(&self) -> impl Iterator<Item = &Arc<BrokerInfo>> {
        self.brokers.values()
    }

    pub fn broker(&self, id: &str) -> Option<&Arc<BrokerInfo>> {
        self.brokers.get(id)
    }

    pub fn stream(&self, name: &str) -> Option<&StreamInfo> {
        self.streams.get(name)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.values()
    }

    /// Number of partitions of `stream`, 0 if the stream is unknown.
    pub fn partition_count(&self, stream: &str) -> usize {
        self.stream(stream).map(|s| s.partitions.len()).unwrap_or(0)
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.streams.contains_key(stream)
    }

    /// Addresses given at client construction.
    pub fn bootstrap_addrs(&self) -> &BTreeSet<String> {
        &self.bootstrap_addrs
    }

    /// Bootstrap addresses plus the address of every known broker.
    pub fn addresses(&self) -> BTreeSet<String> {
        let mut addrs = self.bootstrap_addrs.clone();
        addrs.extend(self.brokers.values().map(|b| b.address()));
        addrs
    }
}
