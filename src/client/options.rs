//! Per-call options.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::{
    client::{
        error::{Error, Result},
        partitioner::{ConstantPartitioner, Partitioner},
    },
    message::{AckPolicy, StartPosition},
    protocol::messages::{CreateStreamRequest, PublishRequest, PublishToSubjectRequest},
};

/// Settings of a stream to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Subject to attach the stream to. Defaults to the stream name.
    pub subject: Option<String>,

    /// Number of brokers the stream is replicated to. `-1` replicates to every broker in the cluster.
    pub replication_factor: i32,

    /// Load-balance group. Messages are balanced among streams of the same group.
    pub group: String,

    /// Number of partitions.
    pub partitions: i32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            subject: None,
            replication_factor: 1,
            group: String::new(),
            partitions: 1,
        }
    }
}

impl StreamOptions {
    pub(crate) fn to_request(&self, name: &str) -> Result<CreateStreamRequest> {
        if self.partitions < 0 {
            return Err(Error::InvalidArgument(format!(
                "partitions cannot be negative, got {}",
                self.partitions
            )));
        }
        if self.replication_factor == 0 || self.replication_factor < -1 {
            return Err(Error::InvalidArgument(format!(
                "replication factor must be positive or -1, got {}",
                self.replication_factor
            )));
        }

        let subject = match self.subject.as_deref() {
            None | Some("") => name.to_owned(),
            Some(subject) => subject.to_owned(),
        };

        Ok(CreateStreamRequest {
            name: name.to_owned(),
            subject,
            replication_factor: self.replication_factor,
            group: self.group.clone(),
            partitions: self.partitions,
        })
    }
}

/// Settings of a message to be published.
#[derive(Debug, Clone)]
pub struct MessageOptions {
    /// Used for partitioning and compaction.
    pub key: Option<Bytes>,

    pub headers: BTreeMap<String, Bytes>,

    /// Subject the broker publishes the ack to. The broker picks a random inbox if unset.
    pub ack_inbox: Option<String>,

    /// Identifier to correlate the ack with the message.
    pub correlation_id: Option<String>,

    pub ack_policy: AckPolicy,

    /// Picks the partition unless [`partition`](Self::partition) is set.
    pub partitioner: Arc<dyn Partitioner>,

    /// Explicit partition to publish to.
    pub partition: Option<i32>,

    /// Time to wait for the ack. Ignored with [`AckPolicy::None`].
    pub ack_deadline: Option<Duration>,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            key: None,
            headers: BTreeMap::new(),
            ack_inbox: None,
            correlation_id: None,
            ack_policy: AckPolicy::default(),
            partitioner: Arc::new(ConstantPartitioner::default()),
            partition: None,
            ack_deadline: None,
        }
    }
}

impl MessageOptions {
    /// Deadline to apply to the publish call.
    pub(crate) fn effective_deadline(&self) -> Option<Duration> {
        match self.ack_policy {
            AckPolicy::None => None,
            AckPolicy::Leader | AckPolicy::All => self.ack_deadline.filter(|d| !d.is_zero()),
        }
    }

    pub(crate) fn to_request(&self, stream: &str, partition: i32, value: Bytes) -> PublishRequest {
        PublishRequest {
            stream: stream.to_owned(),
            partition,
            key: self.key.clone(),
            value,
            headers: self.headers.clone(),
            ack_policy: self.ack_policy,
            ack_inbox: self.ack_inbox.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub(crate) fn to_subject_request(&self, subject: &str, value: Bytes) -> PublishToSubjectRequest {
        PublishToSubjectRequest {
            subject: subject.to_owned(),
            key: self.key.clone(),
            value,
            headers: self.headers.clone(),
            ack_policy: self.ack_policy,
            ack_inbox: self.ack_inbox.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Settings of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub partition: i32,

    pub start_position: StartPosition,

    /// Read from a random in-sync replica instead of the leader.
    pub read_isr_replica: bool,
}
