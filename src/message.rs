//! Messages received from and acknowledged by the brokers.
use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message received from a stream partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Monotonic sequence of the message within its partition.
    pub offset: i64,

    /// Optional key, used for partitioning and compaction.
    pub key: Option<Bytes>,

    pub value: Bytes,

    /// Time the broker received the message.
    pub timestamp: DateTime<Utc>,

    pub stream: String,
    pub partition: i32,

    /// Subject the message was received on.
    pub subject: String,

    /// Reply subject, empty if none.
    pub reply_subject: String,

    pub headers: BTreeMap<String, Bytes>,
}

impl Message {
    /// Converts a timestamp in nanoseconds since the epoch, as sent by the brokers.
    pub fn timestamp_from_nanos(nanos: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(nanos)
    }
}

/// Controls when a broker acknowledges a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AckPolicy {
    /// Ack once the partition leader has written the message to its log.
    #[default]
    Leader,

    /// Ack once every replica in the ISR has written the message.
    All,

    /// Never ack.
    None,
}

/// Acknowledgement that a message was committed to a stream partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub stream: String,

    /// Subject the partition is attached to.
    pub partition_subject: String,

    /// Subject the message was received on.
    pub message_subject: String,

    /// Partition offset the message was committed to.
    pub offset: i64,

    pub ack_inbox: String,
    pub correlation_id: String,
    pub ack_policy: AckPolicy,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published after the subscription was created.
    #[default]
    NewOnly,

    /// At a specific offset.
    Offset(i64),

    /// At the oldest message still retained.
    Earliest,

    /// At the newest message.
    Latest,

    /// At the first message received at or after the given time, in nanoseconds since the epoch.
    Timestamp(i64),
}
