//! Strategies mapping a message to a stream partition.
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{client::options::MessageOptions, metadata::Metadata};

/// Maps a message to a stream partition.
///
/// Only consulted when the message does not name a partition itself.
pub trait Partitioner: std::fmt::Debug + Send + Sync {
    fn partition(
        &self,
        stream: &str,
        key: Option<&[u8]>,
        value: &[u8],
        opts: &MessageOptions,
        metadata: &Metadata,
    ) -> i32;
}

/// Always picks the same partition, 0 by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantPartitioner(pub i32);

impl Partitioner for ConstantPartitioner {
    fn partition(
        &self,
        _stream: &str,
        _key: Option<&[u8]>,
        _value: &[u8],
        _opts: &MessageOptions,
        _metadata: &Metadata,
    ) -> i32 {
        self.0
    }
}

/// Hashes the message key onto the partitions of the stream.
///
/// Messages without a key, or for streams without known partitions, go to partition 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyPartitioner;

impl Partitioner for KeyPartitioner {
    fn partition(
        &self,
        stream: &str,
        key: Option<&[u8]>,
        _value: &[u8],
        _opts: &MessageOptions,
        metadata: &Metadata,
    ) -> i32 {
        let Some(key) = key else {
            return 0;
        };
        let partitions = metadata.partition_count(stream) as u32;
        if partitions == 0 {
            return 0;
        }
        (fnv1a_32(key) % partitions) as i32
    }
}

/// Cycles through the partitions of each stream.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    counters: Mutex<HashMap<String, usize>>,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(
        &self,
        stream: &str,
        _key: Option<&[u8]>,
        _value: &[u8],
        _opts: &MessageOptions,
        metadata: &Metadata,
    ) -> i32 {
        let partitions = metadata.partition_count(stream);
        if partitions == 0 {
            return 0;
        }

        let mut counters = self.counters.lock();
        let counter = counters.entry(stream.to_owned()).or_default();
        let partition = *counter % partitions;
        *counter = counter.wrapping_add(1);
        partition as i32
    }
}

fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}
