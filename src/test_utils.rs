//! In-memory fakes of the broker side for unit tests.
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::error::Error;
use crate::client::subscription::MessageHandler;
use crate::connection::{Connection, Dialer, SubscribeStream};
use crate::message::{Ack, AckPolicy, Message};
use crate::protocol::error::{Code, RpcError};
use crate::protocol::messages::{
    BrokerMetadata, CreateStreamRequest, DeleteStreamRequest, FetchMetadataResponse,
    PartitionMetadata, PublishRequest, PublishResponse, PublishToSubjectRequest, StreamMetadata,
    SubscribeRequest,
};

/// Shared state of all fake connections of one test.
#[derive(Debug, Default)]
pub(crate) struct FakeCluster {
    pub(crate) metadata: Mutex<FetchMetadataResponse>,

    /// Number of upcoming calls, on any connection, that fail with `Unavailable`.
    pub(crate) fail_next: AtomicUsize,

    /// Addresses that cannot be dialed.
    pub(crate) refuse_dial: Mutex<HashSet<String>>,

    /// Delay of every publish call.
    pub(crate) publish_delay: Mutex<Option<Duration>>,

    /// Do not send a handshake on subscribe.
    pub(crate) hold_handshake: AtomicBool,

    pub(crate) dials: Mutex<Vec<String>>,
    pub(crate) conns: Mutex<Vec<Arc<FakeConn>>>,
    pub(crate) calls: AtomicUsize,
    pub(crate) published: Mutex<Vec<PublishRequest>>,
    pub(crate) subscriptions: Mutex<Vec<FakeSubscription>>,
    next_offset: AtomicI64,
}

/// A subscribe call received by the fake cluster.
#[derive(Debug)]
pub(crate) struct FakeSubscription {
    pub(crate) addr: String,
    pub(crate) request: SubscribeRequest,

    /// Feeds the server side of the stream.
    pub(crate) tx: UnboundedSender<Result<Message, RpcError>>,
}

impl FakeCluster {
    /// Cluster with brokers `b1..=bn` listening on `broker-i:9292`.
    pub(crate) fn with_brokers(n: usize) -> Arc<Self> {
        let cluster = Self::default();
        cluster.metadata.lock().brokers = (1..=n)
            .map(|i| BrokerMetadata {
                id: format!("b{i}"),
                host: format!("broker-{i}"),
                port: 9292,
            })
            .collect();
        Arc::new(cluster)
    }

    /// Adds a stream whose partitions all have the same leader and ISR. An empty leader means no leader.
    pub(crate) fn add_stream(&self, name: &str, partitions: i32, leader: &str, isr: &[&str]) {
        let mut metadata = self.metadata.lock();
        let replicas: Vec<String> = metadata.brokers.iter().map(|b| b.id.clone()).collect();
        metadata.streams.push(StreamMetadata {
            name: name.to_owned(),
            subject: name.to_owned(),
            partitions: (0..partitions)
                .map(|id| PartitionMetadata {
                    id,
                    leader: (!leader.is_empty()).then(|| leader.to_owned()),
                    replicas: replicas.clone(),
                    isr: isr.iter().map(|s| (*s).to_owned()).collect(),
                })
                .collect(),
        });
    }

    fn has_partition(&self, stream: &str, partition: i32) -> bool {
        self.metadata
            .lock()
            .streams
            .iter()
            .any(|s| s.name == stream && s.partitions.iter().any(|p| p.id == partition))
    }

    pub(crate) fn subscription_tx(&self, idx: usize) -> UnboundedSender<Result<Message, RpcError>> {
        self.subscriptions.lock()[idx].tx.clone()
    }
}

#[derive(Debug)]
pub(crate) struct FakeConn {
    pub(crate) addr: String,
    cluster: Arc<FakeCluster>,
    closed: AtomicUsize,
}

impl FakeConn {
    pub(crate) fn new(addr: &str, cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_owned(),
            cluster,
            closed: AtomicUsize::new(0),
        })
    }

    /// Connection to a cluster of its own.
    pub(crate) fn detached(addr: &str) -> Arc<Self> {
        Self::new(addr, Arc::new(FakeCluster::default()))
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn call(&self) -> Result<(), RpcError> {
        self.cluster.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .cluster
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RpcError::unavailable(format!("{} is down", self.addr)));
        }
        Ok(())
    }

    fn ack(&self, stream: &str, policy: AckPolicy) -> Option<Ack> {
        let offset = self.cluster.next_offset.fetch_add(1, Ordering::SeqCst);
        (policy != AckPolicy::None).then(|| Ack {
            stream: stream.to_owned(),
            partition_subject: stream.to_owned(),
            message_subject: stream.to_owned(),
            offset,
            ack_inbox: String::new(),
            correlation_id: String::new(),
            ack_policy: policy,
        })
    }
}

#[async_trait]
impl Connection for FakeConn {
    async fn fetch_metadata(&self) -> Result<FetchMetadataResponse, RpcError> {
        self.call()?;
        Ok(self.cluster.metadata.lock().clone())
    }

    async fn create_stream(&self, request: CreateStreamRequest) -> Result<(), RpcError> {
        self.call()?;
        if self.cluster.has_partition(&request.name, 0) {
            return Err(RpcError::new(Code::AlreadyExists, "stream exists"));
        }
        let leader = self
            .cluster
            .metadata
            .lock()
            .brokers
            .first()
            .map(|b| b.id.clone())
            .unwrap_or_default();
        self.cluster
            .add_stream(&request.name, request.partitions, &leader, &[leader.as_str()]);
        Ok(())
    }

    async fn delete_stream(&self, request: DeleteStreamRequest) -> Result<(), RpcError> {
        self.call()?;
        let mut metadata = self.cluster.metadata.lock();
        let before = metadata.streams.len();
        metadata.streams.retain(|s| s.name != request.name);
        if metadata.streams.len() == before {
            return Err(RpcError::not_found("no such stream"));
        }
        Ok(())
    }

    async fn publish(
        &self,
        request: PublishRequest,
        _deadline: Option<Duration>,
    ) -> Result<PublishResponse, RpcError> {
        self.call()?;
        let delay = *self.cluster.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let ack = self.ack(&request.stream, request.ack_policy);
        self.cluster.published.lock().push(request);
        Ok(PublishResponse { ack })
    }

    async fn publish_to_subject(
        &self,
        request: PublishToSubjectRequest,
        _deadline: Option<Duration>,
    ) -> Result<PublishResponse, RpcError> {
        self.call()?;
        Ok(PublishResponse {
            ack: self.ack(&request.subject, request.ack_policy),
        })
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeStream, RpcError> {
        self.call()?;
        let (tx, rx) = unbounded();
        if !self.cluster.hold_handshake.load(Ordering::SeqCst) {
            let handshake = if self.cluster.has_partition(&request.stream, request.partition) {
                Ok(message(&request.stream, request.partition, 0, Bytes::new()))
            } else {
                Err(RpcError::not_found("no such partition"))
            };
            tx.unbounded_send(handshake).ok();
        }
        self.cluster.subscriptions.lock().push(FakeSubscription {
            addr: self.addr.clone(),
            request,
            tx,
        });
        Ok(rx.boxed())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct FakeDialer {
    cluster: Arc<FakeCluster>,
}

impl FakeDialer {
    pub(crate) fn new(cluster: Arc<FakeCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(&self, addr: &str) -> Result<Arc<FakeConn>, RpcError> {
        self.cluster.dials.lock().push(addr.to_owned());
        if self.cluster.refuse_dial.lock().contains(addr) {
            return Err(RpcError::unavailable(format!("cannot dial {addr}")));
        }
        let conn = FakeConn::new(addr, Arc::clone(&self.cluster));
        self.cluster.conns.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub(crate) fn message(stream: &str, partition: i32, offset: i64, value: Bytes) -> Message {
    Message {
        offset,
        key: None,
        value,
        timestamp: Message::timestamp_from_nanos(0),
        stream: stream.to_owned(),
        partition,
        subject: stream.to_owned(),
        reply_subject: String::new(),
        headers: Default::default(),
    }
}

/// What a [`ChannelHandler`] observed.
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Message),
    Error(Error),
}

/// Forwards every callback into a channel.
#[derive(Debug)]
pub(crate) struct ChannelHandler(mpsc::UnboundedSender<Delivery>);

impl ChannelHandler {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, message: Message) {
        self.0.send(Delivery::Message(message)).ok();
    }

    fn on_error(&self, error: Error) {
        self.0.send(Delivery::Error(error)).ok();
    }
}
