use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionPool, Dialer, Dispatcher},
    message::Ack,
    metadata::Metadata,
    protocol::{
        error::{Code, RpcError},
        messages::{DeleteStreamRequest, SubscribeRequest},
    },
};

pub mod error;
pub(crate) mod metadata_cache;
pub mod options;
pub mod partitioner;
pub mod subscription;

use error::{Error, Result};

use self::{
    metadata_cache::MetadataCache,
    options::{MessageOptions, StreamOptions, SubscriptionOptions},
    subscription::{MessageHandler, SubscriptionHandle},
};

/// Builder for [`Client`].
pub struct ClientBuilder {
    bootstrap_brokers: Vec<String>,
    max_conns_per_broker: usize,
    keep_alive: Duration,
    dispatch_attempts: usize,
    resolve_attempts: usize,
    resolve_retry_delay: Duration,
    handshake_timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Create a new [`ClientBuilder`] with the list of bootstrap brokers (`host:port`).
    pub fn new(bootstrap_brokers: Vec<String>) -> Self {
        Self {
            bootstrap_brokers,
            max_conns_per_broker: 2,
            keep_alive: Duration::from_secs(30),
            dispatch_attempts: 10,
            resolve_attempts: 5,
            resolve_retry_delay: Duration::from_millis(50),
            handshake_timeout: None,
        }
    }

    /// Maximum number of idle connections kept per broker. 0 means unlimited.
    pub fn with_max_conns_per_broker(mut self, max_conns: usize) -> Self {
        self.max_conns_per_broker = max_conns;
        self
    }

    /// How long an idle pooled connection is kept open. Zero keeps it forever.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Number of attempts of a control-plane or publish RPC before an `Unavailable` error is returned.
    pub fn with_dispatch_attempts(mut self, attempts: usize) -> Self {
        self.dispatch_attempts = attempts;
        self
    }

    /// How often, and how far apart, subscribe refreshes the metadata to find an unknown partition.
    pub fn with_resolve_retry(mut self, attempts: usize, delay: Duration) -> Self {
        self.resolve_attempts = attempts;
        self.resolve_retry_delay = delay;
        self
    }

    /// Bound the wait for the subscribe handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Build [`Client`].
    ///
    /// Connects to one of the bootstrap brokers, chosen at random, and fetches the cluster metadata.
    pub async fn build<D: Dialer>(self, dialer: D) -> Result<Client<D>> {
        if self.bootstrap_brokers.is_empty() {
            return Err(Error::NoBrokers);
        }
        let dialer = Arc::new(dialer);

        let mut addrs = self.bootstrap_brokers.clone();
        addrs.shuffle(&mut rand::rng());

        let mut initial = None;
        let mut last_error = None;
        for addr in &addrs {
            match dialer.dial(addr).await {
                Ok(conn) => {
                    info!(broker = addr.as_str(), "Connected to bootstrap broker");
                    initial = Some(conn);
                    break;
                }
                Err(e) => {
                    warn!(e=%e, broker = addr.as_str(), "Failed to connect to bootstrap broker");
                    last_error = Some(e);
                }
            }
        }
        let Some(initial) = initial else {
            return Err(last_error
                .unwrap_or_else(|| RpcError::unavailable("no bootstrap broker reachable"))
                .into());
        };

        let metadata = Arc::new(MetadataCache::new(
            self.bootstrap_brokers.iter().cloned().collect::<BTreeSet<_>>(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&dialer),
            Arc::clone(&metadata),
            Some(initial),
            self.dispatch_attempts,
        );
        metadata.refresh(&dispatcher).await?;

        Ok(Client {
            dialer,
            dispatcher,
            metadata,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            max_conns_per_broker: self.max_conns_per_broker,
            keep_alive: self.keep_alive,
            resolve_attempts: self.resolve_attempts.max(1),
            resolve_retry_delay: self.resolve_retry_delay,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("bootstrap_brokers", &self.bootstrap_brokers)
            .finish_non_exhaustive()
    }
}

/// Client of a cluster of stream brokers.
///
/// Control-plane calls and publishes share one broker connection that fails over to another broker when it becomes
/// unavailable. Subscriptions use pooled connections to the broker that serves their partition.
pub struct Client<D: Dialer> {
    dialer: Arc<D>,
    dispatcher: Dispatcher<D>,
    metadata: Arc<MetadataCache>,

    /// One pool per broker address, created on first use.
    pools: Mutex<HashMap<String, Arc<ConnectionPool<D::Conn>>>>,

    closed: AtomicBool,

    max_conns_per_broker: usize,
    keep_alive: Duration,
    resolve_attempts: usize,
    resolve_retry_delay: Duration,
    handshake_timeout: Option<Duration>,
}

impl<D: Dialer> Client<D> {
    /// Creates a stream.
    ///
    /// Fails with [`Error::StreamExists`] if a stream with that name exists already.
    pub async fn create_stream(&self, name: &str, opts: StreamOptions) -> Result<()> {
        self.ensure_open()?;
        let request = opts.to_request(name)?;

        self.dispatcher
            .execute("create_stream", |broker| {
                let request = request.clone();
                async move { broker.create_stream(request).await }
            })
            .await
            .map_err(|e| match e.code() {
                Code::AlreadyExists => Error::StreamExists {
                    stream: name.to_owned(),
                    source: e,
                },
                _ => Error::Rpc(e),
            })?;

        // Make the new partitions resolvable for an immediate subscribe.
        if let Err(e) = self.metadata.refresh(&self.dispatcher).await {
            warn!(e=%e, stream = name, "Failed to refresh metadata after creating stream");
        }
        Ok(())
    }

    /// Deletes a stream.
    ///
    /// Fails with [`Error::NoSuchStream`] if there is no stream with that name.
    pub async fn delete_stream(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let request = DeleteStreamRequest {
            name: name.to_owned(),
        };

        self.dispatcher
            .execute("delete_stream", |broker| {
                let request = request.clone();
                async move { broker.delete_stream(request).await }
            })
            .await
            .map_err(|e| match e.code() {
                Code::NotFound => Error::NoSuchStream {
                    stream: name.to_owned(),
                    source: e,
                },
                _ => Error::Rpc(e),
            })
    }

    /// Publishes a message to a stream.
    ///
    /// The partition is [`MessageOptions::partition`] if set, otherwise the one picked by the partitioner. Returns
    /// the ack, or `None` with [`AckPolicy::None`](crate::message::AckPolicy::None).
    ///
    /// With an ack deadline the call fails with [`Error::DeadlineExceeded`] if a broker took the request but did not
    /// ack it in time. Failing to reach any broker is reported as [`Error::Rpc`] instead.
    pub async fn publish(
        &self,
        stream: &str,
        value: impl Into<Bytes> + Send,
        opts: MessageOptions,
    ) -> Result<Option<Ack>> {
        self.ensure_open()?;
        let value = value.into();

        let partition = match opts.partition {
            Some(partition) => partition,
            None => {
                let metadata = self.metadata.current();
                opts.partitioner.partition(
                    stream,
                    opts.key.as_deref(),
                    &value,
                    &opts,
                    &metadata,
                )
            }
        };
        let deadline = opts.effective_deadline();
        let request = opts.to_request(stream, partition, value);

        let response = self
            .dispatcher
            .execute("publish", |broker| {
                let request = request.clone();
                with_deadline(deadline, async move { broker.publish(request, deadline).await })
            })
            .await
            .map_err(Error::from_publish)?;

        Ok(response.ack)
    }

    /// Publishes a message straight to a subject.
    ///
    /// Partition related options are ignored.
    pub async fn publish_to_subject(
        &self,
        subject: &str,
        value: impl Into<Bytes> + Send,
        opts: MessageOptions,
    ) -> Result<Option<Ack>> {
        self.ensure_open()?;
        let deadline = opts.effective_deadline();
        let request = opts.to_subject_request(subject, value.into());

        let response = self
            .dispatcher
            .execute("publish_to_subject", |broker| {
                let request = request.clone();
                with_deadline(deadline, async move {
                    broker.publish_to_subject(request, deadline).await
                })
            })
            .await
            .map_err(Error::from_publish)?;

        Ok(response.ack)
    }

    /// Subscribes to a stream partition.
    ///
    /// Returns once the serving broker accepted the subscription. Messages are then passed to `handler` in log
    /// order until the subscription is cancelled, the broker ends the stream or it fails. Fails with
    /// [`Error::NoSuchPartition`] if the partition cannot be found, even after refreshing the metadata. A failed
    /// refresh is returned as is.
    pub async fn subscribe(
        &self,
        stream: &str,
        opts: SubscriptionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        let addr = self
            .resolve(stream, opts.partition, opts.read_isr_replica)
            .await?;

        let pool = self.pool(&addr)?;
        let dialer = Arc::clone(&self.dialer);
        let conn = pool
            .acquire(|| async move { dialer.dial(&addr).await })
            .await?;

        let request = SubscribeRequest {
            stream: stream.to_owned(),
            partition: opts.partition,
            start_position: opts.start_position,
            read_isr_replica: opts.read_isr_replica,
        };
        subscription::start(pool, conn, request, handler, self.handshake_timeout).await
    }

    /// Address of the broker serving `partition`, refreshing the metadata while it is unknown.
    async fn resolve(&self, stream: &str, partition: i32, prefer_isr: bool) -> Result<String> {
        for attempt in 1..=self.resolve_attempts {
            if let Some(addr) = self.metadata.resolve(stream, partition, prefer_isr) {
                return Ok(addr);
            }
            if attempt == self.resolve_attempts {
                break;
            }

            debug!(stream, partition, attempt, "Partition unknown, refreshing metadata");
            tokio::time::sleep(self.resolve_retry_delay).await;
            self.metadata.refresh(&self.dispatcher).await?;
        }

        Err(Error::NoSuchPartition {
            stream: stream.to_owned(),
            partition,
            source: None,
        })
    }

    /// Pool of `addr`, created on first use.
    ///
    /// Checked against `closed` under the map lock, so no pool is added after [`close`](Self::close) drained the map.
    fn pool(&self, addr: &str) -> Result<Arc<ConnectionPool<D::Conn>>> {
        let mut pools = self.pools.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let pool = pools.entry(addr.to_owned()).or_insert_with(|| {
            Arc::new(ConnectionPool::new(
                addr,
                self.max_conns_per_broker,
                self.keep_alive,
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// Fetches the cluster metadata and returns the new snapshot.
    pub async fn fetch_metadata(&self) -> Result<Arc<Metadata>> {
        self.ensure_open()?;
        Ok(self.metadata.refresh(&self.dispatcher).await?)
    }

    /// The most recently fetched metadata, without going to the network.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata.current()
    }

    /// Closes every pooled connection and the control-plane connection.
    ///
    /// Running subscriptions are not cancelled, their connections are closed when they end. Every later call on
    /// the client fails with [`Error::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
        self.dispatcher.close().await;
        info!("Client closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl<D: Dialer> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("dispatcher", &self.dispatcher)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Awaits a publish call on a broker, failing with [`Code::DeadlineExceeded`] once `deadline` elapsed.
///
/// Only bounds the call itself. Dialing a broker is not covered, and a deadline error is never retried.
async fn with_deadline<T, F>(deadline: Option<Duration>, publish: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>> + Send,
{
    let Some(deadline) = deadline else {
        return publish.await;
    };
    tokio::time::timeout(deadline, publish)
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::new(
                Code::DeadlineExceeded,
                format!("no ack within {deadline:?}"),
            ))
        })
}
