use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::metadata_cache::MetadataCache;
use crate::message::Message;
use crate::protocol::error::RpcError;
use crate::protocol::messages::{
    CreateStreamRequest, DeleteStreamRequest, FetchMetadataResponse, PublishRequest,
    PublishResponse, PublishToSubjectRequest, SubscribeRequest,
};

pub use self::pool::ConnectionPool;

mod pool;

/// Server-streaming response of the subscribe RPC.
///
/// The first item is the handshake: `Ok(_)` if the broker accepted the subscription, `Err(_)` if it rejected it.
/// Every following `Ok` item is a message of the partition, in log order. Dropping the stream cancels the call.
pub type SubscribeStream = BoxStream<'static, Result<Message, RpcError>>;

/// A connection to a single broker.
///
/// Implementations wrap the actual RPC channel. Calls on one connection may happen concurrently.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn fetch_metadata(&self) -> Result<FetchMetadataResponse, RpcError>;

    async fn create_stream(&self, request: CreateStreamRequest) -> Result<(), RpcError>;

    async fn delete_stream(&self, request: DeleteStreamRequest) -> Result<(), RpcError>;

    /// Publish to a stream partition.
    ///
    /// If `deadline` is set the transport should propagate it to the broker.
    async fn publish(
        &self,
        request: PublishRequest,
        deadline: Option<Duration>,
    ) -> Result<PublishResponse, RpcError>;

    async fn publish_to_subject(
        &self,
        request: PublishToSubjectRequest,
        deadline: Option<Duration>,
    ) -> Result<PublishResponse, RpcError>;

    async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeStream, RpcError>;

    /// Shut the connection down. Must be idempotent.
    fn close(&self);
}

/// How to connect to a broker address
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    async fn dial(&self, addr: &str) -> Result<Arc<Self::Conn>, RpcError>;
}

/// Runs control-plane RPCs against a cached broker connection, failing over to another broker when the
/// connection reports [`Unavailable`](crate::protocol::error::Code::Unavailable).
pub(crate) struct Dispatcher<D: Dialer> {
    dialer: Arc<D>,

    /// Source of broker addresses to fail over to.
    metadata: Arc<MetadataCache>,

    /// The cached broker connection, if any.
    current_broker: Mutex<Option<Arc<D::Conn>>>,

    /// Number of times an RPC is attempted before the last error is returned.
    max_attempts: usize,
}

impl<D: Dialer> Dispatcher<D> {
    pub(crate) fn new(
        dialer: Arc<D>,
        metadata: Arc<MetadataCache>,
        initial: Option<Arc<D::Conn>>,
        max_attempts: usize,
    ) -> Self {
        Self {
            dialer,
            metadata,
            current_broker: Mutex::new(initial),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Executes `f` against the current broker connection.
    ///
    /// `Unavailable` errors drop the connection and retry against a randomly chosen broker, up to the configured
    /// number of attempts. Every other error is returned right away.
    pub(crate) async fn execute<T, F, Fut>(&self, request_name: &'static str, f: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<D::Conn>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, RpcError>> + Send,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            // Retrieve the broker within the loop, in case it was invalidated
            let broker = match self.get().await {
                Ok(broker) => broker,
                Err(e) if e.is_unavailable() => {
                    warn!(e=%e, request_name, attempt, "Failed to connect to broker");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match f(Arc::clone(&broker)).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_unavailable() => {
                    warn!(e=%e, request_name, attempt, "Broker unavailable, switching brokers");
                    self.invalidate(&broker).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(e=%e, request_name, "request failed");
                    return Err(e);
                }
            }
        }

        error!(
            request_name,
            attempts = self.max_attempts,
            "all retries failed",
        );
        Err(last_error.unwrap_or_else(|| RpcError::unavailable("no attempt was made")))
    }

    /// Returns the cached connection, dialing a random known broker if there is none.
    async fn get(&self) -> Result<Arc<D::Conn>, RpcError> {
        let mut current_broker = self.current_broker.lock().await;
        if let Some(broker) = &*current_broker {
            return Ok(Arc::clone(broker));
        }

        let addrs: Vec<String> = self.metadata.addresses().into_iter().collect();
        let addr = addrs
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| RpcError::unavailable("no broker address known"))?;

        info!(broker = addr.as_str(), "Establishing new connection");
        let connection = self.dialer.dial(&addr).await?;

        *current_broker = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Closes and forgets `stale` if it is still the cached connection.
    ///
    /// Another caller may already have switched brokers, in which case the newer connection is kept.
    async fn invalidate(&self, stale: &Arc<D::Conn>) {
        let mut current_broker = self.current_broker.lock().await;
        if current_broker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            debug!("Invalidating cached broker");
            current_broker.take();
            drop(current_broker);
            stale.close();
        }
    }

    /// Closes the cached connection.
    pub(crate) async fn close(&self) {
        if let Some(broker) = self.current_broker.lock().await.take() {
            broker.close();
        }
    }
}

impl<D: Dialer> std::fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
