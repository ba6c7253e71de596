//! Long-lived subscriptions to a stream partition.
//!
//! A subscription owns one pooled broker connection for its whole life. A background task reads the subscribe
//! stream, waits for the handshake, then hands every message to a [`MessageHandler`] in log order. The connection
//! goes back to its pool exactly once, no matter how the subscription ends.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::error::{Error, Result};
use crate::connection::{Connection, ConnectionPool};
use crate::message::Message;
use crate::protocol::error::{Code, RpcError};
use crate::protocol::messages::SubscribeRequest;

/// Receives the messages of a subscription.
///
/// Callbacks run on the subscription's delivery task, one at a time. A slow handler slows down consumption of that
/// subscription only.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: Message);

    /// Called at most once, when the subscription fails after the handshake.
    ///
    /// Never called for a subscription that was cancelled via [`SubscriptionHandle::unsubscribe`] or that completed
    /// normally.
    fn on_error(&self, error: Error);
}

/// Handle of a running subscription.
///
/// Dropping the handle does not end the subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    stream: String,
    partition: i32,
    cancel: CancellationToken,
    terminated: CancellationToken,
}

impl SubscriptionHandle {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Cancels the subscription.
    ///
    /// No message is delivered once the delivery task observed the cancellation. Calling this more than once, or
    /// after the subscription ended on its own, has no effect.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Whether the delivery task has finished and released its connection.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Waits until the delivery task has finished and released its connection.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }
}

/// How the delivery task ended.
#[derive(Debug)]
enum Outcome {
    /// Rejected before or during the handshake. The caller was told through the handshake channel.
    Rejected,

    /// The broker ended the stream.
    Completed,

    Cancelled,

    Failed(RpcError),
}

/// Starts a subscription on `conn` and waits for the broker's handshake.
///
/// `conn` was taken from `pool` and is released to it when the subscription ends, including when the handshake
/// fails.
pub(crate) async fn start<C: Connection>(
    pool: Arc<ConnectionPool<C>>,
    conn: Arc<C>,
    request: SubscribeRequest,
    handler: Arc<dyn MessageHandler>,
    handshake_timeout: Option<Duration>,
) -> Result<SubscriptionHandle> {
    let handle = SubscriptionHandle {
        stream: request.stream.clone(),
        partition: request.partition,
        cancel: CancellationToken::new(),
        terminated: CancellationToken::new(),
    };

    let (handshake_tx, handshake_rx) = oneshot::channel();
    let session = Session {
        pool,
        conn,
        handle: handle.clone(),
        handler,
    };
    tokio::spawn(session.run(request, handshake_tx));

    let handshake = async {
        handshake_rx.await.unwrap_or_else(|_| {
            Err(RpcError::new(
                Code::Cancelled,
                "subscription ended before the handshake",
            ))
        })
    };
    let result = match handshake_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => {
                handle.unsubscribe();
                Err(RpcError::new(
                    Code::DeadlineExceeded,
                    format!("no handshake within {timeout:?}"),
                ))
            }
        },
        None => handshake.await,
    };

    match result {
        Ok(()) => Ok(handle),
        Err(e) => Err(match e.code() {
            Code::NotFound => Error::NoSuchPartition {
                stream: handle.stream,
                partition: handle.partition,
                source: Some(e),
            },
            Code::DeadlineExceeded => Error::DeadlineExceeded(e),
            _ => Error::Rpc(e),
        }),
    }
}

struct Session<C> {
    pool: Arc<ConnectionPool<C>>,
    conn: Arc<C>,
    handle: SubscriptionHandle,
    handler: Arc<dyn MessageHandler>,
}

impl<C: Connection> Session<C> {
    async fn run(self, request: SubscribeRequest, handshake: oneshot::Sender<Result<(), RpcError>>) {
        let outcome = self.deliver(request, handshake).await;

        let Self {
            pool,
            conn,
            handle,
            handler,
        } = self;
        pool.release(conn);

        match outcome {
            Outcome::Rejected => {}
            Outcome::Completed => info!(
                stream = handle.stream.as_str(),
                partition = handle.partition,
                "Subscription completed"
            ),
            Outcome::Cancelled => debug!(
                stream = handle.stream.as_str(),
                partition = handle.partition,
                "Subscription cancelled"
            ),
            Outcome::Failed(e) => {
                if let Some(error) = classify(&handle, e) {
                    warn!(
                        e=%error,
                        stream = handle.stream.as_str(),
                        partition = handle.partition,
                        "Subscription failed"
                    );
                    handler.on_error(error);
                }
            }
        }

        handle.terminated.cancel();
    }

    async fn deliver(
        &self,
        request: SubscribeRequest,
        handshake: oneshot::Sender<Result<(), RpcError>>,
    ) -> Outcome {
        let cancel = &self.handle.cancel;

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            subscribed = self.conn.subscribe(request) => subscribed,
        };
        let mut messages = match subscribed {
            Ok(messages) => messages,
            Err(e) => {
                handshake.send(Err(e)).ok();
                return Outcome::Rejected;
            }
        };

        // The first item tells whether the broker accepted the subscription.
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            first = messages.next() => first,
        };
        let accepted = match first {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(RpcError::unavailable(
                "subscribe stream ended before the handshake",
            )),
        };
        let rejected = accepted.is_err();
        if handshake.send(accepted).is_err() {
            // nobody waits for the handshake anymore
            return Outcome::Cancelled;
        }
        if rejected {
            return Outcome::Rejected;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                item = messages.next() => match item {
                    Some(Ok(message)) => self.handler.on_message(message),
                    Some(Err(e)) => return Outcome::Failed(e),
                    None => return Outcome::Completed,
                },
            }
        }
    }
}

/// Error to report for a subscription that failed after the handshake, if any.
fn classify(handle: &SubscriptionHandle, e: RpcError) -> Option<Error> {
    let stream = handle.stream.clone();
    let partition = handle.partition;
    match e.code() {
        Code::Cancelled => None,
        Code::NotFound => Some(Error::StreamDeleted {
            stream,
            partition,
            source: e,
        }),
        Code::FailedPrecondition => Some(Error::PartitionPaused {
            stream,
            partition,
            source: e,
        }),
        _ => Some(Error::Rpc(e)),
    }
}
