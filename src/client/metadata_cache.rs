use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::prelude::*;
use tracing::debug;

use crate::connection::{Connection, Dialer, Dispatcher};
use crate::metadata::Metadata;
use crate::protocol::error::RpcError;
use crate::protocol::messages::FetchMetadataResponse;

/// A [`MetadataCache`] holds the latest [`Metadata`] snapshot and answers routing questions from it.
///
/// Reads never go to the network. The snapshot is only replaced by [`refresh`](Self::refresh), which installs a
/// complete new snapshot in one step.
#[derive(Debug)]
pub(crate) struct MetadataCache {
    /// Addresses the client was constructed with, kept across refreshes.
    bootstrap_addrs: BTreeSet<String>,

    current: RwLock<Arc<Metadata>>,
}

impl MetadataCache {
    pub(crate) fn new(bootstrap_addrs: BTreeSet<String>) -> Self {
        let current = Arc::new(Metadata::empty(bootstrap_addrs.clone()));
        Self {
            bootstrap_addrs,
            current: RwLock::new(current),
        }
    }

    /// The latest snapshot.
    pub(crate) fn current(&self) -> Arc<Metadata> {
        Arc::clone(&self.current.read())
    }

    /// Bootstrap addresses plus every broker address of the current snapshot.
    pub(crate) fn addresses(&self) -> BTreeSet<String> {
        self.current().addresses()
    }

    /// Address of the broker to talk to for `partition` of `stream`.
    ///
    /// With `prefer_isr` a random member of the in-sync replica set is picked to spread reads, falling back to the
    /// leader if the ISR is empty. Returns `None` if the stream, the partition or its leader is unknown.
    pub(crate) fn resolve(&self, stream: &str, partition: i32, prefer_isr: bool) -> Option<String> {
        self.resolve_with_rng(stream, partition, prefer_isr, &mut rand::rng())
    }

    fn resolve_with_rng<R: Rng>(
        &self,
        stream: &str,
        partition: i32,
        prefer_isr: bool,
        rng: &mut R,
    ) -> Option<String> {
        let metadata = self.current();
        let partition = metadata.stream(stream)?.partition(partition)?;

        if prefer_isr {
            if let Some(replica) = partition.isr.choose(rng) {
                return Some(replica.address());
            }
        }

        partition.leader.as_ref().map(|leader| leader.address())
    }

    /// Fetches the cluster topology through `dispatcher` and installs it as the current snapshot.
    ///
    /// RPC failures are returned unchanged and leave the current snapshot in place.
    pub(crate) async fn refresh<D: Dialer>(
        &self,
        dispatcher: &Dispatcher<D>,
    ) -> Result<Arc<Metadata>, RpcError> {
        let response = dispatcher
            .execute("fetch_metadata", |broker| async move {
                broker.fetch_metadata().await
            })
            .await?;

        Ok(self.update(response))
    }

    pub(crate) fn update(&self, response: FetchMetadataResponse) -> Arc<Metadata> {
        let metadata = Arc::new(Metadata::from_response(
            response,
            self.bootstrap_addrs.clone(),
        ));
        *self.current.write() = Arc::clone(&metadata);
        debug!(
            brokers = metadata.brokers().count(),
            streams = metadata.streams().count(),
            "updated metadata cache"
        );
        metadata
    }
}
