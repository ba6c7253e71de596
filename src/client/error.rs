use thiserror::Error;

pub use crate::protocol::error::{Code, RpcError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An RPC failed with an error that has no more specific meaning in this context.
    ///
    /// A [`Code::Unavailable`] here means that no broker could be reached within the retry limit.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Stream already exists: {stream}")]
    StreamExists { stream: String, source: RpcError },

    #[error("Stream does not exist: {stream}")]
    NoSuchStream { stream: String, source: RpcError },

    #[error("No such partition: stream \"{stream}\" partition {partition}")]
    NoSuchPartition {
        stream: String,
        partition: i32,
        source: Option<RpcError>,
    },

    /// The stream was deleted while subscribed to it.
    #[error("Stream was deleted: stream \"{stream}\" partition {partition}")]
    StreamDeleted {
        stream: String,
        partition: i32,
        source: RpcError,
    },

    #[error("Partition was paused: stream \"{stream}\" partition {partition}")]
    PartitionPaused {
        stream: String,
        partition: i32,
        source: RpcError,
    },

    /// The request reached a broker but no response arrived in time.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(RpcError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No bootstrap brokers given")]
    NoBrokers,

    #[error("Client is closed")]
    Closed,
}

impl Error {
    /// The RPC status behind this error, if any.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc(e)
            | Self::StreamExists { source: e, .. }
            | Self::NoSuchStream { source: e, .. }
            | Self::StreamDeleted { source: e, .. }
            | Self::PartitionPaused { source: e, .. }
            | Self::DeadlineExceeded(e) => Some(e.code()),
            Self::NoSuchPartition { source, .. } => source.as_ref().map(RpcError::code),
            Self::InvalidArgument(_) | Self::NoBrokers | Self::Closed => None,
        }
    }

    /// Maps a failed publish, turning an elapsed deadline into [`Error::DeadlineExceeded`].
    pub(crate) fn from_publish(e: RpcError) -> Self {
        match e.code() {
            Code::DeadlineExceeded => Self::DeadlineExceeded(e),
            _ => Self::Rpc(e),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
