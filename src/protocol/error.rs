//! Error classification of the RPC transport.
use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Status code attached to every failed RPC.
///
/// Transports map their native status codes onto this set. Only [`Code::Unavailable`] is treated as a
/// connectivity failure, everything else is an application-level outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// The broker cannot be reached or refused to serve the call.
    Unavailable,

    /// The addressed stream or partition does not exist.
    NotFound,

    /// The resource to be created exists already.
    AlreadyExists,

    /// The call did not finish before its deadline.
    DeadlineExceeded,

    /// The broker rejected the call because of its current state, e.g. a paused partition.
    FailedPrecondition,

    /// The call was cancelled.
    Cancelled,

    /// Anything else.
    Other,
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::FailedPrecondition => "failed precondition",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed RPC.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("RPC failed ({code}): {message}")]
pub struct RpcError {
    code: Code,
    message: String,
}

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if the error signals a broken or unreachable broker.
    pub fn is_unavailable(&self) -> bool {
        self.code == Code::Unavailable
    }
}
