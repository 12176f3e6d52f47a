//! Error types for remote execution calls and scan anomalies.

use std::time::Duration;

use crate::types::{RequestId, SourceLocator};

/// Errors a caller of `register`/`execute` can observe.
///
/// Every variant means "this call failed"; none of them is fatal to the
/// runtime, which keeps scanning and reconnecting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// There is no live connection to the remote executor.
    #[error("not connected to remote executor")]
    NotConnected,

    /// The frame could not be written to the channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply to a register call within the registration timeout.
    #[error("register request {request_id} timed out after {}ms", .after.as_millis())]
    RegistrationTimeout {
        request_id: RequestId,
        after: Duration,
    },

    /// No reply to an execute call within the execution timeout.
    #[error("execute request {request_id} timed out after {}ms", .after.as_millis())]
    ExecutionTimeout {
        request_id: RequestId,
        after: Duration,
    },

    /// The executor replied with an explicit `error` field.
    #[error("{0}")]
    RemoteExecution(String),

    /// The configured outstanding-request cap is reached.
    #[error("too many outstanding requests (limit {0})")]
    TooManyOutstanding(usize),
}

impl ClientError {
    /// True for either timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RegistrationTimeout { .. } | Self::ExecutionTimeout { .. }
        )
    }

    /// True for failures caused by the connection rather than the remote code.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }
}

/// Result type for remote execution calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Non-fatal irregularities found while scanning source text.
///
/// These never reach callers; the scanner reports them to the log buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanAnomaly {
    #[error("{locator}:{line}: block opened here was never closed")]
    UnterminatedBlock { locator: SourceLocator, line: usize },

    #[error("{locator}:{line}: block reopened before close; discarding block opened at line {discarded}")]
    NestedBegin {
        locator: SourceLocator,
        line: usize,
        discarded: usize,
    },

    #[error("{locator}:{line}: end token without an open block")]
    OrphanEnd { locator: SourceLocator, line: usize },

    #[error("{locator}:{line}: register-next-line token on the last line")]
    DanglingLineToken { locator: SourceLocator, line: usize },
}
