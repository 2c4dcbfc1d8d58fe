use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodectlError {
    /// Endpoint unreachable or the connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An established connection failed while a call was in flight.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The caller-supplied per-chunk handler rejected a chunk.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The agent answered the call with an error frame.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Registry invariant violated: {0}")]
    RegistryInvariant(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`NodectlError`], cheap to copy into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Transport,
    Handler,
    Remote,
    RegistryInvariant,
    Cancelled,
    Timeout,
    Protocol,
    Internal,
}

impl NodectlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodectlError::Connection(_) | NodectlError::InvalidEndpoint(_) => ErrorKind::Connection,
            NodectlError::Transport(_)
            | NodectlError::MessageTooLarge { .. }
            | NodectlError::Io(_) => ErrorKind::Transport,
            NodectlError::Handler(_) => ErrorKind::Handler,
            NodectlError::Remote(_) => ErrorKind::Remote,
            NodectlError::RegistryInvariant(_) => ErrorKind::RegistryInvariant,
            NodectlError::Cancelled => ErrorKind::Cancelled,
            NodectlError::Timeout(_) => ErrorKind::Timeout,
            NodectlError::InvalidResponse(_) | NodectlError::JsonSerialization(_) => {
                ErrorKind::Protocol
            }
        }
    }

    /// Whether a caller could reasonably try the operation again.
    ///
    /// Nothing in nodectl retries on its own; this only informs callers that
    /// implement their own retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodectlError::Connection(_)
                | NodectlError::Transport(_)
                | NodectlError::Io(_)
                | NodectlError::Timeout(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodectlError::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Transport => "transport",
            ErrorKind::Handler => "handler",
            ErrorKind::Remote => "remote",
            ErrorKind::RegistryInvariant => "registry invariant",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, NodectlError>;
