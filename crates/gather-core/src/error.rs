use std::io;

use thiserror::Error;

/// The execution context could not be created. Fatal for the whole run.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("insufficient privilege: {0}")]
    Forbidden(String),

    #[error("collection image could not be pulled: {0}")]
    ImagePull(String),

    #[error("resource quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("workload did not become ready: {0}")]
    NotReady(String),

    #[error("invalid gather request: {0}")]
    InvalidRequest(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LaunchError {
    /// Classify a backend failure message (typically CLI stderr) into a launch error kind.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        // Quota rejections are reported as "forbidden: exceeded quota", so test them first.
        if lower.contains("exceeded quota") || lower.contains("exceeds quota") {
            LaunchError::QuotaExceeded(message.trim().to_string())
        } else if lower.contains("forbidden") || lower.contains("unauthorized") {
            LaunchError::Forbidden(message.trim().to_string())
        } else if lower.contains("errimagepull")
            || lower.contains("imagepullbackoff")
            || lower.contains("invalidimagename")
        {
            LaunchError::ImagePull(message.trim().to_string())
        } else {
            LaunchError::Backend(message.trim().to_string())
        }
    }
}

/// Failure reading from the Transfer Channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A read failed in a way that may succeed when retried.
    #[error("transient channel read failure: {0}")]
    Transient(#[source] io::Error),

    /// The stream ended while a record was still in flight.
    #[error("channel closed before the record was complete")]
    Closed,

    /// The peer sent bytes that do not follow the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(io::Error),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset => ChannelError::Transient(e),
            io::ErrorKind::UnexpectedEof => ChannelError::Closed,
            io::ErrorKind::InvalidData => ChannelError::Protocol(e.to_string()),
            _ => ChannelError::Io(e),
        }
    }
}

/// One file could not be copied to the destination. Never aborts other files.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transfer of '{path}' failed: {reason}")]
pub struct TransferError {
    pub path: String,
    pub reason: String,
}

impl TransferError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
