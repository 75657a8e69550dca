//! Error types for transport and RPC correlation

use thiserror::Error;

/// Failures reported by a publish/subscribe transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
}

/// Failures of a single correlated round trip
///
/// Device-reported errors are not represented here: they travel inside the
/// decoded response.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Publish failed: {0}")]
    Publish(#[from] TransportError),

    #[error("Deadline exceeded waiting for response")]
    DeadlineExceeded,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Reply channel closed")]
    ReplyDropped,
}

impl RpcError {
    /// True for the deadline-exceeded condition
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::DeadlineExceeded)
    }

    /// True for the cancelled condition
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled)
    }
}
