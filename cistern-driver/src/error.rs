//! Driver-level error types

use cistern_core::{ErrorBody, RpcError, TransportError};
use thiserror::Error;

/// Invalid driver configuration
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Client name must be configured")]
    MissingClientName,

    #[error("Client name may not contain topic separators or wildcards: {0}")]
    InvalidClientName(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Session-fatal discovery failures
///
/// Per-device failures never surface here; they are logged and counted in
/// the result.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to subscribe to announcements: {0}")]
    Subscribe(#[source] TransportError),

    #[error("Failed to broadcast search command: {0}")]
    Broadcast(#[source] TransportError),

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("Invalid discovery settings: {0}")]
    Config(#[from] ConfigError),
}

/// Errors returned by [`crate::Driver`] operations
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Device reported error: {0}")]
    Device(ErrorBody),

    #[error("Device returned an empty result")]
    EmptyResult,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Operation cancelled")]
    Cancelled,
}
