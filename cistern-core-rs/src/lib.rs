//! Cistern Core Library
//!
//! Synchronous-looking RPC for embedded devices that are only reachable over
//! a publish/subscribe transport. Provides the wire frames, the transport
//! seam, an in-process broker and the request/response correlator.

pub mod types;
pub mod error;
pub mod transport;
pub mod broker;
pub mod rpc;

pub use types::*;
pub use error::{RpcError, TransportError};
pub use transport::{sync_handler, topic_matches, InboundMessage, MessageHandler, Transport};
pub use broker::{BrokerClient, LocalBroker};
pub use rpc::Correlator;

pub use tokio_util::sync::CancellationToken;
