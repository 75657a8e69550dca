//! Publish/subscribe transport seam
//!
//! The correlator and discovery never talk to a broker directly; they go
//! through [`Transport`]. Handlers may be invoked concurrently, on any task,
//! with no ordering across topics.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::TransportError;

/// Message delivered to a subscription handler
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked for every message matching a subscription
///
/// The returned future is driven by the transport's delivery task, so a
/// handler that awaits (e.g. on a full queue) holds back only that delivery.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap a synchronous closure as a [`MessageHandler`]
pub fn sync_handler<F>(f: F) -> MessageHandler
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> {
        f(msg);
        Box::pin(async {})
    })
}

/// Publish/subscribe client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` on `topic`; resolves once the transport accepted it
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe `handler` to a topic filter
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError>;

    /// Remove the subscription for a topic filter
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;
}

/// Check a topic filter for misplaced wildcards
///
/// `+` must occupy a whole level; `#` must be the whole last level.
pub fn validate_filter(filter: &str) -> Result<(), TransportError> {
    if filter.is_empty() {
        return Err(TransportError::InvalidTopic(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let has_plus = level.contains('+');
        let has_hash = level.contains('#');

        if has_plus && *level != "+" {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        if has_hash && (*level != "#" || i != levels.len() - 1) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
    }

    Ok(())
}

/// MQTT-style topic filter matching (`+` one level, `#` the remainder)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("pump-1/rpc", "pump-1/rpc"));
        assert!(topic_matches("+/announce", "tank-7/announce"));
        assert!(!topic_matches("+/announce", "site/tank-7/announce"));
        assert!(topic_matches("cistern/#", "cistern/backend/rpc"));
        assert!(topic_matches("cistern/#", "cistern"));
        assert!(!topic_matches("cistern/+/rpc", "cistern/backend/events"));
        assert!(!topic_matches("pump-1/rpc", "pump-1"));
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("+/announce").is_ok());
        assert!(validate_filter("cistern/#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("cistern/#/rpc").is_err());
        assert!(validate_filter("pump+/rpc").is_err());
    }
}
