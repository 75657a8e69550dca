//! In-process publish/subscribe broker
//!
//! Stand-in for an MQTT broker: clients share one [`LocalBroker`], each
//! client owns its subscriptions, and every matching delivery runs on its own
//! spawned task. That gives the same guarantees as a real broker, i.e. none
//! about ordering or which task a handler runs on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{topic_matches, validate_filter, InboundMessage, MessageHandler, Transport};

struct Subscription {
    client_id: u64,
    filter: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct BrokerInner {
    subscriptions: RwLock<Vec<Subscription>>,
    /// Topic filters for which publishes are rejected
    publish_failures: RwLock<Vec<String>>,
    next_client_id: AtomicU64,
    delivered: AtomicU64,
}

/// Shared in-process broker
#[derive(Clone, Default)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client
    pub fn client(&self, name: impl Into<String>) -> BrokerClient {
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        BrokerClient {
            id,
            name: name.into(),
            inner: self.inner.clone(),
            connected: AtomicBool::new(true),
        }
    }

    /// Reject every publish whose topic matches `filter`
    pub fn fail_publishes_to(&self, filter: impl Into<String>) {
        self.inner.publish_failures.write().push(filter.into());
    }

    /// Stop rejecting publishes
    pub fn clear_failures(&self) {
        self.inner.publish_failures.write().clear();
    }

    /// Number of live subscriptions across all clients
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Whether any client holds a subscription on exactly `filter`
    pub fn has_subscription(&self, filter: &str) -> bool {
        self.inner
            .subscriptions
            .read()
            .iter()
            .any(|s| s.filter == filter)
    }

    /// Total handler invocations scheduled so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }
}

/// One client session on a [`LocalBroker`]
pub struct BrokerClient {
    id: u64,
    name: String,
    inner: Arc<BrokerInner>,
    connected: AtomicBool,
}

impl BrokerClient {
    /// Client name given at connect time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop all subscriptions and refuse further operations
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inner
            .subscriptions
            .write()
            .retain(|s| s.client_id != self.id);
        debug!("Broker: client \"{}\" disconnected", self.name);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for BrokerClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_connected()?;

        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }

        if self
            .inner
            .publish_failures
            .read()
            .iter()
            .any(|f| topic_matches(f, topic))
        {
            warn!("Broker: rejecting publish from \"{}\" to {}", self.name, topic);
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "rejected by broker".to_string(),
            });
        }

        let handlers: Vec<MessageHandler> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
            .map(|s| s.handler.clone())
            .collect();

        trace!(
            "Broker: {} -> {} ({} bytes, {} subscribers)",
            self.name,
            topic,
            payload.len(),
            handlers.len()
        );

        for handler in handlers {
            let msg = InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(handler(msg));
        }

        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.ensure_connected()?;
        validate_filter(filter)?;

        let mut subs = self.inner.subscriptions.write();
        subs.retain(|s| !(s.client_id == self.id && s.filter == filter));
        subs.push(Subscription {
            client_id: self.id,
            filter: filter.to_string(),
            handler,
        });

        debug!("Broker: \"{}\" subscribed to {}", self.name, filter);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;

        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| !(s.client_id == self.id && s.filter == filter));

        if subs.len() < before {
            debug!("Broker: \"{}\" unsubscribed from {}", self.name, filter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sync_handler;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn forward(tx: mpsc::UnboundedSender<InboundMessage>) -> MessageHandler {
        sync_handler(move |msg| {
            let _ = tx.send(msg);
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = LocalBroker::new();
        let a = broker.client("a");
        let b = broker.client("b");

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(a.subscribe("+/announce", forward(tx)).await);

        assert_ok!(b.publish("tank-1/announce", b"{}".to_vec()).await);
        assert_ok!(b.publish("tank-1/rpc", b"{}".to_vec()).await);

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "tank-1/announce");

        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_per_client() {
        let broker = LocalBroker::new();
        let a = broker.client("a");
        let b = broker.client("b");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_ok!(a.subscribe("x/rpc", forward(tx.clone())).await);
        assert_ok!(b.subscribe("x/rpc", forward(tx)).await);
        assert_eq!(broker.subscription_count(), 2);

        assert_ok!(a.unsubscribe("x/rpc").await);
        assert_eq!(broker.subscription_count(), 1);
        assert!(broker.has_subscription("x/rpc"));

        b.disconnect();
        assert_eq!(broker.subscription_count(), 0);
        assert!(matches!(
            b.publish("x/rpc", vec![]).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let broker = LocalBroker::new();
        let a = broker.client("a");

        broker.fail_publishes_to("pump-9/#");
        assert_err!(a.publish("pump-9/rpc", vec![1]).await);
        assert_ok!(a.publish("pump-8/rpc", vec![1]).await);

        broker.clear_failures();
        assert_ok!(a.publish("pump-9/rpc", vec![1]).await);
        assert_err!(a.publish("pump-9/+", vec![1]).await);
    }
}
