//! Request/response correlation over a publish/subscribe transport
//!
//! Each call gets a fresh id and a oneshot slot in the routing table. The
//! request goes out on `<destination>/rpc`; replies come back on this
//! correlator's inbox (`<reply_to>/rpc`) where [`Correlator::handle_message`]
//! looks the id up and hands the raw payload to whoever is waiting.
//!
//! The routing table is the only state shared between callers. It is guarded
//! by one mutex whose critical sections are single map operations, never held
//! across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::transport::{sync_handler, InboundMessage, MessageHandler, Transport};
use crate::types::{rpc_topic, RequestFrame, RequestId, ResponseFrame};

type RoutingTable = Mutex<HashMap<RequestId, oneshot::Sender<Vec<u8>>>>;

/// Removes a routing entry when the owning call ends, however it ends
struct RouteGuard<'a> {
    routes: &'a RoutingTable,
    id: RequestId,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        if self.routes.lock().remove(&self.id).is_some() {
            debug!("RPC: released route id={} without a reply", self.id);
        }
    }
}

/// Emulates synchronous RPC on top of a [`Transport`]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    /// Value of `src` in outgoing requests
    reply_to: String,
    next_id: AtomicU64,
    routes: RoutingTable,
}

impl Correlator {
    /// Create a correlator whose replies arrive on `<reply_to>/rpc`
    pub fn new(transport: Arc<dyn Transport>, reply_to: impl Into<String>) -> Self {
        Self {
            transport,
            reply_to: reply_to.into(),
            next_id: AtomicU64::new(0),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Source address stamped on requests
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Topic replies are expected on
    pub fn inbox_topic(&self) -> String {
        rpc_topic(&self.reply_to)
    }

    /// Number of calls currently waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.routes.lock().len()
    }

    /// Handler to subscribe on [`Correlator::inbox_topic`]
    ///
    /// Holds only a weak reference so the subscription does not keep the
    /// correlator alive.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let correlator: Weak<Self> = Arc::downgrade(self);
        sync_handler(move |msg| {
            if let Some(correlator) = correlator.upgrade() {
                correlator.handle_message(&msg);
            }
        })
    }

    fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Pick an id not currently outstanding and install its reply slot
    fn register(&self) -> (RequestId, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        let mut routes = self.routes.lock();

        let mut id = self.allocate_id();
        while routes.contains_key(&id) {
            id = self.allocate_id();
        }
        routes.insert(id, tx);

        (id, rx)
    }

    /// Send `method` to `destination` and wait for the correlated reply
    ///
    /// The raw reply is decoded into `R` as a whole, so device-reported
    /// errors land in `R` (typically a [`ResponseFrame`]) rather than in the
    /// returned error. A zero `timeout` means no deadline beyond `ctx`.
    pub async fn round_trip<P, R>(
        &self,
        ctx: &CancellationToken,
        destination: &str,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(RpcError::Encode)?;

        let (id, reply_rx) = self.register();
        let _route = RouteGuard {
            routes: &self.routes,
            id,
        };

        let frame = RequestFrame::new(id, method, params, self.reply_to.as_str());
        let bytes = frame.to_bytes().map_err(RpcError::Encode)?;

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let topic = rpc_topic(destination);

        debug!("RPC: -> {} {} (id={})", destination, method, id);

        bounded(ctx, deadline, self.transport.publish(&topic, bytes)).await??;

        let raw = match bounded(ctx, deadline, reply_rx).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => return Err(RpcError::ReplyDropped),
            Err(e) => {
                debug!("RPC: {} {} (id={}) ended: {}", destination, method, id, e);
                return Err(e);
            }
        };

        debug!("RPC: <- {} {} (id={}, {} bytes)", destination, method, id, raw.len());

        serde_json::from_slice(&raw).map_err(RpcError::Decode)
    }

    /// Route one inbound reply to its waiting call
    ///
    /// Malformed frames and unknown ids are dropped; nothing here can fail
    /// the caller that delivered the message.
    pub fn handle_message(&self, msg: &InboundMessage) {
        let header: ResponseFrame<IgnoredAny> = match serde_json::from_slice(&msg.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("RPC: dropping malformed response on {}: {}", msg.topic, e);
                return;
            }
        };

        let route = self.routes.lock().remove(&header.id);

        match route {
            Some(reply_tx) => {
                if reply_tx.send(msg.payload.clone()).is_err() {
                    debug!("RPC: caller for id={} went away", header.id);
                }
            }
            None => {
                debug!(
                    "RPC: no pending request for id={} (from {})",
                    header.id, header.src
                );
            }
        }
    }
}

/// Race `fut` against cancellation and an optional deadline
async fn bounded<F: Future>(
    ctx: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, RpcError> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(RpcError::Cancelled),
        _ = expiry => Err(RpcError::DeadlineExceeded),
        out = fut => Ok(out),
    }
}
