//! Time-boxed device discovery
//!
//! One call to [`Discoverer::discover_devices`] is one session:
//!
//! ```text
//!  subscribe(announce) ─► publish(search) ─► window ─► stop ─► unsubscribe ─► drain
//!        │
//!        ▼ handler (transport tasks)
//!   parse ─► stopped? ─► intake queue ─► dispatcher ─► semaphore(W) ─► probe worker
//!                                                                        │
//!                                         GetConfig ─► descriptor ─► create_device
//! ```
//!
//! Subscribing happens before the search broadcast so that no announcement
//! triggered by it can be missed. The cutoff at the end of the window is best
//! effort: the transport may still be delivering announcements while the stop
//! flag is set, and those are dropped.
//!
//! Per-device failures are logged and counted; only subscribe/broadcast
//! failures and cancellation end the session with an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cistern_core::{CancellationToken, Correlator, InboundMessage, MessageHandler, ResponseFrame, Transport};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::descriptor::build_descriptor;
use crate::error::DiscoveryError;
use crate::protocol::{methods, Announcement, DeviceConfig, SEARCH_COMMAND};
use crate::storage::{DeviceStore, StoreError};

/// Per-invocation overrides of the configured discovery settings
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub window: Option<Duration>,
    pub probe_timeout: Option<Duration>,
}

/// Outcome of one discovery session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryResult {
    /// Canonical tags of devices newly persisted by this session
    pub discovered_tags: Vec<String>,
    /// Announcements accepted into the session
    pub announcements: usize,
    /// Devices storage already knew
    pub already_known: usize,
    /// Devices abandoned after a probe or storage failure
    pub failed: usize,
}

/// State shared by the handler, dispatcher and workers of one session
struct Session {
    stopped: AtomicBool,
    intake: Mutex<Option<mpsc::Sender<Announcement>>>,
    result: Mutex<DiscoveryResult>,
}

impl Session {
    fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Announcement>) {
        let (tx, rx) = mpsc::channel(buffer);
        let session = Arc::new(Self {
            stopped: AtomicBool::new(false),
            intake: Mutex::new(Some(tx)),
            result: Mutex::new(DiscoveryResult::default()),
        });
        (session, rx)
    }

    /// Parse an announcement and decide whether it enters the session
    fn admit(&self, msg: &InboundMessage) -> Option<(Announcement, mpsc::Sender<Announcement>)> {
        let announcement = match Announcement::from_bytes(&msg.payload) {
            Ok(a) => a,
            Err(e) => {
                warn!("Discovery: dropping malformed announcement on {}: {}", msg.topic, e);
                return None;
            }
        };

        if self.stopped.load(Ordering::SeqCst) {
            warn!(
                "Discovery: announcement from \"{}\" arrived after the window closed",
                announcement.id
            );
            return None;
        }

        let intake = self.intake.lock().clone()?;
        self.result.lock().announcements += 1;
        Some((announcement, intake))
    }

    /// Announce-topic handler; waits for queue capacity when the queue is full
    fn handler(self: &Arc<Self>) -> MessageHandler {
        let session = self.clone();
        Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> {
            let admitted = session.admit(&msg);
            Box::pin(async move {
                if let Some((announcement, intake)) = admitted {
                    debug!("Discovery: queued announcement from \"{}\"", announcement.id);
                    if intake.send(announcement).await.is_err() {
                        warn!("Discovery: intake closed, announcement dropped");
                    }
                }
            })
        })
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Drop the session's sender; the dispatcher ends once in-flight handlers finish
    fn close(&self) {
        self.intake.lock().take();
    }

    fn record_discovered(&self, tag: String) {
        self.result.lock().discovered_tags.push(tag);
    }

    fn record_known(&self) {
        self.result.lock().already_known += 1;
    }

    fn record_failed(&self) {
        self.result.lock().failed += 1;
    }

    fn snapshot(&self) -> DiscoveryResult {
        self.result.lock().clone()
    }
}

/// Everything a probe worker needs
struct Probe {
    correlator: Arc<Correlator>,
    store: Arc<dyn DeviceStore>,
    driver_name: String,
    timeout: Duration,
    session: Arc<Session>,
    ctx: CancellationToken,
}

impl Probe {
    async fn run(&self, announcement: Announcement) {
        let id = announcement.id.clone();

        let reply: ResponseFrame<DeviceConfig> = match self
            .correlator
            .round_trip(&self.ctx, &id, methods::GET_CONFIG, (), self.timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Discovery: GetConfig to \"{}\" failed: {}", id, e);
                self.session.record_failed();
                return;
            }
        };

        let config = match reply.into_result() {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("Discovery: \"{}\" returned an empty config", id);
                self.session.record_failed();
                return;
            }
            Err(e) => {
                warn!("Discovery: \"{}\" rejected GetConfig: {}", id, e);
                self.session.record_failed();
                return;
            }
        };

        let descriptor = build_descriptor(&self.driver_name, &announcement, &config);
        let tag = descriptor.canonical_tag();

        match self.store.create_device(&descriptor).await {
            Ok(()) => {
                info!(
                    "Discovery: persisted {} ({} actuators, {} sensors)",
                    tag,
                    descriptor.actuators.len(),
                    descriptor.sensors.len()
                );
                self.session.record_discovered(tag);
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!("Discovery: {} already known", tag);
                self.session.record_known();
            }
            Err(e) => {
                error!("Discovery: failed to persist {}: {}", tag, e);
                self.session.record_failed();
            }
        }
    }
}

/// Drain the intake queue, keeping at most `limit` probes in flight
async fn dispatch(mut intake: mpsc::Receiver<Announcement>, limit: Arc<Semaphore>, probe: Arc<Probe>) {
    let mut workers = JoinSet::new();

    while let Some(announcement) = intake.recv().await {
        reap_finished(&mut workers);

        let permit: OwnedSemaphorePermit = match limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let probe = probe.clone();
        workers.spawn(async move {
            probe.run(announcement).await;
            drop(permit);
        });
    }

    while let Some(joined) = workers.join_next().await {
        report_worker(joined);
    }
}

/// Collect probes that already finished; returns how many were reaped
fn reap_finished(workers: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = workers.try_join_next() {
        report_worker(joined);
        reaped += 1;
    }
    reaped
}

fn report_worker(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Discovery: probe worker failed: {}", e);
    }
}

/// Runs discovery sessions against one transport and store
pub struct Discoverer {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    store: Arc<dyn DeviceStore>,
    driver_name: String,
    announce_topic: String,
    command_topic: String,
    config: DiscoveryConfig,
}

impl Discoverer {
    pub fn new(
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        store: Arc<dyn DeviceStore>,
        driver_name: impl Into<String>,
        announce_topic: impl Into<String>,
        command_topic: impl Into<String>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            transport,
            correlator,
            store,
            driver_name: driver_name.into(),
            announce_topic: announce_topic.into(),
            command_topic: command_topic.into(),
            config,
        }
    }

    /// Run one discovery session
    ///
    /// Returns the tags of devices newly persisted during this call. On
    /// cancellation the call returns [`DiscoveryError::Cancelled`] after at
    /// most the configured grace period, without waiting for remaining
    /// probes; they observe the same cancelled token and wind down on their
    /// own.
    pub async fn discover_devices(
        &self,
        ctx: &CancellationToken,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        self.config.validate()?;

        let window = options.window.unwrap_or(self.config.window);
        let probe_timeout = options.probe_timeout.unwrap_or(self.config.probe_timeout);

        let (session, intake) = Session::new(self.config.buffer);

        self.transport
            .subscribe(&self.announce_topic, session.handler())
            .await
            .map_err(DiscoveryError::Subscribe)?;

        let probe = Arc::new(Probe {
            correlator: self.correlator.clone(),
            store: self.store.clone(),
            driver_name: self.driver_name.clone(),
            timeout: probe_timeout,
            session: session.clone(),
            ctx: ctx.clone(),
        });
        let limit = Arc::new(Semaphore::new(self.config.workers));
        let dispatcher = tokio::spawn(dispatch(intake, limit, probe));

        if let Err(e) = self
            .transport
            .publish(&self.command_topic, SEARCH_COMMAND.to_vec())
            .await
        {
            error!("Discovery: search broadcast on {} failed: {}", self.command_topic, e);
            self.end_session(&session).await;
            if let Err(join_err) = dispatcher.await {
                error!("Discovery: dispatcher failed: {}", join_err);
            }
            return Err(DiscoveryError::Broadcast(e));
        }

        info!(
            "Discovery: search sent on {}, listening on {} for {:?}",
            self.command_topic, self.announce_topic, window
        );

        let cancelled = tokio::select! {
            _ = ctx.cancelled() => true,
            _ = tokio::time::sleep(window) => false,
        };

        self.end_session(&session).await;

        if cancelled {
            let grace = self.config.cancel_grace;
            if !grace.is_zero() && tokio::time::timeout(grace, dispatcher).await.is_err() {
                warn!("Discovery: probes still running after {:?} grace", grace);
            }
            warn!("Discovery: session cancelled");
            return Err(DiscoveryError::Cancelled);
        }

        if let Err(e) = dispatcher.await {
            error!("Discovery: dispatcher failed: {}", e);
        }

        let result = session.snapshot();
        info!(
            "Discovery: {} announced, {} new, {} known, {} failed",
            result.announcements,
            result.discovered_tags.len(),
            result.already_known,
            result.failed
        );

        Ok(result)
    }

    /// Stop accepting announcements and release the subscription
    async fn end_session(&self, session: &Session) {
        session.stop();

        if let Err(e) = self.transport.unsubscribe(&self.announce_topic).await {
            warn!("Discovery: unsubscribe from {} failed: {}", self.announce_topic, e);
        }

        session.close();
    }
}
