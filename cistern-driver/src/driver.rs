//! Driver lifecycle
//!
//! The [`Driver`] owns the correlator and the discoverer for one client
//! identity. [`Driver::start`] subscribes the inbox every reply arrives on;
//! [`Driver::stop`] releases it. Callers quiesce outstanding calls and
//! discovery sessions before stopping.

use std::future::Future;
use std::sync::Arc;

use cistern_core::{CancellationToken, Correlator, ResponseFrame, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::discovery::{Discoverer, DiscoveryOptions, DiscoveryResult};
use crate::error::DriverError;
use crate::protocol::{methods, SwitchSetParams, SwitchSetResult};
use crate::storage::DeviceStore;

/// Device driver bound to one transport, store and client identity
pub struct Driver {
    config: DriverConfig,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    discoverer: Discoverer,
}

impl Driver {
    /// Create a driver; nothing touches the transport until [`Driver::start`]
    pub fn new(config: DriverConfig, transport: Arc<dyn Transport>, store: Arc<dyn DeviceStore>) -> Self {
        let correlator = Arc::new(Correlator::new(transport.clone(), config.reply_to()));

        let discoverer = Discoverer::new(
            transport.clone(),
            correlator.clone(),
            store,
            config.driver_name.clone(),
            config.topics.announce.clone(),
            config.topics.command_topic(),
            config.discovery.clone(),
        );

        Self {
            config,
            transport,
            correlator,
            discoverer,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Validate the configuration and subscribe the RPC inbox
    pub async fn start(&self, ctx: &CancellationToken) -> Result<(), DriverError> {
        self.config.validate()?;

        let inbox = self.correlator.inbox_topic();
        let handler = self.correlator.handler();
        until_cancelled(ctx, self.transport.subscribe(&inbox, handler)).await??;

        info!(
            "Driver: started as \"{}\", inbox {}",
            self.config.client_name, inbox
        );
        Ok(())
    }

    /// Unsubscribe the RPC inbox
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<(), DriverError> {
        let inbox = self.correlator.inbox_topic();
        until_cancelled(ctx, self.transport.unsubscribe(&inbox)).await??;

        let pending = self.correlator.pending_count();
        if pending > 0 {
            debug!("Driver: stopped with {} calls still pending", pending);
        }
        info!("Driver: stopped \"{}\"", self.config.client_name);
        Ok(())
    }

    /// Run one discovery session
    pub async fn discover_devices(
        &self,
        ctx: &CancellationToken,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryResult, DriverError> {
        Ok(self.discoverer.discover_devices(ctx, options).await?)
    }

    /// Call `method` on `device` and return its decoded result
    ///
    /// Device-reported errors become [`DriverError::Device`]; a reply with
    /// neither result nor error becomes [`DriverError::EmptyResult`].
    pub async fn call<P, R>(
        &self,
        ctx: &CancellationToken,
        device: &str,
        method: &str,
        params: P,
    ) -> Result<R, DriverError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let reply: ResponseFrame<R> = self
            .correlator
            .round_trip(ctx, device, method, params, self.config.rpc_timeout)
            .await?;

        match reply.into_result() {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(DriverError::EmptyResult),
            Err(body) => {
                debug!("Driver: {} on {} failed: {}", method, device, body);
                Err(DriverError::Device(body))
            }
        }
    }

    /// Raw `GetStatus` of a device
    pub async fn get_status(&self, ctx: &CancellationToken, device: &str) -> Result<Value, DriverError> {
        self.call(ctx, device, methods::GET_STATUS, ()).await
    }

    /// Turn a switch on or off
    pub async fn set_switch(
        &self,
        ctx: &CancellationToken,
        device: &str,
        id: u32,
        on: bool,
    ) -> Result<SwitchSetResult, DriverError> {
        let result: SwitchSetResult = self
            .call(ctx, device, methods::SWITCH_SET, SwitchSetParams { id, on })
            .await?;

        info!(
            "Driver: {} switch {} -> {} (was {})",
            device,
            id,
            if on { "on" } else { "off" },
            if result.was_on { "on" } else { "off" }
        );
        Ok(result)
    }
}

async fn until_cancelled<F: Future>(ctx: &CancellationToken, fut: F) -> Result<F::Output, DriverError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DriverError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::simulator::{DeviceSpec, Fleet, ERR_NO_HANDLER};
    use crate::storage::MemoryStore;
    use cistern_core::LocalBroker;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn driver(broker: &LocalBroker, config: DriverConfig) -> Driver {
        Driver::new(
            config,
            Arc::new(broker.client("backend")),
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_start_requires_client_name() {
        let broker = LocalBroker::new();
        let driver = driver(&broker, DriverConfig::default());

        let err = driver.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DriverError::Config(ConfigError::MissingClientName)));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_manage_inbox() {
        let broker = LocalBroker::new();
        let driver = driver(&broker, DriverConfig::new("backend"));
        let ctx = CancellationToken::new();

        assert_ok!(driver.start(&ctx).await);
        assert!(broker.has_subscription("cistern/backend/rpc"));

        assert_ok!(driver.stop(&ctx).await);
        assert!(!broker.has_subscription("cistern/backend/rpc"));
    }

    #[tokio::test]
    async fn test_start_with_cancelled_context() {
        let broker = LocalBroker::new();
        let driver = driver(&broker, DriverConfig::new("backend"));
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(matches!(driver.start(&ctx).await, Err(DriverError::Cancelled)));
    }

    #[tokio::test]
    async fn test_commands_against_simulated_device() {
        let broker = LocalBroker::new();
        let config = DriverConfig::new("backend").with_rpc_timeout(Duration::from_secs(1));
        let mut fleet = Fleet::new(broker.clone(), config.topics.command_topic());
        let pump = fleet
            .spawn(DeviceSpec::new("pump-1").with_switch(Some("Feed pump")))
            .await
            .unwrap();

        let driver = driver(&broker, config);
        let ctx = CancellationToken::new();
        driver.start(&ctx).await.unwrap();

        let result = driver.set_switch(&ctx, "pump-1", 0, true).await.unwrap();
        assert!(!result.was_on);
        assert_eq!(pump.switch_state(0), Some(true));

        let status = driver.get_status(&ctx, "pump-1").await.unwrap();
        assert_eq!(status["switch:0"]["output"], Value::Bool(true));

        let err = driver
            .call::<_, Value>(&ctx, "pump-1", "Tank.Drain", ())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Device(ref body) if body.code == ERR_NO_HANDLER));

        assert_eq!(driver.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let broker = LocalBroker::new();
        let config = DriverConfig::new("backend").with_rpc_timeout(Duration::from_millis(50));
        let mut fleet = Fleet::new(broker.clone(), config.topics.command_topic());
        fleet.spawn(DeviceSpec::new("pump-1").silent()).await.unwrap();

        let driver = driver(&broker, config);
        let ctx = CancellationToken::new();
        driver.start(&ctx).await.unwrap();

        let err = driver.get_status(&ctx, "pump-1").await.unwrap_err();
        assert!(matches!(err, DriverError::Rpc(ref e) if e.is_timeout()));
    }
}
