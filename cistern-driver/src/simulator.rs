//! Simulated apparatus controllers
//!
//! Devices that live on a [`LocalBroker`] and speak the same protocol as the
//! hardware: they announce on `<id>/announce` when the search command is
//! broadcast and answer `GetConfig`, `GetStatus` and `Switch.Set` on
//! `<id>/rpc`. Used by the demo node and by tests in place of real devices.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cistern_core::{
    rpc_topic, BrokerClient, ErrorBody, InboundMessage, LocalBroker, MessageHandler, RequestFrame,
    ResponseFrame, Transport, TransportError,
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::protocol::{methods, Announcement, ComponentKind, SwitchSetParams, SwitchSetResult, SEARCH_COMMAND};

/// Error code for an unknown method
pub const ERR_NO_HANDLER: i64 = 404;
/// Error code for bad params
pub const ERR_INVALID_ARGUMENT: i64 = -103;

/// Blueprint of a simulated device
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub id: String,
    pub model: String,
    pub name: Option<String>,
    /// One entry per switch, with its optional name
    pub switches: Vec<Option<String>>,
    pub sensors: Vec<(ComponentKind, Option<String>)>,
    /// Base delay before every reply
    pub reply_delay: Duration,
    /// Extra random delay, up to this much
    pub jitter: Duration,
    /// Never answer RPCs (still announces)
    pub silent: bool,
    /// Answer GetConfig with a device-side error
    pub reject_config: bool,
}

impl DeviceSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: "CST-PLUS-1".to_string(),
            name: None,
            switches: Vec::new(),
            sensors: Vec::new(),
            reply_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            silent: false,
            reject_config: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_switch(mut self, name: Option<&str>) -> Self {
        self.switches.push(name.map(String::from));
        self
    }

    pub fn with_sensor(mut self, kind: ComponentKind, name: Option<&str>) -> Self {
        self.sensors.push((kind, name.map(String::from)));
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn rejecting_config(mut self) -> Self {
        self.reject_config = true;
        self
    }

    /// Announcement payload for this device
    pub fn announcement(&self) -> Announcement {
        Announcement {
            id: self.id.clone(),
            model: Some(self.model.clone()),
            mac: Some(format!("{:012X}", fnv1a(&self.id) & 0xFFFF_FFFF_FFFF)),
            fw_id: Some("20240101-000000/1.0.0".to_string()),
            ver: Some("1.0.0".to_string()),
            app: Some(self.model.clone()),
            name: self.name.clone(),
        }
    }

    /// `GetConfig` result for this device
    pub fn config(&self) -> Value {
        let mut config = Map::new();
        config.insert(
            "sys".to_string(),
            json!({"device": {"name": self.name, "mac": self.announcement().mac}}),
        );

        for (i, name) in self.switches.iter().enumerate() {
            config.insert(format!("switch:{}", i), json!({"id": i, "name": name}));
        }

        // Sensor indices count per kind, like the hardware does
        let mut per_kind: BTreeMap<ComponentKind, u32> = BTreeMap::new();
        for (kind, name) in &self.sensors {
            let index = *per_kind.entry(*kind).and_modify(|n| *n += 1).or_insert(0);
            config.insert(format!("{}:{}", kind, index), json!({"id": index, "name": name}));
        }

        Value::Object(config)
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Request counters shared by a fleet
#[derive(Debug, Default)]
pub struct FleetStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    requests: AtomicUsize,
}

impl FleetStats {
    /// Highest number of requests being served at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Requests received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One running simulated device
pub struct SimulatedDevice {
    spec: DeviceSpec,
    client: BrokerClient,
    switches: Mutex<Vec<bool>>,
    stats: Arc<FleetStats>,
}

impl SimulatedDevice {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Current output state of a switch
    pub fn switch_state(&self, id: u32) -> Option<bool> {
        self.switches.lock().get(id as usize).copied()
    }

    /// Publish this device's announcement now
    pub async fn announce(&self) -> Result<(), TransportError> {
        let payload = self
            .spec
            .announcement()
            .to_bytes()
            .map_err(|e| TransportError::PublishFailed {
                topic: format!("{}/announce", self.spec.id),
                reason: e.to_string(),
            })?;
        self.client
            .publish(&format!("{}/announce", self.spec.id), payload)
            .await
    }

    /// Leave the broker
    pub fn power_off(&self) {
        self.client.disconnect();
    }

    async fn serve(&self, msg: InboundMessage) {
        let req = match RequestFrame::from_bytes(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!("Sim {}: bad request: {}", self.spec.id, e);
                return;
            }
        };

        self.stats.enter();

        let jitter_ms = self.spec.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(self.spec.reply_delay + extra).await;

        let response = if self.spec.silent {
            None
        } else {
            Some(self.respond(&req))
        };

        self.stats.leave();

        let Some(response) = response else {
            debug!("Sim {}: ignoring {} (silent)", self.spec.id, req.method);
            return;
        };

        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Sim {}: failed to encode reply: {}", self.spec.id, e);
                return;
            }
        };

        if let Err(e) = self.client.publish(&rpc_topic(&req.src), bytes).await {
            warn!("Sim {}: reply to {} failed: {}", self.spec.id, req.src, e);
        }
    }

    fn respond(&self, req: &RequestFrame) -> ResponseFrame {
        let id = self.spec.id.clone();
        let dst = Some(req.src.clone());

        let fail = |code, message: &str| {
            ResponseFrame::failure(
                req.id,
                id.clone(),
                dst.clone(),
                ErrorBody {
                    code,
                    message: message.to_string(),
                },
            )
        };

        match req.method.as_str() {
            methods::GET_CONFIG if self.spec.reject_config => {
                fail(ERR_INVALID_ARGUMENT, "config unavailable")
            }
            methods::GET_CONFIG => ResponseFrame::success(req.id, id.clone(), dst.clone(), self.spec.config()),
            methods::GET_STATUS => {
                let switches = self.switches.lock().clone();
                let status: Map<String, Value> = switches
                    .iter()
                    .enumerate()
                    .map(|(i, on)| (format!("switch:{}", i), json!({"id": i, "output": on})))
                    .collect();
                ResponseFrame::success(req.id, id.clone(), dst.clone(), Value::Object(status))
            }
            methods::SWITCH_SET => {
                let params: SwitchSetParams = match serde_json::from_value(req.params.clone()) {
                    Ok(p) => p,
                    Err(e) => return fail(ERR_INVALID_ARGUMENT, &e.to_string()),
                };
                let mut switches = self.switches.lock();
                match switches.get_mut(params.id as usize) {
                    Some(state) => {
                        let was_on = std::mem::replace(state, params.on);
                        match serde_json::to_value(SwitchSetResult { was_on }) {
                            Ok(result) => ResponseFrame::success(req.id, id.clone(), dst.clone(), result),
                            Err(e) => fail(ERR_INVALID_ARGUMENT, &e.to_string()),
                        }
                    }
                    None => fail(ERR_INVALID_ARGUMENT, "no such switch"),
                }
            }
            _ => fail(ERR_NO_HANDLER, "No handler for method"),
        }
    }
}

/// A set of simulated devices on one broker
pub struct Fleet {
    broker: LocalBroker,
    command_topic: String,
    devices: Vec<Arc<SimulatedDevice>>,
    stats: Arc<FleetStats>,
}

impl Fleet {
    /// Devices respond to the search command on `command_topic`
    pub fn new(broker: LocalBroker, command_topic: impl Into<String>) -> Self {
        Self {
            broker,
            command_topic: command_topic.into(),
            devices: Vec::new(),
            stats: Arc::new(FleetStats::default()),
        }
    }

    pub fn stats(&self) -> &FleetStats {
        &self.stats
    }

    pub fn devices(&self) -> &[Arc<SimulatedDevice>] {
        &self.devices
    }

    pub fn device(&self, id: &str) -> Option<&Arc<SimulatedDevice>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// Bring a device online
    pub async fn spawn(&mut self, spec: DeviceSpec) -> Result<Arc<SimulatedDevice>, TransportError> {
        let device = Arc::new(SimulatedDevice {
            client: self.broker.client(spec.id.clone()),
            switches: Mutex::new(vec![false; spec.switches.len()]),
            stats: self.stats.clone(),
            spec,
        });

        device
            .client
            .subscribe(&rpc_topic(device.id()), rpc_handler(Arc::downgrade(&device)))
            .await?;
        device
            .client
            .subscribe(&self.command_topic, command_handler(Arc::downgrade(&device)))
            .await?;

        debug!("Sim {}: online", device.id());
        self.devices.push(device.clone());
        Ok(device)
    }
}

fn rpc_handler(device: Weak<SimulatedDevice>) -> MessageHandler {
    Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> {
        let device = device.clone();
        Box::pin(async move {
            if let Some(device) = device.upgrade() {
                device.serve(msg).await;
            }
        })
    })
}

fn command_handler(device: Weak<SimulatedDevice>) -> MessageHandler {
    Arc::new(move |msg: InboundMessage| -> BoxFuture<'static, ()> {
        let device = device.clone();
        Box::pin(async move {
            if msg.payload != SEARCH_COMMAND {
                return;
            }
            if let Some(device) = device.upgrade() {
                if let Err(e) = device.announce().await {
                    warn!("Sim {}: announce failed: {}", device.id(), e);
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceConfig;

    #[test]
    fn test_spec_config_shape() {
        let spec = DeviceSpec::new("tank-1")
            .with_name("Tank 1")
            .with_switch(Some("Inlet valve"))
            .with_switch(None)
            .with_sensor(ComponentKind::Temperature, Some("Water"))
            .with_sensor(ComponentKind::Temperature, None)
            .with_sensor(ComponentKind::Flood, None);

        let config: DeviceConfig = serde_json::from_value(spec.config()).unwrap();
        assert_eq!(config.device_name(), Some("Tank 1"));

        let components = config.components();
        let keys: Vec<String> = components
            .iter()
            .map(|c| format!("{}:{}", c.kind, c.index))
            .collect();
        assert_eq!(
            keys,
            vec!["switch:0", "switch:1", "temperature:0", "temperature:1", "flood:0"]
        );
    }

    #[test]
    fn test_switch_set_and_unknown_method() {
        let broker = LocalBroker::new();
        let device = SimulatedDevice {
            spec: DeviceSpec::new("pump-1").with_switch(None),
            client: broker.client("pump-1"),
            switches: Mutex::new(vec![false]),
            stats: Arc::new(FleetStats::default()),
        };

        let set = RequestFrame::new(1, methods::SWITCH_SET, json!({"id": 0, "on": true}), "cistern/b");
        let reply = device.respond(&set);
        assert_eq!(reply.result, Some(json!({"was_on": false})));
        assert_eq!(device.switch_state(0), Some(true));

        let bad = RequestFrame::new(2, methods::SWITCH_SET, json!({"id": 5, "on": true}), "cistern/b");
        assert_eq!(device.respond(&bad).error.map(|e| e.code), Some(ERR_INVALID_ARGUMENT));

        let unknown = RequestFrame::new(3, "Tank.Drain", Value::Null, "cistern/b");
        assert_eq!(device.respond(&unknown).error.map(|e| e.code), Some(ERR_NO_HANDLER));
    }
}
