//! Device control protocol
//!
//! Payloads exchanged with apparatus controllers:
//! - announcements published on `<device_id>/announce`
//! - `GetConfig`, `GetStatus` and `Switch.Set` RPC methods
//!
//! A `GetConfig` result is a flat object of components keyed `<kind>:<n>`
//! (`switch:0`, `temperature:1`, ...) plus an optional `sys` section.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// RPC method names understood by devices
pub mod methods {
    pub const GET_CONFIG: &str = "GetConfig";
    pub const GET_STATUS: &str = "GetStatus";
    pub const SWITCH_SET: &str = "Switch.Set";
}

/// Payload of the broadcast search command
pub const SEARCH_COMMAND: &[u8] = b"search";

/// Unsolicited device announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Device id; also its RPC address
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Announcement {
    /// Minimal announcement for a device id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: None,
            mac: None,
            fw_id: None,
            ver: None,
            app: None,
            name: None,
        }
    }

    /// Serialize announcement to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize announcement from JSON bytes; the id must be non-empty
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let announcement: Self = serde_json::from_slice(bytes)?;
        if announcement.id.is_empty() {
            return Err(serde::de::Error::custom("announcement without device id"));
        }
        Ok(announcement)
    }
}

/// Kinds of device components the backend models
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Switch,
    Relay,
    Temperature,
    Humidity,
    Flood,
    Voltmeter,
}

impl ComponentKind {
    /// Component key prefix as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Switch => "switch",
            ComponentKind::Relay => "relay",
            ComponentKind::Temperature => "temperature",
            ComponentKind::Humidity => "humidity",
            ComponentKind::Flood => "flood",
            ComponentKind::Voltmeter => "voltmeter",
        }
    }

    /// Switches and relays can be commanded; everything else is read-only
    pub fn is_actuator(&self) -> bool {
        matches!(self, ComponentKind::Switch | ComponentKind::Relay)
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ComponentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(ComponentKind::Switch),
            "relay" => Ok(ComponentKind::Relay),
            "temperature" => Ok(ComponentKind::Temperature),
            "humidity" => Ok(ComponentKind::Humidity),
            "flood" => Ok(ComponentKind::Flood),
            "voltmeter" => Ok(ComponentKind::Voltmeter),
            _ => Err(()),
        }
    }
}

/// `sys.device` section of a device config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_id: Option<String>,
}

/// `sys` section of a device config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysConfig {
    #[serde(default)]
    pub device: SysDevice,
}

/// Per-component settings common to every kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One recognised component of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub kind: ComponentKind,
    pub index: u32,
    pub name: Option<String>,
}

/// Result of `GetConfig`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys: Option<SysConfig>,

    /// Remaining keys, `<kind>:<n>` for components
    #[serde(flatten)]
    pub components: BTreeMap<String, Value>,
}

impl DeviceConfig {
    /// Name the device reports for itself, if any
    pub fn device_name(&self) -> Option<&str> {
        self.sys
            .as_ref()
            .and_then(|s| s.device.name.as_deref())
            .filter(|n| !n.trim().is_empty())
    }

    /// Recognised components ordered by kind, then index
    ///
    /// Unknown kinds and malformed entries are skipped.
    pub fn components(&self) -> Vec<Component> {
        let mut found: Vec<Component> = self
            .components
            .iter()
            .filter_map(|(key, value)| {
                let (prefix, index) = key.split_once(':')?;
                let kind: ComponentKind = prefix.parse().ok()?;
                let index: u32 = index.parse().ok()?;

                let config: ComponentConfig = match serde_json::from_value(value.clone()) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("Ignoring malformed component {}: {}", key, e);
                        return None;
                    }
                };

                Some(Component {
                    kind,
                    index,
                    name: config.name.filter(|n| !n.trim().is_empty()),
                })
            })
            .collect();

        found.sort_by_key(|c| (c.kind, c.index));
        found
    }
}

/// Params for `Switch.Set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchSetParams {
    pub id: u32,
    pub on: bool,
}

/// Result of `Switch.Set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchSetResult {
    pub was_on: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_announcement_parsing() {
        let a = Announcement::from_bytes(
            br#"{"id":"pump-a1","model":"SNSW-102","mac":"A8032AB1","ver":"1.0.3","extra":1}"#,
        )
        .unwrap();
        assert_eq!(a.id, "pump-a1");
        assert_eq!(a.model.as_deref(), Some("SNSW-102"));
        assert!(a.name.is_none());

        assert!(Announcement::from_bytes(br#"{"id":""}"#).is_err());
        assert!(Announcement::from_bytes(br#"{"model":"x"}"#).is_err());
        assert!(Announcement::from_bytes(b"online").is_err());
    }

    #[test]
    fn test_config_components() {
        let config: DeviceConfig = serde_json::from_value(json!({
            "sys": {"device": {"name": "Tank 3 controller", "mac": "A8032AB1"}},
            "switch:1": {"id": 1, "name": null},
            "switch:0": {"id": 0, "name": "Feed pump"},
            "temperature:0": {"id": 0, "name": "Tank water"},
            "wifi": {"sta": {"ssid": "plant"}},
            "relay:x": {},
            "humidity:0": "broken"
        }))
        .unwrap();

        assert_eq!(config.device_name(), Some("Tank 3 controller"));

        let components = config.components();
        assert_eq!(components.len(), 3);
        assert_eq!(components[0].kind, ComponentKind::Switch);
        assert_eq!(components[0].index, 0);
        assert_eq!(components[0].name.as_deref(), Some("Feed pump"));
        assert_eq!(components[1].index, 1);
        assert!(components[1].name.is_none());
        assert_eq!(components[2].kind, ComponentKind::Temperature);
    }
}
