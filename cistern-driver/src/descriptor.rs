//! Device descriptors and tags
//!
//! Translates an announcement plus its `GetConfig` result into the
//! descriptor handed to storage.
//!
//! ## Tags
//!
//! | Entity   | Tag                          |
//! |----------|------------------------------|
//! | Device   | `device.{id}`                |
//! | Actuator | `device.{id}.actuator.{n}`   |
//! | Sensor   | `device.{id}.sensor.{n}`     |
//!
//! `{n}` is the component index the device reports.

use serde::{Deserialize, Serialize};

use crate::protocol::{Announcement, Component, ComponentKind, DeviceConfig};

/// Root segment of every device tag
pub const DEVICE_TAG_ROOT: &str = "device";

/// Canonical tag of a device
pub fn device_tag(device_id: &str) -> String {
    format!("{}.{}", DEVICE_TAG_ROOT, device_id)
}

/// Tag of a device's actuator
pub fn actuator_tag(device_id: &str, index: u32) -> String {
    format!("{}.actuator.{}", device_tag(device_id), index)
}

/// Tag of a device's sensor
pub fn sensor_tag(device_id: &str, index: u32) -> String {
    format!("{}.sensor.{}", device_tag(device_id), index)
}

/// Commandable output of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ComponentKind,
    pub tags: Vec<String>,
}

/// Read-only input of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ComponentKind,
    pub tags: Vec<String>,
}

/// Device as persisted by storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub driver: String,
    pub name: String,
    pub description: String,
    pub actuators: Vec<ActuatorDescriptor>,
    pub sensors: Vec<SensorDescriptor>,
    /// Canonical tag first
    pub tags: Vec<String>,
}

impl DeviceDescriptor {
    /// `device.<id>`
    pub fn canonical_tag(&self) -> String {
        device_tag(&self.id)
    }

    /// Every tag on the device and its components
    pub fn all_tags(&self) -> impl Iterator<Item = &String> {
        self.tags
            .iter()
            .chain(self.actuators.iter().flat_map(|a| a.tags.iter()))
            .chain(self.sensors.iter().flat_map(|s| s.tags.iter()))
    }
}

/// Build the descriptor for an announced device
pub fn build_descriptor(
    driver: &str,
    announcement: &Announcement,
    config: &DeviceConfig,
) -> DeviceDescriptor {
    let id = announcement.id.as_str();

    let name = config
        .device_name()
        .or(announcement.name.as_deref())
        .unwrap_or(id)
        .to_string();

    let description = match (&announcement.model, &announcement.ver) {
        (Some(model), Some(ver)) => format!("{} (firmware {})", model, ver),
        (Some(model), None) => model.clone(),
        _ => format!("Device {}", id),
    };

    let mut actuators = Vec::new();
    let mut sensors = Vec::new();

    for component in config.components() {
        if component.kind.is_actuator() {
            actuators.push(ActuatorDescriptor {
                name: component_name(&name, &component),
                description: format!("{} {} of {}", component.kind, component.index, id),
                kind: component.kind,
                tags: vec![actuator_tag(id, component.index)],
            });
        } else {
            sensors.push(SensorDescriptor {
                name: component_name(&name, &component),
                description: format!("{} {} of {}", component.kind, component.index, id),
                kind: component.kind,
                tags: vec![sensor_tag(id, component.index)],
            });
        }
    }

    DeviceDescriptor {
        id: id.to_string(),
        driver: driver.to_string(),
        name,
        description,
        actuators,
        sensors,
        tags: vec![device_tag(id)],
    }
}

fn component_name(device_name: &str, component: &Component) -> String {
    match &component.name {
        Some(name) => name.clone(),
        None => format!("{} {} {}", device_name, component.kind, component.index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_descriptor() {
        let mut announcement = Announcement::new("pump-a1");
        announcement.model = Some("SNSW-102".into());
        announcement.ver = Some("1.0.3".into());

        let config: DeviceConfig = serde_json::from_value(json!({
            "sys": {"device": {"name": "Sump pumps"}},
            "switch:0": {"id": 0, "name": "Drain pump"},
            "switch:1": {"id": 1},
            "temperature:0": {"id": 0}
        }))
        .unwrap();

        let d = build_descriptor("cistern-rpc", &announcement, &config);

        assert_eq!(d.id, "pump-a1");
        assert_eq!(d.driver, "cistern-rpc");
        assert_eq!(d.name, "Sump pumps");
        assert_eq!(d.description, "SNSW-102 (firmware 1.0.3)");
        assert_eq!(d.tags, vec!["device.pump-a1".to_string()]);
        assert_eq!(d.canonical_tag(), "device.pump-a1");

        assert_eq!(d.actuators.len(), 2);
        assert_eq!(d.actuators[0].name, "Drain pump");
        assert_eq!(d.actuators[0].tags, vec!["device.pump-a1.actuator.0".to_string()]);
        assert_eq!(d.actuators[1].name, "Sump pumps switch 1");
        assert_eq!(d.actuators[1].tags, vec!["device.pump-a1.actuator.1".to_string()]);

        assert_eq!(d.sensors.len(), 1);
        assert_eq!(d.sensors[0].tags, vec!["device.pump-a1.sensor.0".to_string()]);
        assert_eq!(d.all_tags().count(), 4);
    }

    #[test]
    fn test_name_falls_back_to_id() {
        let d = build_descriptor(
            "cistern-rpc",
            &Announcement::new("tank-7"),
            &DeviceConfig::default(),
        );

        assert_eq!(d.name, "tank-7");
        assert_eq!(d.description, "Device tank-7");
        assert!(d.actuators.is_empty());
        assert!(d.sensors.is_empty());
    }
}
