//! # Cistern Driver
//!
//! Backend driver for apparatus controllers that are only reachable over a
//! publish/subscribe transport.
//!
//! ## Architecture
//!
//! ```text
//! Backend services
//!       │ start / discover_devices / set_switch
//!       ▼
//! ┌─────────────────────────────────┐
//! │    cistern-driver               │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ Discoverer│─►│ DeviceStore│  │
//! │  └─────┬─────┘  └────────────┘  │
//! │        ▼                        │
//! │  ┌─────────────────────────┐    │
//! │  │ Correlator (core)       │    │
//! │  └─────────────────────────┘    │
//! └─────────────┬───────────────────┘
//!               │ JSON over pub/sub
//!               ▼
//!      <device>/rpc   +/announce   <base>/command
//! ```
//!
//! ## Tags
//!
//! | Entity   | Tag                        |
//! |----------|----------------------------|
//! | Device   | `device.{id}`              |
//! | Actuator | `device.{id}.actuator.{n}` |
//! | Sensor   | `device.{id}.sensor.{n}`   |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cistern_core::{CancellationToken, LocalBroker};
//! use cistern_driver::{DiscoveryOptions, Driver, DriverConfig, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = LocalBroker::new();
//!     let driver = Driver::new(
//!         DriverConfig::new("backend"),
//!         Arc::new(broker.client("backend")),
//!         Arc::new(MemoryStore::new()),
//!     );
//!
//!     let ctx = CancellationToken::new();
//!     driver.start(&ctx).await?;
//!     let result = driver.discover_devices(&ctx, DiscoveryOptions::default()).await?;
//!     println!("new devices: {:?}", result.discovered_tags);
//!     driver.stop(&ctx).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod descriptor;
pub mod storage;
pub mod discovery;
pub mod driver;
pub mod simulator;

pub use config::{DiscoveryConfig, DriverConfig, TopicConfig};
pub use error::{ConfigError, DiscoveryError, DriverError};
pub use protocol::{Announcement, ComponentKind, DeviceConfig, SwitchSetResult};
pub use descriptor::{build_descriptor, device_tag, DeviceDescriptor};
pub use storage::{DeviceStore, MemoryStore, StoreError, StoredDevice};
pub use discovery::{Discoverer, DiscoveryOptions, DiscoveryResult};
pub use driver::Driver;
pub use simulator::{DeviceSpec, Fleet, SimulatedDevice};
