//! Configuration for the device driver
//!
//! Combines identity, topic layout and discovery tuning. Values are fixed at
//! construction; [`DriverConfig::validate`] runs when the driver starts.

use std::time::Duration;

use crate::error::ConfigError;

/// Complete driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Client identity on the transport; part of the inbox topic
    pub client_name: String,

    /// Value written to `driver` in persisted device descriptors
    pub driver_name: String,

    // Topic layout
    pub topics: TopicConfig,

    // Discovery tuning
    pub discovery: DiscoveryConfig,

    /// Timeout for commands issued through the driver
    pub rpc_timeout: Duration,
}

/// Topic layout on the transport
#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Prefix for this backend's own topics
    pub base: String,

    /// Filter devices announce themselves on
    pub announce: String,

    /// Broadcast topic for the search command (defaults to `<base>/command`)
    pub command: Option<String>,
}

/// Discovery session tuning
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Capacity of the announcement intake queue
    pub buffer: usize,

    /// How long announcements are accepted
    pub window: Duration,

    /// Maximum concurrent probe workers
    pub workers: usize,

    /// Timeout for each GetConfig probe
    pub probe_timeout: Duration,

    /// How long a cancelled session waits for its probes before returning
    pub cancel_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            client_name: String::new(),
            driver_name: "cistern-rpc".to_string(),
            topics: TopicConfig::default(),
            discovery: DiscoveryConfig::default(),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            base: "cistern".to_string(),
            announce: "+/announce".to_string(),
            command: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            buffer: 64,
            window: Duration::from_secs(5),
            workers: 4,
            probe_timeout: Duration::from_secs(3),
            cancel_grace: Duration::ZERO,
        }
    }
}

impl TopicConfig {
    /// Broadcast topic for the search command
    pub fn command_topic(&self) -> String {
        self.command
            .clone()
            .unwrap_or_else(|| format!("{}/command", self.base))
    }
}

impl DriverConfig {
    /// Create config for a named client
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Default::default()
        }
    }

    /// Address stamped as `src` on requests: `<base>/<client>`
    pub fn reply_to(&self) -> String {
        format!("{}/{}", self.topics.base, self.client_name)
    }

    /// This driver's inbox: `<base>/<client>/rpc`
    pub fn inbox_topic(&self) -> String {
        cistern_core::rpc_topic(&self.reply_to())
    }

    /// Set the topic prefix
    pub fn with_base_topic(mut self, base: impl Into<String>) -> Self {
        self.topics.base = base.into();
        self
    }

    /// Set the announce filter
    pub fn with_announce_topic(mut self, filter: impl Into<String>) -> Self {
        self.topics.announce = filter.into();
        self
    }

    /// Set the search command topic
    pub fn with_command_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.command = Some(topic.into());
        self
    }

    /// Set the descriptor driver name
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = name.into();
        self
    }

    /// Set the discovery window
    pub fn with_discovery_window(mut self, window: Duration) -> Self {
        self.discovery.window = window;
        self
    }

    /// Set the probe worker limit
    pub fn with_discovery_workers(mut self, workers: usize) -> Self {
        self.discovery.workers = workers;
        self
    }

    /// Set the intake queue capacity
    pub fn with_discovery_buffer(mut self, buffer: usize) -> Self {
        self.discovery.buffer = buffer;
        self
    }

    /// Set the per-probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.discovery.probe_timeout = timeout;
        self
    }

    /// Set the grace period for probes of a cancelled session
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.discovery.cancel_grace = grace;
        self
    }

    /// Set the command timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Reject configurations the driver cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::MissingClientName);
        }
        if self.client_name.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidClientName(self.client_name.clone()));
        }
        if self.topics.base.is_empty() || self.topics.base.contains(['+', '#']) {
            return Err(ConfigError::InvalidTopic(self.topics.base.clone()));
        }
        cistern_core::transport::validate_filter(&self.topics.announce)
            .map_err(|_| ConfigError::InvalidTopic(self.topics.announce.clone()))?;

        let command = self.topics.command_topic();
        if command.contains(['+', '#']) {
            return Err(ConfigError::InvalidTopic(command));
        }

        self.discovery.validate()
    }
}

impl DiscoveryConfig {
    /// Reject settings a discovery session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer == 0 {
            return Err(ConfigError::Zero("discovery buffer"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("discovery workers"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::Zero("discovery window"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DriverConfig::new("backend")
            .with_base_topic("plant")
            .with_discovery_workers(2)
            .with_discovery_window(Duration::from_millis(300));

        assert_eq!(config.client_name, "backend");
        assert_eq!(config.reply_to(), "plant/backend");
        assert_eq!(config.inbox_topic(), "plant/backend/rpc");
        assert_eq!(config.topics.command_topic(), "plant/command");
        assert_eq!(config.discovery.workers, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_identity() {
        assert!(matches!(
            DriverConfig::default().validate(),
            Err(ConfigError::MissingClientName)
        ));
        assert!(matches!(
            DriverConfig::new("a/b").validate(),
            Err(ConfigError::InvalidClientName(_))
        ));
        assert!(matches!(
            DriverConfig::new("backend").with_discovery_workers(0).validate(),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            DriverConfig::new("backend").with_announce_topic("#/x").validate(),
            Err(ConfigError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_discovery_settings_must_be_nonzero() {
        assert!(DiscoveryConfig::default().validate().is_ok());

        let zero_buffer = DiscoveryConfig { buffer: 0, ..Default::default() };
        assert!(matches!(zero_buffer.validate(), Err(ConfigError::Zero("discovery buffer"))));

        let zero_workers = DiscoveryConfig { workers: 0, ..Default::default() };
        assert!(matches!(zero_workers.validate(), Err(ConfigError::Zero("discovery workers"))));
    }
}
