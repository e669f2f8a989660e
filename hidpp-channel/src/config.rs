//! Timing and behavior settings shared by the channels.

use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings of a channel.
///
/// Every key is optional when deserializing:
///
/// ```
/// use hidpp_channel::ChannelConfig;
///
/// let config = ChannelConfig::from_toml_str("retry_count = 2").unwrap();
/// assert_eq!(config.retry_count, 2);
/// assert_eq!(config.get_timeout_ms, 2000);
/// ```
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Timeout of USB writes.
    pub send_timeout_ms: u64,

    /// Timeout of reads done on behalf of the channel itself, such as
    /// register reads of a receiver.
    pub get_timeout_ms: u64,

    /// Attempts of [`crate::Channel::send_data_wait_response`].
    pub retry_count: u32,

    /// Pause between two attempts.
    pub retry_delay_ms: u64,

    /// Polling period of [`crate::Channel::wait_device_connection_state`].
    pub wait_connection_state_period_ms: u64,

    /// How long a through-channel collects device connection notifications
    /// after a fake arrival.
    pub connection_scan_timeout_ms: u64,

    /// Makes through-channels drain their queues when closed. Left over
    /// messages are logged.
    pub automatic_message_clear_in_close: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 600,
            get_timeout_ms: 2000,
            retry_count: 5,
            retry_delay_ms: 10,
            wait_connection_state_period_ms: 100,
            connection_scan_timeout_ms: 100,
            automatic_message_clear_in_close: false,
        }
    }
}

impl ChannelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn wait_connection_state_period(&self) -> Duration {
        Duration::from_millis(self.wait_connection_state_period_ms)
    }

    pub fn connection_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_scan_timeout_ms)
    }
}

/// Represents an error that occurred while loading a configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("could not read the configuration: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
