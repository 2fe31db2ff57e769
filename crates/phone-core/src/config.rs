//! Telephony configuration
//!
//! [`TelephonyConfig`] carries the router facing constants (call monitor
//! port, keepalive, service codes), the fax chunking parameters and the
//! router profiles. It is plain serde data and usually loaded from JSON.
//!
//! # Usage
//!
//! ```rust
//! use routerphone_core::config::TelephonyConfig;
//! use routerphone_core::profile::{Profile, ProfileSettings};
//!
//! let config = TelephonyConfig::new()
//!     .with_monitor_port(1012)
//!     .with_fax_max_in_flight(4)
//!     .with_profile(Profile::new("home", ProfileSettings::default()));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.fax_max_in_flight, 4);
//! ```
//!
//! ```rust
//! use routerphone_core::config::TelephonyConfig;
//!
//! let config = TelephonyConfig::from_json_str(r#"{
//!     "monitor_port": 1012,
//!     "profiles": [{ "name": "home", "settings": { "router_host": "192.168.178.1" } }]
//! }"#).unwrap();
//!
//! assert_eq!(config.profiles[0].router_host(), "192.168.178.1");
//! assert_eq!(config.fax_chunk_size, 160);
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TelephonyError, TelephonyResult};
use crate::fax::{FaxTransferConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IN_FLIGHT};
use crate::monitor::{CallMonitorConfig, DEFAULT_MONITOR_ENABLE_CODE, DEFAULT_MONITOR_PORT};
use crate::profile::Profile;

/// Router service code enabling the call-control transport port
pub const DEFAULT_TRANSPORT_ENABLE_CODE: &str = "#96*3*";

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// Router call monitor TCP port
    pub monitor_port: u16,
    /// Idle time before the first keepalive probe on the monitor socket
    pub monitor_keepalive_idle_secs: u64,
    /// Wait after enabling a router port before connecting again
    pub reconnect_delay_ms: u64,
    /// Service code enabling the call monitor port
    pub monitor_enable_code: String,
    /// Service code enabling the call-control transport port
    pub transport_enable_code: String,

    /// Bytes per fax data chunk
    pub fax_chunk_size: usize,
    /// Unacknowledged fax chunks allowed in flight
    pub fax_max_in_flight: usize,

    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,

    pub profiles: Vec<Profile>,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            monitor_port: DEFAULT_MONITOR_PORT,
            monitor_keepalive_idle_secs: 600,
            reconnect_delay_ms: 2000,
            monitor_enable_code: DEFAULT_MONITOR_ENABLE_CODE.to_string(),
            transport_enable_code: DEFAULT_TRANSPORT_ENABLE_CODE.to_string(),
            fax_chunk_size: DEFAULT_CHUNK_SIZE,
            fax_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            event_channel_capacity: 256,
            profiles: Vec::new(),
        }
    }
}

impl TelephonyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> TelephonyResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> TelephonyResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| TelephonyError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_monitor_port(mut self, port: u16) -> Self {
        self.monitor_port = port;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_fax_chunk_size(mut self, size: usize) -> Self {
        self.fax_chunk_size = size;
        self
    }

    pub fn with_fax_max_in_flight(mut self, max: usize) -> Self {
        self.fax_max_in_flight = max;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Check the values the components cannot work with
    pub fn validate(&self) -> TelephonyResult<()> {
        if self.monitor_port == 0 {
            return Err(TelephonyError::invalid_configuration("monitor_port", "must not be 0"));
        }
        if self.fax_chunk_size == 0 {
            return Err(TelephonyError::invalid_configuration("fax_chunk_size", "must not be 0"));
        }
        if self.fax_max_in_flight == 0 {
            return Err(TelephonyError::invalid_configuration("fax_max_in_flight", "must not be 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(TelephonyError::invalid_configuration(
                "event_channel_capacity",
                "must not be 0",
            ));
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(TelephonyError::invalid_configuration(
                    "profiles",
                    format!("duplicate profile name '{}'", profile.name),
                ));
            }
        }

        Ok(())
    }

    pub fn monitor_config(&self) -> CallMonitorConfig {
        CallMonitorConfig {
            port: self.monitor_port,
            keepalive_idle: Duration::from_secs(self.monitor_keepalive_idle_secs),
            reconnect_delay: self.reconnect_delay(),
            enable_code: self.monitor_enable_code.clone(),
        }
    }

    pub fn fax_config(&self) -> FaxTransferConfig {
        FaxTransferConfig {
            chunk_size: self.fax_chunk_size,
            max_in_flight: self.fax_max_in_flight,
        }
    }
}
