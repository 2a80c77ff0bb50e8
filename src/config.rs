//! Engine configuration
//!
//! Tunables that control discovery cadence, connection policy, and memory
//! bounds. Every option has a working default; `validate()` enforces the
//! documented ranges before the engine starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid max_peers: must be 1-10, got {0}")]
    InvalidMaxPeers(usize),

    #[error("Invalid max_discovered_peers: must be 10-500, got {0}")]
    InvalidMaxDiscovered(usize),

    #[error("Invalid scan_interval: must be 1-60 s, got {0:?}")]
    InvalidScanInterval(Duration),

    #[error("Invalid min_rssi: must be -100..=-30 dBm, got {0}")]
    InvalidMinRssi(i16),

    #[error("Invalid service_discovery_delay: must be 0.5-5 s, got {0:?}")]
    InvalidDiscoveryDelay(Duration),

    #[error("Invalid connection_timeout: must be 10-120 s, got {0:?}")]
    InvalidConnectionTimeout(Duration),

    #[error("Device name too long: {0} bytes (max {MAX_DEVICE_NAME_LEN})")]
    DeviceNameTooLong(usize),

    #[error("At least one of central and peripheral roles must be enabled")]
    NoRoleEnabled,
}

/// Advertised names must fit the 31-byte advertisement budget alongside the
/// 128-bit service UUID.
pub const MAX_DEVICE_NAME_LEN: usize = 8;

/// Scan duty cycle presets.
///
/// Each mode trades discovery latency against radio and CPU time. Saver mode
/// additionally skips scanning entirely while any peer link is up, which is
/// the dominant power cost on small boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerMode {
    /// Continuous discovery: long scan windows, minimal idle time
    Aggressive,
    /// Default duty cycle driven by `scan_interval`
    Balanced,
    /// Short scan windows, long idle time, no scanning while connected
    Saver,
}

impl PowerMode {
    /// How long a single scan window lasts
    pub fn scan_window(&self) -> Duration {
        match self {
            PowerMode::Aggressive => Duration::from_secs(2),
            PowerMode::Balanced => Duration::from_secs(1),
            PowerMode::Saver => Duration::from_millis(500),
        }
    }

    /// Idle time between scan cycles. `skipped` is true when the previous
    /// cycle did not scan (gated or saver-suppressed).
    pub fn idle_between_scans(&self, scan_interval: Duration, skipped: bool) -> Duration {
        match self {
            PowerMode::Aggressive => Duration::from_secs(1),
            PowerMode::Balanced => scan_interval,
            PowerMode::Saver => {
                if skipped {
                    Duration::from_secs(60)
                } else {
                    Duration::from_secs(30)
                }
            }
        }
    }

    /// Saver mode stops scanning while links are up
    pub fn suppress_scan_when_connected(&self) -> bool {
        matches!(self, PowerMode::Saver)
    }
}

impl Default for PowerMode {
    fn default() -> Self {
        PowerMode::Balanced
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Aggressive => write!(f, "aggressive"),
            PowerMode::Balanced => write!(f, "balanced"),
            PowerMode::Saver => write!(f, "saver"),
        }
    }
}

/// Engine configuration surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on simultaneous Active peers (1-10)
    pub max_peers: usize,
    /// LRU cap on the peer registry (10-500)
    pub max_discovered_peers: usize,
    /// Discovery cadence in balanced mode (1-60 s)
    pub scan_interval: Duration,
    /// Advertisements below this signal strength are ignored (-100..=-30 dBm)
    pub min_rssi: i16,
    /// Delay after link-up before GATT service discovery (0.5-5 s).
    /// Platform quirk hook: gives the peripheral stack time to finish
    /// registering characteristics before we enumerate them.
    pub service_discovery_delay: Duration,
    /// Bound for a single connection attempt and for packet reassembly (10-120 s)
    pub connection_timeout: Duration,
    /// Minimum interval between dials to the same peer
    pub connect_rate_limit: Duration,
    /// Consecutive failures before a peer is blacklisted
    pub max_failures_before_blacklist: u32,
    /// Scan duty cycle preset
    pub power_mode: PowerMode,
    /// Whether we scan and dial (central role)
    pub enable_central: bool,
    /// Whether we advertise and accept (peripheral role)
    pub enable_peripheral: bool,
    /// Optional advertised name (max 8 bytes)
    pub device_name: Option<String>,
    /// Per-peer cap on buffered reassembly bytes
    pub max_inflight_bytes: usize,
    /// Discovered peers not seen within this window are released
    pub stale_peer_timeout: Duration,
    /// Drain bound when shutting down
    pub shutdown_timeout: Duration,
    /// How long to wait for the upper stack identity at startup
    pub identity_wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: 7,
            max_discovered_peers: 100,
            scan_interval: Duration::from_secs(5),
            min_rssi: -85,
            service_discovery_delay: Duration::from_millis(1500),
            connection_timeout: Duration::from_secs(30),
            connect_rate_limit: Duration::from_secs(5),
            max_failures_before_blacklist: 3,
            power_mode: PowerMode::Balanced,
            enable_central: true,
            enable_peripheral: true,
            device_name: None,
            max_inflight_bytes: 64 * 1024,
            stale_peer_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            identity_wait_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Set the maximum number of active peers
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set the discovery cadence
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the advertisement RSSI filter
    pub fn with_min_rssi(mut self, min_rssi: i16) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    /// Set the power mode preset
    pub fn with_power_mode(mut self, mode: PowerMode) -> Self {
        self.power_mode = mode;
        self
    }

    /// Set the advertised device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Enable or disable the central role
    pub fn with_central(mut self, enabled: bool) -> Self {
        self.enable_central = enabled;
        self
    }

    /// Enable or disable the peripheral role
    pub fn with_peripheral(mut self, enabled: bool) -> Self {
        self.enable_peripheral = enabled;
        self
    }

    /// Validate all option ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers < 1 || self.max_peers > 10 {
            return Err(ConfigError::InvalidMaxPeers(self.max_peers));
        }
        if self.max_discovered_peers < 10 || self.max_discovered_peers > 500 {
            return Err(ConfigError::InvalidMaxDiscovered(self.max_discovered_peers));
        }
        if self.scan_interval < Duration::from_secs(1) || self.scan_interval > Duration::from_secs(60)
        {
            return Err(ConfigError::InvalidScanInterval(self.scan_interval));
        }
        if self.min_rssi < -100 || self.min_rssi > -30 {
            return Err(ConfigError::InvalidMinRssi(self.min_rssi));
        }
        if self.service_discovery_delay < Duration::from_millis(500)
            || self.service_discovery_delay > Duration::from_secs(5)
        {
            return Err(ConfigError::InvalidDiscoveryDelay(self.service_discovery_delay));
        }
        if self.connection_timeout < Duration::from_secs(10)
            || self.connection_timeout > Duration::from_secs(120)
        {
            return Err(ConfigError::InvalidConnectionTimeout(self.connection_timeout));
        }
        if let Some(name) = &self.device_name {
            if name.len() > MAX_DEVICE_NAME_LEN {
                return Err(ConfigError::DeviceNameTooLong(name.len()));
            }
        }
        if !self.enable_central && !self.enable_peripheral {
            return Err(ConfigError::NoRoleEnabled);
        }
        Ok(())
    }
}
