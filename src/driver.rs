//! Platform driver contract
//!
//! The engine never talks to a Bluetooth stack directly. A platform driver
//! implements [`BleDriver`] and reports everything asynchronous through a
//! bounded [`DriverEvent`] channel into the engine's executor. Driver
//! methods enqueue work and must not block; the engine routes the calls
//! documented as potentially blocking through its blocking worker.

use crate::identity::{Identity, MacAddress};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// 128-bit service UUID every mesh node advertises
pub const SERVICE_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e3";
/// TX characteristic: read/notify, peripheral-to-central data
pub const CHARACTERISTIC_TX: &str = "37145b00-442d-4a94-917f-8f42c5da28e4";
/// RX characteristic: write, central-to-peripheral data and the handshake
pub const CHARACTERISTIC_RX: &str = "37145b00-442d-4a94-917f-8f42c5da28e5";
/// Identity characteristic: read-only, 16 bytes
pub const CHARACTERISTIC_IDENTITY: &str = "37145b00-442d-4a94-917f-8f42c5da28e6";

/// ATT minimum; assumed when the platform cannot report a negotiated MTU
pub const DEFAULT_MTU: u16 = 23;

/// Sentinel some platforms report when signal strength is unknown;
/// advertisements carrying it are discarded
pub const RSSI_UNKNOWN: i16 = -127;

/// UUIDs the driver registers its GATT service with
#[derive(Debug, Clone)]
pub struct GattProfile {
    pub service_uuid: &'static str,
    pub rx_char: &'static str,
    pub tx_char: &'static str,
    pub identity_char: &'static str,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            rx_char: CHARACTERISTIC_RX,
            tx_char: CHARACTERISTIC_TX,
            identity_char: CHARACTERISTIC_IDENTITY,
        }
    }
}

/// Errors surfaced by a platform driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Service registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected to {0}")]
    NotConnected(MacAddress),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Operation timed out")]
    Timeout,
}

impl DriverError {
    /// Whether the failure is worth retrying within the same attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectFailed(_)
                | DriverError::NotConnected(_)
                | DriverError::WriteFailed(_)
                | DriverError::ReadFailed(_)
                | DriverError::Timeout
        )
    }
}

/// One device sighting from a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub mac: MacAddress,
    pub rssi: i16,
    pub name: Option<String>,
    pub service_uuids: Vec<String>,
}

impl Advertisement {
    /// Whether the advertisement carries the given service UUID
    pub fn matches_service(&self, uuid: &str) -> bool {
        self.service_uuids.iter().any(|u| u.eq_ignore_ascii_case(uuid))
    }
}

/// Events a driver reports into the engine
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A device was seen advertising during a scan
    Discovered(Advertisement),
    /// A link came up, either dialed by us or inbound.
    /// `mtu` of 0 means unknown; the engine falls back to [`DEFAULT_MTU`].
    Connected { mac: MacAddress, mtu: u16 },
    /// A link dropped
    Disconnected { mac: MacAddress },
    /// Bytes arrived on RX (peripheral side) or via notify (central side)
    Data { mac: MacAddress, bytes: Vec<u8> },
    /// A dial we requested did not produce a link
    ConnectFailed { mac: MacAddress, error: DriverError },
}

impl fmt::Display for DriverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverEvent::Discovered(advert) => {
                write!(f, "Discovered {{ mac: {}, rssi: {} }}", advert.mac, advert.rssi)
            }
            DriverEvent::Connected { mac, mtu } => {
                write!(f, "Connected {{ mac: {}, mtu: {} }}", mac, mtu)
            }
            DriverEvent::Disconnected { mac } => write!(f, "Disconnected {{ mac: {} }}", mac),
            DriverEvent::Data { mac, bytes } => {
                write!(f, "Data {{ mac: {}, len: {} }}", mac, bytes.len())
            }
            DriverEvent::ConnectFailed { mac, error } => {
                write!(f, "ConnectFailed {{ mac: {}, error: {} }}", mac, error)
            }
        }
    }
}

/// The platform driver boundary.
///
/// Implementations wrap a concrete Bluetooth stack. `connect`, `disconnect`,
/// and `remove_device` may block on native calls and are always invoked
/// from the engine's blocking worker; everything else must return promptly.
pub trait BleDriver: Send + Sync {
    /// Initialize the stack, power the radio, and register the GATT
    /// service. Events flow through `events` from this point on.
    fn start(
        &self,
        profile: &GattProfile,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<(), DriverError>;

    /// Release everything. Idempotent.
    fn stop(&self) -> Result<(), DriverError>;

    /// Populate the read-only identity characteristic
    fn set_identity(&self, identity: Identity) -> Result<(), DriverError>;

    /// Begin emitting `Discovered` events
    fn start_scanning(&self) -> Result<(), DriverError>;

    /// Stop emitting `Discovered` events
    fn stop_scanning(&self) -> Result<(), DriverError>;

    /// Advertise the service, optionally with a short name (≤ 8 bytes)
    fn start_advertising(&self, name: Option<&str>) -> Result<(), DriverError>;

    /// Stop advertising
    fn stop_advertising(&self) -> Result<(), DriverError>;

    /// Dial a device. Completion arrives as `Connected` or `ConnectFailed`.
    /// Idempotent; concurrent calls for one device must coalesce.
    fn connect(&self, mac: MacAddress) -> Result<(), DriverError>;

    /// Tear a link down. Idempotent.
    fn disconnect(&self, mac: MacAddress) -> Result<(), DriverError>;

    /// Write to the remote's RX characteristic (central) or notify on TX
    /// (peripheral). Ok means accepted for delivery.
    fn send(&self, mac: MacAddress, bytes: &[u8]) -> Result<(), DriverError>;

    /// Read the remote's identity characteristic (central side, post-connect)
    fn read_identity(&self, mac: MacAddress) -> Result<Vec<u8>, DriverError>;

    /// Negotiated ATT MTU for a link, or [`DEFAULT_MTU`] when unknown
    fn peer_mtu(&self, mac: MacAddress) -> u16;

    /// Evict stale platform state for a device after failures
    fn remove_device(&self, mac: MacAddress) -> Result<(), DriverError>;
}
