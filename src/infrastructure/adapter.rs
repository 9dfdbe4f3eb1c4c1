//! Platform adapter boundary.
//!
//! The engine core is platform-agnostic; everything that touches a real BLE
//! stack lives behind [`PlatformAdapter`]. Adapters push unsolicited stack
//! activity through a [`PlatformEvent`] channel handed to the engine at
//! construction, so callbacks never touch engine state directly.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::models::{
    Association, ConnectionPriority, NotifyMode, ObservedTarget, WakeType, WriteMode,
};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bluetooth adapter unavailable")]
    Unavailable,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("association failed: {0}")]
    AssociationFailed(String),

    #[error("association cancelled by user")]
    UserCancelled,
}

/// GATT property flags relevant to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub properties: CharacteristicProperties,
}

impl CharacteristicInfo {
    pub fn is_writable(&self) -> bool {
        self.properties.write || self.properties.write_without_response
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// What the platform knows about a peripheral it hands back to us, used for
/// registry repopulation and state restoration.
#[derive(Debug, Clone)]
pub struct PeripheralSnapshot {
    pub device_id: String,
    pub name: Option<String>,
    pub connected: bool,
    pub services: Vec<ServiceInfo>,
    /// (service uuid, characteristic uuid) pairs with notifications enabled.
    pub notifying: Vec<(String, String)>,
}

/// Presence/companion feature support reported by the platform.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCapabilities {
    pub is_supported: bool,
    pub requires_association: bool,
    pub presence_observation_available: bool,
    pub minimum_os_version: String,
    pub current_os_version: String,
}

/// Feature tier derived once at engine startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceMode {
    /// Association (where required) and presence observation both work.
    Full,
    /// Devices can be associated but the OS never delivers presence wakes.
    Legacy,
    Unsupported,
}

impl PresenceCapabilities {
    pub fn mode(&self) -> PresenceMode {
        if !self.is_supported {
            PresenceMode::Unsupported
        } else if self.presence_observation_available {
            PresenceMode::Full
        } else {
            PresenceMode::Legacy
        }
    }
}

/// Unsolicited activity from the platform stack.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    AdapterStateChanged {
        available: bool,
    },
    ScanResult {
        device_id: String,
        name: Option<String>,
        manufacturer_data_head: Vec<u8>,
        rssi: i16,
    },
    Disconnected {
        device_id: String,
    },
    CharacteristicChanged {
        device_id: String,
        characteristic: String,
        value: Vec<u8>,
    },
    PresenceWake {
        device_id: Option<String>,
        device_name: Option<String>,
        association_id: Option<i64>,
        wake_type: WakeType,
    },
    /// The OS relaunched us with peripherals it kept alive on our behalf.
    StateRestored {
        peripherals: Vec<PeripheralSnapshot>,
    },
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn start_scan(&self, service_filter: Option<&str>) -> Result<(), AdapterError>;
    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Establish a link. With `pending` set the request stays armed until the
    /// peripheral comes into range (auto-connect).
    async fn connect(&self, device_id: &str, pending: bool) -> Result<(), AdapterError>;
    async fn disconnect(&self, device_id: &str) -> Result<(), AdapterError>;

    async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, AdapterError>;

    async fn read_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, AdapterError>;

    async fn write_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError>;

    async fn set_notify(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        mode: NotifyMode,
    ) -> Result<(), AdapterError>;

    async fn read_rssi(&self, device_id: &str) -> Result<i16, AdapterError>;

    /// Negotiate the MTU; returns the value actually granted.
    async fn request_mtu(&self, device_id: &str, expected: u16) -> Result<u16, AdapterError>;

    async fn request_latency(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
    ) -> Result<(), AdapterError>;

    /// Run the platform pairing/association flow.
    async fn associate(
        &self,
        name_pattern: &str,
        single_device: bool,
    ) -> Result<Association, AdapterError>;

    async fn observe_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError>;
    async fn stop_observing_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError>;
    async fn remove_association(&self, target: &ObservedTarget) -> Result<(), AdapterError>;
    async fn associations(&self) -> Result<Vec<Association>, AdapterError>;

    /// Peripherals the platform currently holds connected for this process.
    async fn connected_peripherals(&self) -> Result<Vec<PeripheralSnapshot>, AdapterError>;

    fn capabilities(&self) -> PresenceCapabilities;
}
