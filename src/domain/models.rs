//! Core data model shared across the engine.
//!
//! Device ids are normalized to uppercase on entry so MAC addresses and
//! peripheral UUIDs compare consistently; GATT uuids are normalized to
//! lowercase the way most stacks print them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Canonical form for a device id (MAC address or platform peripheral UUID).
pub fn normalize_device_id(id: &str) -> String {
    id.trim().to_uppercase()
}

/// Canonical form for a GATT service/characteristic uuid.
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim().to_lowercase()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One row of the device registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: Option<String>,
    pub last_rssi: Option<i16>,
    pub last_seen_at: i64,
}

/// Lifecycle of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Disconnecting,
}

/// Why the platform woke us up for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WakeType {
    Appeared,
    Disappeared,
    StateRestored,
}

impl WakeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeType::Appeared => "appeared",
            WakeType::Disappeared => "disappeared",
            WakeType::StateRestored => "stateRestored",
        }
    }
}

/// A presence signal on its way to the background wake sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeEvent {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub wake_type: WakeType,
    pub association_id: Option<i64>,
    pub timestamp: i64,
}

impl WakeEvent {
    /// Deduplication key; events without a device id are never deduplicated.
    pub fn dedup_key(&self) -> Option<String> {
        self.device_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("{}|{}", id, self.wake_type.as_str()))
    }
}

/// A device the engine watches for presence, persisted across restarts.
/// Either field may be absent but at least one must be set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedTarget {
    pub device_id: Option<String>,
    pub association_id: Option<i64>,
}

impl ObservedTarget {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(normalize_device_id(&device_id.into())),
            association_id: None,
        }
    }

    pub fn for_association(association_id: i64) -> Self {
        Self {
            device_id: None,
            association_id: Some(association_id),
        }
    }

    pub fn matches_device(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id)
    }
}

/// Callback handles the host registers so a background wake context can be
/// spawned after process death.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeHandles {
    pub dispatcher_handle: i64,
    pub callback_handle: i64,
}

/// Command written automatically when an observed device appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCommandConfig {
    pub service: String,
    pub characteristic: String,
    pub payload: Vec<u8>,
}

impl AutoCommandConfig {
    /// Clamp arbitrary integers into bytes; out-of-range values saturate.
    pub fn clamp_payload(values: &[i64]) -> Vec<u8> {
        values
            .iter()
            .map(|v| (*v).clamp(0, 255) as u8)
            .collect()
    }

    /// Parse the persisted comma-separated byte list, skipping garbage.
    pub fn parse_payload_csv(csv: &str) -> Vec<u8> {
        csv.split(',')
            .filter_map(|tok| tok.trim().parse::<i64>().ok())
            .map(|v| v.clamp(0, 255) as u8)
            .collect()
    }

    pub fn payload_csv(&self) -> String {
        self.payload
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Notification registration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotifyMode {
    Disabled,
    Notification,
    Indication,
}

/// How a characteristic write should be acknowledged by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Requested connection parameter profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// Outcome carried by operation acknowledgement events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Success,
    Failure,
}

/// Result of a platform association (pairing) flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub association_id: Option<i64>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

/// Everything the engine reports back to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    ScanResult {
        device_id: String,
        name: String,
        manufacturer_data_head: Vec<u8>,
        rssi: i16,
    },
    Connected {
        device_id: String,
    },
    Disconnecting {
        device_id: String,
    },
    Disconnected {
        device_id: String,
    },
    ServiceDiscovered {
        device_id: String,
        service: String,
        characteristics: Vec<String>,
    },
    ServiceDiscoveryFailed {
        device_id: String,
    },
    MtuChanged {
        device_id: String,
        mtu_config: u16,
    },
    RssiRead {
        device_id: String,
        rssi: i16,
    },
    CharacteristicRead {
        device_id: String,
        characteristic: String,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        device_id: String,
        characteristic: String,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        device_id: String,
        characteristic: String,
        status: OperationStatus,
    },
    OperationFailed {
        device_id: String,
        operation: String,
        reason: String,
    },
    StateRestored {
        restored_peripherals: Vec<String>,
    },
    PendingConnectionRestored {
        device_id: String,
    },
    RepopulatedPeripherals {
        found: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_device_id() {
        assert_eq!(normalize_device_id(" aa:bb:cc:dd:ee:ff "), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_payload_clamping() {
        assert_eq!(
            AutoCommandConfig::clamp_payload(&[-5, 0, 128, 255, 999]),
            vec![0, 0, 128, 255, 255]
        );
    }

    #[test]
    fn test_payload_csv_round_trip() {
        let config = AutoCommandConfig {
            service: "180d".into(),
            characteristic: "2a37".into(),
            payload: vec![1, 2, 3],
        };
        assert_eq!(config.payload_csv(), "1,2,3");
        assert_eq!(AutoCommandConfig::parse_payload_csv("1, 2,junk,3"), vec![1, 2, 3]);
    }

    #[test]
    fn test_dedup_key() {
        let ev = WakeEvent {
            device_id: Some("AA:BB".into()),
            device_name: None,
            wake_type: WakeType::Appeared,
            association_id: None,
            timestamp: 0,
        };
        assert_eq!(ev.dedup_key().as_deref(), Some("AA:BB|appeared"));

        let anonymous = WakeEvent { device_id: None, ..ev };
        assert_eq!(anonymous.dedup_key(), None);
    }

    #[test]
    fn test_event_serialization_shape() {
        let ev = EngineEvent::MtuChanged {
            device_id: "AA".into(),
            mtu_config: 185,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "mtuChanged");
        assert_eq!(json["mtuConfig"], 185);
    }
}
