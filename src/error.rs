//! Error taxonomy for the engine command surface.
//!
//! Every command either resolves with a value or with one of these structured
//! errors; connection and discovery failures are reported through the event
//! stream instead, since BLE links are inherently transient.

use thiserror::Error;

use crate::infrastructure::adapter::AdapterError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation referenced a device id with no live session or record.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Presence/companion features are not available on this platform.
    #[error("presence capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The platform pairing flow failed.
    #[error("association failed: {0}")]
    AssociationFailed(String),

    /// The user dismissed the platform pairing dialog.
    #[error("association cancelled by user")]
    UserCancelled,

    /// The requested characteristic is not present in the session's
    /// discovered topology.
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        service: String,
        characteristic: String,
    },

    /// Write requested against a characteristic with no write property.
    #[error("characteristic {0} has no write property")]
    OperationUnwritable(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable code accompanying the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            EngineError::CapabilityUnavailable(_) => "CAPABILITY_UNAVAILABLE",
            EngineError::AssociationFailed(_) => "ASSOCIATION_FAILED",
            EngineError::UserCancelled => "USER_CANCELLED",
            EngineError::CharacteristicNotFound { .. } => "CHARACTERISTIC_NOT_FOUND",
            EngineError::OperationUnwritable(_) => "OPERATION_UNWRITABLE",
            EngineError::Timeout(_) => "TIMEOUT",
            EngineError::InvalidArgument(_) => "INVALID_ARGUMENTS",
            EngineError::Adapter(_) => "ADAPTER_ERROR",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }
}
