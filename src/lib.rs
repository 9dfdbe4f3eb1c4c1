//! BLE connection and presence orchestration engine.
//!
//! The engine owns the central-role lifecycle for any number of peripherals:
//! per-device connection sessions with serialized GATT operations, a presence
//! wake pipeline for background launches, auto-reconnect of persisted targets
//! and a best-effort auto-command on appearance. Platform stacks plug in
//! behind [`PlatformAdapter`]; a btleplug implementation ships behind the
//! `btleplug-adapter` feature.

pub mod domain;
pub mod engine;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    Association, AutoCommandConfig, ConnectionPriority, DeviceRecord, EngineEvent, NotifyMode,
    ObservedTarget, OperationStatus, SessionState, WakeEvent, WakeHandles, WakeType, WriteMode,
};
pub use domain::store::Store;
pub use engine::wake::{WakeContext, WakeContextFactory};
pub use engine::Engine;
pub use error::EngineError;
pub use infrastructure::adapter::{
    AdapterError, CharacteristicInfo, CharacteristicProperties, PeripheralSnapshot,
    PlatformAdapter, PlatformEvent, PresenceCapabilities, PresenceMode, ServiceInfo,
};
#[cfg(feature = "btleplug-adapter")]
pub use infrastructure::btle::BtleAdapter;
pub use infrastructure::logging::{init_logger, LogSettings, LoggingGuard};
