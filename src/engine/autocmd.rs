//! Best-effort auto-command on appearance.
//!
//! When an observed device appears and a command is configured, the engine
//! opens a throwaway link, writes the payload once and releases the link.
//! The whole exchange is invisible to the application: no session is bound,
//! no events are emitted and failures only log. There are no retries; the
//! next appearance is the next attempt.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::models::{normalize_uuid, AutoCommandConfig, WriteMode};
use crate::domain::store::Store;
use crate::error::EngineError;
use crate::infrastructure::adapter::PlatformAdapter;

/// Devices with an auto-command exchange currently in flight. The event
/// router consults this set to suppress the exchange's platform events.
pub type InFlightSet = Arc<Mutex<HashSet<String>>>;

/// How long the marker outlives the exchange. Platforms report the link drop
/// asynchronously, so the marker must survive until the router claims it; the
/// grace timer reaps it when no report ever arrives.
pub const LINK_DROP_GRACE: Duration = Duration::from_secs(5);

/// Entry point spawned from the accepted `appeared` wake path.
pub async fn run_on_appear(
    adapter: Arc<dyn PlatformAdapter>,
    store: Arc<Store>,
    in_flight: InFlightSet,
    device_id: String,
) {
    let Some(config) = store.auto_command() else {
        debug!(device = %device_id, "No auto-command configured");
        return;
    };
    if config.payload.is_empty() {
        warn!(device = %device_id, "Auto-command has an empty payload; skipping");
        return;
    }
    if !in_flight.lock().unwrap().insert(device_id.clone()) {
        debug!(device = %device_id, "Auto-command already in flight");
        return;
    }

    let outcome = execute(adapter.as_ref(), &config, &device_id).await;
    // Release the link whatever happened above.
    if let Err(e) = adapter.disconnect(&device_id).await {
        debug!(device = %device_id, error = %e, "Auto-command cleanup disconnect failed");
    }
    let marker = in_flight.clone();
    let marker_id = device_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(LINK_DROP_GRACE).await;
        if marker.lock().unwrap().remove(&marker_id) {
            debug!(device = %marker_id, "Auto-command marker expired unclaimed");
        }
    });

    match outcome {
        Ok(()) => info!(
            device = %device_id,
            characteristic = %config.characteristic,
            bytes = config.payload.len(),
            "Auto-command delivered"
        ),
        Err(e) => warn!(device = %device_id, error = %e, "Auto-command aborted"),
    }
}

async fn execute(
    adapter: &dyn PlatformAdapter,
    config: &AutoCommandConfig,
    device_id: &str,
) -> Result<(), EngineError> {
    adapter.connect(device_id, false).await?;
    let services = adapter.discover_services(device_id).await?;

    let service_uuid = normalize_uuid(&config.service);
    let characteristic_uuid = normalize_uuid(&config.characteristic);
    let not_found = || EngineError::CharacteristicNotFound {
        service: config.service.clone(),
        characteristic: config.characteristic.clone(),
    };

    let service = services
        .iter()
        .find(|s| normalize_uuid(&s.uuid) == service_uuid)
        .ok_or_else(not_found)?;
    let characteristic = service
        .characteristics
        .iter()
        .find(|c| normalize_uuid(&c.uuid) == characteristic_uuid)
        .ok_or_else(not_found)?;
    if !characteristic.is_writable() {
        return Err(EngineError::OperationUnwritable(
            config.characteristic.clone(),
        ));
    }

    adapter
        .write_characteristic(
            device_id,
            &config.service,
            &config.characteristic,
            &config.payload,
            WriteMode::WithResponse,
        )
        .await?;
    Ok(())
}
