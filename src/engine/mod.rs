//! Engine facade and platform event router.
//!
//! `Engine` is the process-scoped entry point: the host constructs it with a
//! platform adapter, the adapter's event channel, a persisted store and a
//! wake context factory, then drives it through async commands and consumes
//! the returned event stream.

pub mod autocmd;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod wake;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::models::{
    normalize_device_id, normalize_uuid, Association, ConnectionPriority, DeviceRecord,
    EngineEvent, NotifyMode, ObservedTarget, WakeEvent, WakeHandles, WakeType, WriteMode,
};
use crate::domain::models::epoch_millis;
use crate::domain::store::Store;
use crate::error::EngineError;
use crate::infrastructure::adapter::{
    AdapterError, PlatformAdapter, PlatformEvent, PresenceCapabilities, PresenceMode,
};
use registry::Registry;
use session::{new_session_parts, run_session, SessionContext, SessionHandle, SessionOp,
    SessionOrigin};
use wake::{Dispatcher, WakeContextFactory, WakePipeline};

pub(crate) struct EngineShared {
    pub(crate) adapter: Arc<dyn PlatformAdapter>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: Arc<Store>,
    pub(crate) pipeline: Arc<WakePipeline>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) autocmd_inflight: autocmd::InFlightSet,
    pub(crate) capabilities: PresenceCapabilities,
    pub(crate) mode: PresenceMode,
}

impl EngineShared {
    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.pipeline.clone())
    }

    /// Bind and launch a session worker. Returns false when the device
    /// already has a live session.
    pub(crate) fn spawn_session(&self, device_id: &str, origin: SessionOrigin) -> bool {
        let token = self.registry.next_token();
        let (handle, ops_rx) = new_session_parts(token);
        let ctx = SessionContext {
            device_id: device_id.to_string(),
            token,
            adapter: self.adapter.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher(),
            cache: handle.cache.clone(),
            state: handle.state.clone(),
        };
        self.registry.ensure_record(device_id);
        if !self.registry.bind(device_id, handle) {
            return false;
        }
        let task = tokio::spawn(run_session(ctx, origin, ops_rx));
        self.tasks.lock().unwrap().push(task);
        true
    }

    /// Resolve a record, repopulating once from the platform's connected
    /// peripherals when the registry is empty.
    pub(crate) async fn resolve_device(&self, device_id: &str) -> Result<DeviceRecord, EngineError> {
        if let Some(record) = self.registry.lookup(device_id) {
            return Ok(record);
        }
        if self.registry.records_empty() {
            match self.adapter.connected_peripherals().await {
                Ok(peripherals) => {
                    info!(found = peripherals.len(), "Repopulating registry from platform");
                    for snapshot in &peripherals {
                        self.registry.upsert_snapshot(snapshot);
                    }
                    self.dispatcher().send(EngineEvent::RepopulatedPeripherals {
                        found: peripherals.len(),
                    });
                }
                Err(e) => warn!(error = %e, "Repopulation failed"),
            }
            if let Some(record) = self.registry.lookup(device_id) {
                return Ok(record);
            }
        }
        Err(EngineError::UnknownDevice(device_id.to_string()))
    }

    /// Route one presence signal through the wake pipeline, kicking the
    /// auto-command exchange on accepted appearances.
    pub(crate) fn handle_presence_wake(
        &self,
        device_id: Option<String>,
        device_name: Option<String>,
        association_id: Option<i64>,
        wake_type: WakeType,
    ) {
        let device_id = device_id
            .map(|id| normalize_device_id(&id))
            .filter(|id| !id.is_empty());
        let event = WakeEvent {
            device_id: device_id.clone(),
            device_name,
            wake_type,
            association_id,
            timestamp: epoch_millis(),
        };
        let accepted = self.pipeline.handle_wake(event);
        if accepted && wake_type == WakeType::Appeared {
            if let Some(id) = device_id {
                let adapter = self.adapter.clone();
                let store = self.store.clone();
                let in_flight = self.autocmd_inflight.clone();
                tokio::spawn(autocmd::run_on_appear(adapter, store, in_flight, id));
            }
        }
    }

    /// A link dropped underneath us. Sessions tear down through their worker;
    /// observed targets get exactly one re-armed pending connect unless the
    /// drop was application-requested.
    pub(crate) fn handle_platform_disconnect(self: Arc<Self>, device_id: &str) {
        // An auto-command exchange owns this drop; claiming the marker here
        // keeps the whole exchange invisible to the application.
        if self.autocmd_inflight.lock().unwrap().remove(device_id) {
            debug!(device = %device_id, "Suppressing auto-command link drop");
            return;
        }
        let Some(handle) = self.registry.take_session(device_id) else {
            // Peripheral we never tracked in this process lifetime.
            self.dispatcher().send(EngineEvent::Disconnected {
                device_id: device_id.to_string(),
            });
            if self.store.is_observed_device(device_id) {
                self.re_arm(device_id);
            }
            return;
        };
        let explicit = handle.explicit_disconnect.load(Ordering::SeqCst);
        let _ = handle.ops.send(SessionOp::ConnectionLost);
        if !explicit && self.store.is_observed_device(device_id) {
            info!(device = %device_id, "Unexpected disconnect of observed target");
            let device_id = device_id.to_string();
            tokio::spawn(async move {
                // The dead worker drops its receiver once teardown is done,
                // so the replacement's `connected` can never precede the old
                // session's `disconnected`.
                handle.ops.closed().await;
                self.re_arm(&device_id);
            });
        }
    }
}

/// Single consumer of unsolicited platform activity.
async fn run_router(shared: Arc<EngineShared>, mut rx: mpsc::UnboundedReceiver<PlatformEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PlatformEvent::AdapterStateChanged { available } => {
                if available {
                    shared.restore_pending().await;
                } else {
                    debug!("Adapter went unavailable");
                }
            }
            PlatformEvent::ScanResult {
                device_id,
                name,
                manufacturer_data_head,
                rssi,
            } => {
                let id = normalize_device_id(&device_id);
                shared.registry.upsert_advertisement(&id, name.as_deref(), Some(rssi));
                shared.dispatcher().send(EngineEvent::ScanResult {
                    device_id: id,
                    name: name.unwrap_or_default(),
                    manufacturer_data_head,
                    rssi,
                });
            }
            PlatformEvent::Disconnected { device_id } => {
                shared
                    .clone()
                    .handle_platform_disconnect(&normalize_device_id(&device_id));
            }
            PlatformEvent::CharacteristicChanged {
                device_id,
                characteristic,
                value,
            } => {
                let id = normalize_device_id(&device_id);
                if shared.autocmd_inflight.lock().unwrap().contains(&id) {
                    continue;
                }
                shared.dispatcher().send(EngineEvent::CharacteristicChanged {
                    device_id: id,
                    characteristic: normalize_uuid(&characteristic),
                    value,
                });
            }
            PlatformEvent::PresenceWake {
                device_id,
                device_name,
                association_id,
                wake_type,
            } => {
                shared.handle_presence_wake(device_id, device_name, association_id, wake_type);
            }
            PlatformEvent::StateRestored { peripherals } => {
                shared.handle_state_restored(peripherals);
            }
        }
    }
}

pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Construct the engine and return it alongside its event stream.
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
        store: Arc<Store>,
        wake_factory: Box<dyn WakeContextFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let capabilities = adapter.capabilities();
        let mode = capabilities.mode();
        let pipeline = Arc::new(WakePipeline::new(events_tx, wake_factory, store.clone()));
        let shared = Arc::new(EngineShared {
            adapter,
            registry: Arc::new(Registry::new()),
            store,
            pipeline,
            tasks: Mutex::new(Vec::new()),
            autocmd_inflight: Arc::new(Mutex::new(HashSet::new())),
            capabilities,
            mode,
        });
        let router = tokio::spawn(run_router(shared.clone(), platform_events));
        shared.tasks.lock().unwrap().push(router);
        info!(mode = ?shared.mode, "Engine started");
        (Self { shared }, events_rx)
    }

    pub async fn is_bluetooth_available(&self) -> bool {
        self.shared.adapter.is_available().await
    }

    pub async fn start_scan(&self, service_filter: Option<&str>) -> Result<(), EngineError> {
        self.shared.adapter.start_scan(service_filter).await?;
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<(), EngineError> {
        self.shared.adapter.stop_scan().await?;
        Ok(())
    }

    /// Establish a session. Idempotent: a second connect while a session
    /// exists (in any state) is a no-op.
    pub async fn connect(&self, device_id: &str) -> Result<(), EngineError> {
        self.connect_inner(device_id, false).await
    }

    /// Like [`connect`](Self::connect) but the request stays armed until the
    /// peripheral comes into range.
    pub async fn auto_connect(&self, device_id: &str) -> Result<(), EngineError> {
        self.connect_inner(device_id, true).await
    }

    async fn connect_inner(&self, device_id: &str, pending: bool) -> Result<(), EngineError> {
        let id = normalize_device_id(device_id);
        if self.shared.registry.session(&id).is_some() {
            debug!(device = %id, "Connect ignored; session already exists");
            return Ok(());
        }
        self.shared.resolve_device(&id).await?;
        self.shared.spawn_session(&id, SessionOrigin::Fresh { pending });
        Ok(())
    }

    /// Tear down a session. Removes any persisted presence target for the
    /// device first so the supervisor will not re-arm. An unknown id still
    /// emits a best-effort `disconnecting` event before erroring.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), EngineError> {
        let id = normalize_device_id(device_id);
        if let Err(e) = self.shared.store.remove_device_target(&id) {
            warn!(device = %id, error = %e, "Failed to drop persisted target");
        }
        match self.shared.registry.session(&id) {
            Some(handle) => {
                handle.explicit_disconnect.store(true, Ordering::SeqCst);
                let _ = handle.ops.send(SessionOp::Disconnect);
                Ok(())
            }
            None => {
                self.shared.dispatcher().send(EngineEvent::Disconnecting {
                    device_id: id.clone(),
                });
                Err(EngineError::UnknownDevice(id))
            }
        }
    }

    pub async fn discover_services(&self, device_id: &str) -> Result<(), EngineError> {
        self.enqueue(device_id, SessionOp::Discover)
    }

    pub async fn read_value(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<(), EngineError> {
        self.enqueue(
            device_id,
            SessionOp::Read {
                service: service.to_string(),
                characteristic: normalize_uuid(characteristic),
            },
        )
    }

    /// Queue a write. The characteristic must be present in the session's
    /// discovered topology and carry a write property; otherwise the command
    /// fails without touching the radio.
    pub async fn write_value(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        value: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        let id = normalize_device_id(device_id);
        let handle = self.session_or_err(&id)?;
        let service_key = normalize_uuid(service);
        let characteristic_key = normalize_uuid(characteristic);
        {
            let cache = handle.cache.lock().unwrap();
            let not_found = || EngineError::CharacteristicNotFound {
                service: service.to_string(),
                characteristic: characteristic.to_string(),
            };
            let characteristics = cache.get(&service_key).ok_or_else(not_found)?;
            let info = characteristics
                .iter()
                .find(|c| c.uuid == characteristic_key)
                .ok_or_else(not_found)?;
            if !info.is_writable() {
                return Err(EngineError::OperationUnwritable(characteristic.to_string()));
            }
        }
        handle
            .ops
            .send(SessionOp::Write {
                service: service.to_string(),
                characteristic: characteristic_key,
                value,
                mode,
            })
            .map_err(|_| EngineError::UnknownDevice(id))?;
        Ok(())
    }

    pub async fn set_notifiable(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        mode: NotifyMode,
    ) -> Result<(), EngineError> {
        self.enqueue(
            device_id,
            SessionOp::SetNotify {
                service: service.to_string(),
                characteristic: normalize_uuid(characteristic),
                mode,
            },
        )
    }

    pub async fn read_rssi(&self, device_id: &str) -> Result<(), EngineError> {
        self.enqueue(device_id, SessionOp::ReadRssi)
    }

    pub async fn request_mtu(&self, device_id: &str, expected: u16) -> Result<(), EngineError> {
        self.enqueue(device_id, SessionOp::RequestMtu { expected })
    }

    pub async fn request_latency(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
    ) -> Result<(), EngineError> {
        self.enqueue(device_id, SessionOp::RequestLatency { priority })
    }

    fn enqueue(&self, device_id: &str, op: SessionOp) -> Result<(), EngineError> {
        let id = normalize_device_id(device_id);
        let handle = self.session_or_err(&id)?;
        handle
            .ops
            .send(op)
            .map_err(|_| EngineError::UnknownDevice(id))?;
        Ok(())
    }

    fn session_or_err(&self, id: &str) -> Result<SessionHandle, EngineError> {
        self.shared
            .registry
            .session(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))
    }

    /// Presence feature support negotiated at startup.
    pub fn presence_capabilities(&self) -> PresenceCapabilities {
        self.shared.capabilities.clone()
    }

    /// Persist the callback handles used to spawn a background wake context
    /// after process death.
    pub fn register_wake_callback(&self, handles: WakeHandles) -> Result<(), EngineError> {
        self.shared
            .store
            .set_wake_handles(handles)
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Run the platform pairing flow for devices matching `name_pattern`.
    pub async fn associate_device(
        &self,
        name_pattern: &str,
        single_device: bool,
    ) -> Result<Association, EngineError> {
        if self.shared.mode == PresenceMode::Unsupported {
            return Err(EngineError::CapabilityUnavailable(
                "device association".to_string(),
            ));
        }
        match self.shared.adapter.associate(name_pattern, single_device).await {
            Ok(mut association) => {
                association.device_id = association
                    .device_id
                    .map(|id| normalize_device_id(&id));
                Ok(association)
            }
            Err(AdapterError::UserCancelled) => Err(EngineError::UserCancelled),
            Err(AdapterError::AssociationFailed(msg)) => Err(EngineError::AssociationFailed(msg)),
            Err(e) => Err(e.into()),
        }
    }

    /// Start watching a target for presence and persist it. A device-bound
    /// target also gets a pending connect so appearance is never missed.
    pub async fn start_presence_observation(
        &self,
        target: ObservedTarget,
    ) -> Result<(), EngineError> {
        if self.shared.mode != PresenceMode::Full {
            return Err(EngineError::CapabilityUnavailable(
                "presence observation".to_string(),
            ));
        }
        let target = canonical_target(target)?;
        self.shared
            .store
            .add_target(target.clone())
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if let Err(e) = self.shared.adapter.observe_presence(&target).await {
            let _ = self.shared.store.remove_target(&target);
            return Err(e.into());
        }
        if let Some(id) = &target.device_id {
            if self.shared.registry.session(id).is_none() {
                self.shared
                    .spawn_session(id, SessionOrigin::Fresh { pending: true });
            }
        }
        Ok(())
    }

    /// Stop watching a target, drop its persistence and cancel any pending
    /// or live connection.
    pub async fn stop_presence_observation(
        &self,
        target: ObservedTarget,
    ) -> Result<(), EngineError> {
        let target = canonical_target(target)?;
        self.shared
            .store
            .remove_target(&target)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if let Err(e) = self.shared.adapter.stop_observing_presence(&target).await {
            warn!(error = %e, "Failed to stop platform observation");
        }
        if let Some(id) = &target.device_id {
            if let Some(handle) = self.shared.registry.session(id) {
                handle.explicit_disconnect.store(true, Ordering::SeqCst);
                let _ = handle.ops.send(SessionOp::Disconnect);
            }
        }
        Ok(())
    }

    /// Persisted targets, enriched with the latest advertised names.
    pub async fn list_observed_devices(&self) -> Result<Vec<Association>, EngineError> {
        Ok(self
            .shared
            .store
            .targets()
            .into_iter()
            .map(|target| {
                let device_name = target
                    .device_id
                    .as_deref()
                    .and_then(|id| self.shared.registry.lookup(id))
                    .and_then(|record| record.name);
                Association {
                    association_id: target.association_id,
                    device_id: target.device_id,
                    device_name,
                }
            })
            .collect())
    }

    /// Forget a target entirely: observation, platform association and
    /// persistence. Best-effort on the platform side.
    pub async fn remove_observation(&self, target: ObservedTarget) -> Result<(), EngineError> {
        let target = canonical_target(target)?;
        self.shared
            .store
            .remove_target(&target)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if let Err(e) = self.shared.adapter.stop_observing_presence(&target).await {
            debug!(error = %e, "Stop observation during removal failed");
        }
        if let Err(e) = self.shared.adapter.remove_association(&target).await {
            debug!(error = %e, "Association removal skipped");
        }
        if let Some(id) = &target.device_id {
            if let Some(handle) = self.shared.registry.session(id) {
                handle.explicit_disconnect.store(true, Ordering::SeqCst);
                let _ = handle.ops.send(SessionOp::Disconnect);
            }
        }
        Ok(())
    }

    /// Configure the command written automatically when an observed device
    /// appears. Payload bytes are clamped to 0-255.
    pub fn set_auto_command_on_appear(
        &self,
        service: &str,
        characteristic: &str,
        payload: &[i64],
    ) -> Result<(), EngineError> {
        if service.trim().is_empty() || characteristic.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "service and characteristic are required".to_string(),
            ));
        }
        let bytes = crate::domain::models::AutoCommandConfig::clamp_payload(payload);
        self.shared
            .store
            .set_auto_command(service, characteristic, &bytes)
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn clear_auto_command_on_appear(&self) -> Result<(), EngineError> {
        self.shared
            .store
            .clear_auto_command()
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// The background wake context finished initializing.
    pub fn signal_wake_ready(&self) {
        self.shared.pipeline.signal_ready();
    }

    /// Foreground handoff: reset the wake pipeline for the next background
    /// lifecycle.
    pub fn teardown_wake_context(&self) {
        self.shared.pipeline.teardown();
    }

    /// Stop all engine tasks. Sessions and the router are aborted; the wake
    /// pipeline is reset.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.shared.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.shared.pipeline.teardown();
        info!("Engine stopped");
    }
}

/// Validate and normalize a presence target: at least one identity must be
/// present; the adapter prefers the association id when both are set.
fn canonical_target(target: ObservedTarget) -> Result<ObservedTarget, EngineError> {
    let device_id = target
        .device_id
        .as_deref()
        .map(normalize_device_id)
        .filter(|id| !id.is_empty());
    if device_id.is_none() && target.association_id.is_none() {
        return Err(EngineError::InvalidArgument(
            "deviceId or associationId is required".to_string(),
        ));
    }
    Ok(ObservedTarget {
        device_id,
        association_id: target.association_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_target() {
        let target = canonical_target(ObservedTarget {
            device_id: Some("aa:bb:cc:dd:ee:ff".into()),
            association_id: Some(4),
        })
        .unwrap();
        assert_eq!(target.device_id.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(target.association_id, Some(4));

        let err = canonical_target(ObservedTarget {
            device_id: Some("  ".into()),
            association_id: None,
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
