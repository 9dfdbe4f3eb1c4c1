//! btleplug-backed platform adapter.
//!
//! Drives a real BLE central through btleplug. Presence observation is
//! emulated on top of advertisement tracking: a watched device "appears" when
//! an advertisement arrives and "disappears" after a silence window, since
//! desktop stacks have no companion-device service to lean on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    Association, ConnectionPriority, NotifyMode, ObservedTarget, WakeType, WriteMode,
};
use crate::infrastructure::adapter::{
    AdapterError, CharacteristicInfo, CharacteristicProperties, PeripheralSnapshot,
    PlatformAdapter, PlatformEvent, PresenceCapabilities, ServiceInfo,
};

const PRESENCE_POLL: Duration = Duration::from_secs(2);
const DISAPPEAR_AFTER: Duration = Duration::from_secs(10);
const PENDING_RETRY: Duration = Duration::from_secs(3);

struct WatchState {
    present: bool,
    last_seen: Option<tokio::time::Instant>,
}

#[derive(Default)]
struct BtleInner {
    peripheral_ids: HashMap<String, PeripheralId>,
    watched: HashMap<String, WatchState>,
    notification_pumps: HashSet<String>,
    /// Application-requested scan; presence watching may keep the stack
    /// scanning even when this is off.
    scanning: bool,
}

pub struct BtleAdapter {
    central: Adapter,
    events_tx: mpsc::UnboundedSender<PlatformEvent>,
    inner: Arc<Mutex<BtleInner>>,
}

impl BtleAdapter {
    /// Open the first system adapter and start the event pumps.
    pub async fn new() -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>)> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .context("No bluetooth adapter found")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            central,
            events_tx,
            inner: Arc::new(Mutex::new(BtleInner::default())),
        });

        tokio::spawn(adapter.clone().pump_central_events());
        tokio::spawn(adapter.clone().watch_presence());
        let _ = adapter
            .events_tx
            .send(PlatformEvent::AdapterStateChanged { available: true });
        info!("btleplug adapter initialized");
        Ok((adapter, events_rx))
    }

    async fn pump_central_events(self: Arc<Self>) {
        let mut events = match self.central.events().await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Could not subscribe to central events");
                return;
            }
        };
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    self.on_advertisement(id).await;
                }
                CentralEvent::DeviceDisconnected(id) => {
                    if let Some(device_id) = self.known_device_id(&id) {
                        let _ = self
                            .events_tx
                            .send(PlatformEvent::Disconnected { device_id });
                    }
                }
                _ => {}
            }
        }
        debug!("Central event stream ended");
    }

    async fn on_advertisement(&self, id: PeripheralId) {
        let Ok(peripheral) = self.central.peripheral(&id).await else {
            return;
        };
        let Ok(Some(props)) = peripheral.properties().await else {
            return;
        };
        let device_id = props.address.to_string().to_uppercase();

        let (appeared, forward_scan) = {
            let mut inner = self.inner.lock().unwrap();
            inner.peripheral_ids.insert(device_id.clone(), id);
            let appeared = match inner.watched.get_mut(&device_id) {
                Some(watch) => {
                    watch.last_seen = Some(tokio::time::Instant::now());
                    let appeared = !watch.present;
                    watch.present = true;
                    appeared
                }
                None => false,
            };
            (appeared, inner.scanning)
        };

        if appeared {
            let _ = self.events_tx.send(PlatformEvent::PresenceWake {
                device_id: Some(device_id.clone()),
                device_name: props.local_name.clone(),
                association_id: None,
                wake_type: WakeType::Appeared,
            });
        }
        if forward_scan {
            // Mirror the classic wire shape: company id (LE) + data of the
            // first manufacturer record.
            let manufacturer_data_head = props
                .manufacturer_data
                .iter()
                .next()
                .map(|(company, data)| {
                    let mut head = company.to_le_bytes().to_vec();
                    head.extend_from_slice(data);
                    head
                })
                .unwrap_or_default();
            let _ = self.events_tx.send(PlatformEvent::ScanResult {
                device_id,
                name: props.local_name,
                manufacturer_data_head,
                rssi: props.rssi.unwrap_or(0),
            });
        }
    }

    /// Silence-based disappearance detection for watched devices.
    async fn watch_presence(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PRESENCE_POLL).await;
            let now = tokio::time::Instant::now();
            let gone: Vec<String> = {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .watched
                    .iter_mut()
                    .filter(|(_, w)| {
                        w.present
                            && w.last_seen
                                .map_or(true, |seen| now.duration_since(seen) > DISAPPEAR_AFTER)
                    })
                    .map(|(id, w)| {
                        w.present = false;
                        id.clone()
                    })
                    .collect()
            };
            for device_id in gone {
                let _ = self.events_tx.send(PlatformEvent::PresenceWake {
                    device_id: Some(device_id),
                    device_name: None,
                    association_id: None,
                    wake_type: WakeType::Disappeared,
                });
            }
        }
    }

    fn known_device_id(&self, id: &PeripheralId) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .peripheral_ids
            .iter()
            .find(|&(_, pid)| pid == id)
            .map(|(device_id, _)| device_id.clone())
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, AdapterError> {
        let cached = {
            self.inner
                .lock()
                .unwrap()
                .peripheral_ids
                .get(device_id)
                .cloned()
        };
        if let Some(id) = cached {
            if let Ok(peripheral) = self.central.peripheral(&id).await {
                return Ok(peripheral);
            }
        }
        // Cache miss; ask the stack for everything it knows.
        let peripherals = self
            .central
            .peripherals()
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(device_id) {
                    self.inner
                        .lock()
                        .unwrap()
                        .peripheral_ids
                        .insert(device_id.to_string(), peripheral.id());
                    return Ok(peripheral);
                }
            }
        }
        Err(AdapterError::OperationFailed(format!(
            "peripheral {device_id} not known to the stack"
        )))
    }

    fn ensure_notification_pump(&self, device_id: &str, peripheral: Peripheral) {
        if !self
            .inner
            .lock()
            .unwrap()
            .notification_pumps
            .insert(device_id.to_string())
        {
            return;
        }
        let events_tx = self.events_tx.clone();
        let inner = self.inner.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            match peripheral.notifications().await {
                Ok(mut stream) => {
                    while let Some(notification) = stream.next().await {
                        let _ = events_tx.send(PlatformEvent::CharacteristicChanged {
                            device_id: device_id.clone(),
                            characteristic: notification.uuid.to_string(),
                            value: notification.value,
                        });
                    }
                }
                Err(e) => warn!(device = %device_id, error = %e, "Notification stream failed"),
            }
            inner.lock().unwrap().notification_pumps.remove(&device_id);
        });
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: &str,
        characteristic: &str,
    ) -> Result<Characteristic, AdapterError> {
        let service_uuid = parse_uuid(service)?;
        let characteristic_uuid = parse_uuid(characteristic)?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic_uuid && c.service_uuid == service_uuid)
            .ok_or_else(|| {
                AdapterError::OperationFailed(format!("characteristic {characteristic} not found"))
            })
    }

    async fn snapshot(peripheral: &Peripheral) -> Option<PeripheralSnapshot> {
        let props = peripheral.properties().await.ok()??;
        let connected = peripheral.is_connected().await.unwrap_or(false);
        Some(PeripheralSnapshot {
            device_id: props.address.to_string().to_uppercase(),
            name: props.local_name,
            connected,
            services: peripheral.services().iter().map(service_info).collect(),
            notifying: Vec::new(),
        })
    }
}

fn service_info(service: &btleplug::api::Service) -> ServiceInfo {
    ServiceInfo {
        uuid: service.uuid.to_string(),
        characteristics: service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid.to_string(),
                properties: CharacteristicProperties {
                    read: c.properties.contains(CharPropFlags::READ),
                    write: c.properties.contains(CharPropFlags::WRITE),
                    write_without_response: c
                        .properties
                        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    notify: c.properties.contains(CharPropFlags::NOTIFY),
                    indicate: c.properties.contains(CharPropFlags::INDICATE),
                },
            })
            .collect(),
    }
}

/// Accept both full uuids and 16-bit shorthand like "180d".
fn parse_uuid(value: &str) -> Result<Uuid, AdapterError> {
    let value = value.trim();
    let expanded = if value.len() == 4 {
        format!("0000{value}-0000-1000-8000-00805f9b34fb")
    } else {
        value.to_string()
    };
    Uuid::parse_str(&expanded)
        .map_err(|e| AdapterError::OperationFailed(format!("invalid uuid {value}: {e}")))
}

#[async_trait]
impl PlatformAdapter for BtleAdapter {
    async fn is_available(&self) -> bool {
        self.central.adapter_info().await.is_ok()
    }

    async fn start_scan(&self, service_filter: Option<&str>) -> Result<(), AdapterError> {
        let services = match service_filter {
            Some(filter) => vec![parse_uuid(filter)?],
            None => Vec::new(),
        };
        self.central
            .start_scan(ScanFilter { services })
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        self.inner.lock().unwrap().scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        let keep_radio_scanning = {
            let mut inner = self.inner.lock().unwrap();
            inner.scanning = false;
            !inner.watched.is_empty()
        };
        if !keep_radio_scanning {
            self.central
                .stop_scan()
                .await
                .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn connect(&self, device_id: &str, pending: bool) -> Result<(), AdapterError> {
        if !pending {
            let peripheral = self.peripheral(device_id).await?;
            peripheral
                .connect()
                .await
                .map_err(|e| AdapterError::ConnectFailed(e.to_string()))?;
            return Ok(());
        }
        // Pending connect: keep trying until the peripheral is in range.
        loop {
            if let Ok(peripheral) = self.peripheral(device_id).await {
                match peripheral.connect().await {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!(device = %device_id, error = %e, "Pending connect retry"),
                }
            }
            tokio::time::sleep(PENDING_RETRY).await;
        }
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))
    }

    async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        Ok(peripheral.services().iter().map(service_info).collect())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;
        peripheral
            .read(&target)
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&target, value, write_type)
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))
    }

    async fn set_notify(
        &self,
        device_id: &str,
        service: &str,
        characteristic: &str,
        mode: NotifyMode,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;
        match mode {
            NotifyMode::Disabled => peripheral
                .unsubscribe(&target)
                .await
                .map_err(|e| AdapterError::OperationFailed(e.to_string()))?,
            NotifyMode::Notification | NotifyMode::Indication => {
                peripheral
                    .subscribe(&target)
                    .await
                    .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
                // Safe to call repeatedly; only the first spawns a pump.
                self.ensure_notification_pump(device_id, peripheral);
            }
        }
        Ok(())
    }

    async fn read_rssi(&self, device_id: &str) -> Result<i16, AdapterError> {
        let peripheral = self.peripheral(device_id).await?;
        let props = peripheral
            .properties()
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        props
            .and_then(|p| p.rssi)
            .ok_or(AdapterError::Unsupported("rssi read"))
    }

    async fn request_mtu(&self, _device_id: &str, _expected: u16) -> Result<u16, AdapterError> {
        Err(AdapterError::Unsupported("mtu negotiation"))
    }

    async fn request_latency(
        &self,
        _device_id: &str,
        _priority: ConnectionPriority,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("connection priority"))
    }

    async fn associate(
        &self,
        _name_pattern: &str,
        _single_device: bool,
    ) -> Result<Association, AdapterError> {
        // No companion pairing dialog on desktop stacks; succeed without an
        // association id so the caller proceeds with device-id targets.
        Ok(Association::default())
    }

    async fn observe_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError> {
        let Some(device_id) = &target.device_id else {
            return Err(AdapterError::Unsupported("association-based observation"));
        };
        self.inner.lock().unwrap().watched.insert(
            device_id.clone(),
            WatchState {
                present: false,
                last_seen: None,
            },
        );
        // Watching requires advertisements flowing.
        self.central
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))
    }

    async fn stop_observing_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError> {
        let stop_radio = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(device_id) = &target.device_id {
                inner.watched.remove(device_id);
            }
            inner.watched.is_empty() && !inner.scanning
        };
        if stop_radio {
            self.central
                .stop_scan()
                .await
                .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn remove_association(&self, _target: &ObservedTarget) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn associations(&self) -> Result<Vec<Association>, AdapterError> {
        Ok(Vec::new())
    }

    async fn connected_peripherals(&self) -> Result<Vec<PeripheralSnapshot>, AdapterError> {
        let peripherals = self
            .central
            .peripherals()
            .await
            .map_err(|e| AdapterError::OperationFailed(e.to_string()))?;
        let mut snapshots = Vec::new();
        for peripheral in peripherals {
            if let Some(snapshot) = Self::snapshot(&peripheral).await {
                if snapshot.connected {
                    snapshots.push(snapshot);
                }
            }
        }
        Ok(snapshots)
    }

    fn capabilities(&self) -> PresenceCapabilities {
        PresenceCapabilities {
            is_supported: true,
            requires_association: false,
            presence_observation_available: true,
            minimum_os_version: "any".to_string(),
            current_os_version: std::env::consts::OS.to_string(),
        }
    }
}
