//! Shared test harness: a scripted platform adapter plus a channel-backed
//! wake context, wired into a fresh engine per test.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bluelink::{
    AdapterError, Association, CharacteristicInfo, CharacteristicProperties, ConnectionPriority,
    Engine, EngineError, EngineEvent, NotifyMode, ObservedTarget, PeripheralSnapshot,
    PlatformAdapter, PlatformEvent, PresenceCapabilities, ServiceInfo, Store, WakeContext,
    WakeContextFactory, WakeEvent, WakeHandles, WriteMode,
};

#[derive(Default)]
struct MockState {
    topologies: HashMap<String, Vec<ServiceInfo>>,
    connected_snapshots: Vec<PeripheralSnapshot>,
    fail_connect: HashSet<String>,
    hang_connect: HashSet<String>,
    fail_discover: HashSet<String>,
    calls: Vec<String>,
}

pub struct MockAdapter {
    pub events_tx: mpsc::UnboundedSender<PlatformEvent>,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events_tx,
                state: Mutex::new(MockState::default()),
            }),
            events_rx,
        )
    }

    pub fn set_topology(&self, device_id: &str, services: Vec<ServiceInfo>) {
        self.state
            .lock()
            .unwrap()
            .topologies
            .insert(device_id.to_string(), services);
    }

    pub fn set_connected_peripherals(&self, snapshots: Vec<PeripheralSnapshot>) {
        self.state.lock().unwrap().connected_snapshots = snapshots;
    }

    pub fn fail_connect_for(&self, device_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_connect
            .insert(device_id.to_string());
    }

    /// Make connects to this device block forever, like a pending connect
    /// against an out-of-range peripheral.
    pub fn hang_connect_for(&self, device_id: &str) {
        self.state
            .lock()
            .unwrap()
            .hang_connect
            .insert(device_id.to_string());
    }

    pub fn fail_discover_for(&self, device_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_discover
            .insert(device_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    async fn is_available(&self) -> bool {
        true
    }

    async fn start_scan(&self, service_filter: Option<&str>) -> Result<(), AdapterError> {
        self.record(format!("start_scan:{}", service_filter.unwrap_or("*")));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.record("stop_scan".to_string());
        Ok(())
    }

    async fn connect(&self, device_id: &str, pending: bool) -> Result<(), AdapterError> {
        self.record(format!("connect:{device_id}:pending={pending}"));
        let (fail, hang) = {
            let state = self.state.lock().unwrap();
            (
                state.fail_connect.contains(device_id),
                state.hang_connect.contains(device_id),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(AdapterError::ConnectFailed("scripted failure".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), AdapterError> {
        self.record(format!("disconnect:{device_id}"));
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, AdapterError> {
        self.record(format!("discover:{device_id}"));
        let state = self.state.lock().unwrap();
        if state.fail_discover.contains(device_id) {
            return Err(AdapterError::OperationFailed("scripted failure".into()));
        }
        Ok(state.topologies.get(device_id).cloned().unwrap_or_default())
    }

    async fn read_characteristic(
        &self,
        device_id: &str,
        _service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        self.record(format!("read:{device_id}:{characteristic}"));
        Ok(vec![0xAB])
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        _service: &str,
        characteristic: &str,
        value: &[u8],
        _mode: WriteMode,
    ) -> Result<(), AdapterError> {
        let bytes = value
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.record(format!("write:{device_id}:{characteristic}:{bytes}"));
        Ok(())
    }

    async fn set_notify(
        &self,
        device_id: &str,
        _service: &str,
        characteristic: &str,
        mode: NotifyMode,
    ) -> Result<(), AdapterError> {
        self.record(format!("set_notify:{device_id}:{characteristic}:{mode:?}"));
        Ok(())
    }

    async fn read_rssi(&self, device_id: &str) -> Result<i16, AdapterError> {
        self.record(format!("read_rssi:{device_id}"));
        Ok(-42)
    }

    async fn request_mtu(&self, device_id: &str, expected: u16) -> Result<u16, AdapterError> {
        self.record(format!("request_mtu:{device_id}:{expected}"));
        Ok(expected)
    }

    async fn request_latency(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
    ) -> Result<(), AdapterError> {
        self.record(format!("request_latency:{device_id}:{priority:?}"));
        Ok(())
    }

    async fn associate(
        &self,
        name_pattern: &str,
        _single_device: bool,
    ) -> Result<Association, AdapterError> {
        self.record(format!("associate:{name_pattern}"));
        Ok(Association {
            association_id: Some(7),
            device_id: Some("aa:bb:cc:dd:ee:01".into()),
            device_name: Some("Mock Sensor".into()),
        })
    }

    async fn observe_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError> {
        self.record(format!("observe:{:?}:{:?}", target.device_id, target.association_id));
        Ok(())
    }

    async fn stop_observing_presence(&self, target: &ObservedTarget) -> Result<(), AdapterError> {
        self.record(format!("stop_observe:{:?}", target.device_id));
        Ok(())
    }

    async fn remove_association(&self, target: &ObservedTarget) -> Result<(), AdapterError> {
        self.record(format!("remove_association:{:?}", target.association_id));
        Ok(())
    }

    async fn associations(&self) -> Result<Vec<Association>, AdapterError> {
        Ok(Vec::new())
    }

    async fn connected_peripherals(&self) -> Result<Vec<PeripheralSnapshot>, AdapterError> {
        self.record("connected_peripherals".to_string());
        Ok(self.state.lock().unwrap().connected_snapshots.clone())
    }

    fn capabilities(&self) -> PresenceCapabilities {
        PresenceCapabilities {
            is_supported: true,
            requires_association: true,
            presence_observation_available: true,
            minimum_os_version: "8.0".into(),
            current_os_version: "12".into(),
        }
    }
}

pub struct ChannelWakeFactory {
    pub sink: mpsc::UnboundedSender<WakeEvent>,
}

impl WakeContextFactory for ChannelWakeFactory {
    fn spawn_context(&self, _handles: &WakeHandles) -> Result<WakeContext, EngineError> {
        Ok(WakeContext {
            sink: self.sink.clone(),
        })
    }
}

pub struct Harness {
    pub engine: Engine,
    pub adapter: Arc<MockAdapter>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub wakes: mpsc::UnboundedReceiver<WakeEvent>,
    pub platform: mpsc::UnboundedSender<PlatformEvent>,
    pub store: Arc<Store>,
    _dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Build a harness after running `prepare` against the fresh store (register
/// handles, seed targets) before the engine starts.
pub fn harness_with(prepare: impl FnOnce(&Store)) -> Harness {
    let (adapter, platform_rx) = MockAdapter::new();
    let platform = adapter.events_tx.clone();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::with_path(dir.path().join("state.json")));
    store
        .set_wake_handles(WakeHandles {
            dispatcher_handle: 1,
            callback_handle: 2,
        })
        .unwrap();
    prepare(&store);
    let (wake_tx, wakes) = mpsc::unbounded_channel();
    let (engine, events) = Engine::new(
        adapter.clone(),
        platform_rx,
        store.clone(),
        Box::new(ChannelWakeFactory { sink: wake_tx }),
    );
    Harness {
        engine,
        adapter,
        events,
        wakes,
        platform,
        store,
        _dir: dir,
    }
}

/// The heart-rate style topology used across tests: one writable control
/// characteristic and one read-only measurement.
pub fn hr_topology() -> Vec<ServiceInfo> {
    vec![ServiceInfo {
        uuid: "180d".into(),
        characteristics: vec![
            CharacteristicInfo {
                uuid: "2a37".into(),
                properties: CharacteristicProperties {
                    write: true,
                    notify: true,
                    ..Default::default()
                },
            },
            CharacteristicInfo {
                uuid: "2a38".into(),
                properties: CharacteristicProperties {
                    read: true,
                    ..Default::default()
                },
            },
        ],
    }]
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Await the next `count` events in arrival order.
pub async fn collect_events(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    count: usize,
) -> Vec<EngineEvent> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        collected.push(next_event(events).await);
    }
    collected
}

/// Poll until the adapter has seen `count` calls with the given prefix.
pub async fn wait_for_count(adapter: &MockAdapter, prefix: &str, count: usize) {
    for _ in 0..500 {
        if adapter.count_calls(prefix) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "never saw {count} calls with prefix {prefix:?}; calls: {:?}",
        adapter.calls()
    );
}

/// Poll the adapter's call log until a call containing `needle` shows up.
pub async fn wait_for_call(adapter: &MockAdapter, needle: &str) {
    for _ in 0..500 {
        if adapter.calls().iter().any(|c| c.contains(needle)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "call containing {needle:?} never happened; calls: {:?}",
        adapter.calls()
    );
}
