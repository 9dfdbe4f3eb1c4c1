//! Connection session state machine and GATT operation serializer.
//!
//! Each connected device gets one worker task owning the link lifecycle:
//! Disconnected -> Connecting -> Connected -> Discovering -> Ready ->
//! Disconnecting -> Disconnected. Operations queue on an unbounded channel
//! and the worker awaits each native call to completion before dequeuing the
//! next, so at most one operation is in flight per device while independent
//! devices proceed in parallel.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::models::{
    normalize_uuid, ConnectionPriority, EngineEvent, NotifyMode, OperationStatus, SessionState,
    WriteMode,
};
use crate::engine::registry::Registry;
use crate::engine::wake::Dispatcher;
use crate::infrastructure::adapter::{CharacteristicInfo, PeripheralSnapshot, PlatformAdapter};

/// Discovered topology: service uuid -> characteristics.
pub type ServiceCache = BTreeMap<String, Vec<CharacteristicInfo>>;

/// One queued GATT operation.
#[derive(Debug)]
pub enum SessionOp {
    Discover,
    Read {
        service: String,
        characteristic: String,
    },
    Write {
        service: String,
        characteristic: String,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        service: String,
        characteristic: String,
        mode: NotifyMode,
    },
    ReadRssi,
    RequestMtu {
        expected: u16,
    },
    RequestLatency {
        priority: ConnectionPriority,
    },
    /// Application-requested teardown.
    Disconnect,
    /// The platform reported the link gone underneath us.
    ConnectionLost,
}

/// How a session comes into existence.
pub enum SessionOrigin {
    /// Fresh link establishment; `pending` keeps the request armed until the
    /// peripheral is in range.
    Fresh { pending: bool },
    /// The platform already holds this link (state restoration); the worker
    /// synthesizes connection and discovery events from the snapshot instead
    /// of touching the radio.
    Restored { snapshot: PeripheralSnapshot },
}

/// Shared view of a session stored in the registry.
#[derive(Clone)]
pub struct SessionHandle {
    pub token: u64,
    pub ops: mpsc::UnboundedSender<SessionOp>,
    pub cache: Arc<Mutex<ServiceCache>>,
    pub state: Arc<Mutex<SessionState>>,
    pub explicit_disconnect: Arc<AtomicBool>,
}

/// Build a handle plus the worker's receiving end.
pub fn new_session_parts(token: u64) -> (SessionHandle, mpsc::UnboundedReceiver<SessionOp>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        token,
        ops: tx,
        cache: Arc::new(Mutex::new(ServiceCache::new())),
        state: Arc::new(Mutex::new(SessionState::Disconnected)),
        explicit_disconnect: Arc::new(AtomicBool::new(false)),
    };
    (handle, rx)
}

/// Everything a session worker needs.
pub struct SessionContext {
    pub device_id: String,
    pub token: u64,
    pub adapter: Arc<dyn PlatformAdapter>,
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub cache: Arc<Mutex<ServiceCache>>,
    pub state: Arc<Mutex<SessionState>>,
}

impl SessionContext {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Session worker entry point.
pub async fn run_session(
    ctx: SessionContext,
    origin: SessionOrigin,
    mut ops: mpsc::UnboundedReceiver<SessionOp>,
) {
    match origin {
        SessionOrigin::Fresh { pending } => {
            if !establish(&ctx, pending, &mut ops).await {
                return;
            }
        }
        SessionOrigin::Restored { snapshot } => synthesize_restored(&ctx, snapshot),
    }

    let mut lost = false;
    while let Some(op) = ops.recv().await {
        match op {
            SessionOp::Disconnect => break,
            SessionOp::ConnectionLost => {
                lost = true;
                break;
            }
            op => handle_op(&ctx, op).await,
        }
    }

    if lost {
        teardown_lost(&ctx, &mut ops);
    } else {
        // Explicit disconnect, or the engine dropped the channel on shutdown.
        ctx.set_state(SessionState::Disconnecting);
        ctx.dispatcher.send(EngineEvent::Disconnecting {
            device_id: ctx.device_id.clone(),
        });
        fail_queued(&ctx, &mut ops);
        if let Err(e) = ctx.adapter.disconnect(&ctx.device_id).await {
            warn!(device = %ctx.device_id, error = %e, "Disconnect failed");
        }
        finish(&ctx);
    }
}

/// Drive the native connect while staying responsive to teardown: Disconnect
/// and ConnectionLost preempt an in-flight connect, which matters for pending
/// connects that stay armed until the peripheral comes into range. Other
/// operations submitted meanwhile are deferred behind link-up. Returns false
/// when the session ended here.
async fn establish(
    ctx: &SessionContext,
    pending: bool,
    ops: &mut mpsc::UnboundedReceiver<SessionOp>,
) -> bool {
    ctx.set_state(SessionState::Connecting);
    info!(device = %ctx.device_id, pending, "Connecting");
    let connect = ctx.adapter.connect(&ctx.device_id, pending);
    tokio::pin!(connect);
    let mut deferred = Vec::new();
    let outcome = loop {
        tokio::select! {
            result = &mut connect => break result,
            op = ops.recv() => match op {
                Some(SessionOp::Disconnect) | None => {
                    ctx.set_state(SessionState::Disconnecting);
                    ctx.dispatcher.send(EngineEvent::Disconnecting {
                        device_id: ctx.device_id.clone(),
                    });
                    for op in deferred.drain(..) {
                        fail_op(ctx, op);
                    }
                    fail_queued(ctx, ops);
                    // The dropped connect future stops retrying; this cancels
                    // any attempt still armed at the stack level.
                    if let Err(e) = ctx.adapter.disconnect(&ctx.device_id).await {
                        debug!(device = %ctx.device_id, error = %e, "Cancel of armed connect failed");
                    }
                    finish(ctx);
                    return false;
                }
                Some(SessionOp::ConnectionLost) => {
                    for op in deferred.drain(..) {
                        fail_op(ctx, op);
                    }
                    teardown_lost(ctx, ops);
                    return false;
                }
                Some(op) => deferred.push(op),
            },
        }
    };
    if let Err(e) = outcome {
        warn!(device = %ctx.device_id, error = %e, "Connect failed");
        for op in deferred.drain(..) {
            fail_op(ctx, op);
        }
        teardown_lost(ctx, ops);
        return false;
    }
    ctx.set_state(SessionState::Connected);
    ctx.dispatcher.send(EngineEvent::Connected {
        device_id: ctx.device_id.clone(),
    });
    discover(ctx).await;
    for op in deferred {
        handle_op(ctx, op).await;
    }
    true
}

/// Teardown after the platform reported the link gone (or connect failed).
fn teardown_lost(ctx: &SessionContext, ops: &mut mpsc::UnboundedReceiver<SessionOp>) {
    fail_queued(ctx, ops);
    finish(ctx);
}

/// Clear the cache, unbind and announce the final state, in that order.
fn finish(ctx: &SessionContext) {
    ctx.cache.lock().unwrap().clear();
    ctx.set_state(SessionState::Disconnected);
    ctx.registry.unbind(&ctx.device_id, ctx.token);
    ctx.dispatcher.send(EngineEvent::Disconnected {
        device_id: ctx.device_id.clone(),
    });
}

/// Queued operations are failed on teardown, never silently dropped.
fn fail_queued(ctx: &SessionContext, ops: &mut mpsc::UnboundedReceiver<SessionOp>) {
    while let Ok(op) = ops.try_recv() {
        fail_op(ctx, op);
    }
}

fn fail_op(ctx: &SessionContext, op: SessionOp) {
    match op {
        SessionOp::Disconnect | SessionOp::ConnectionLost => {}
        SessionOp::Write { characteristic, .. } => {
            // Write acks are always delivered, even for cancelled writes.
            ctx.dispatcher.send(EngineEvent::CharacteristicWrite {
                device_id: ctx.device_id.clone(),
                characteristic,
                status: OperationStatus::Failure,
            });
        }
        op => {
            ctx.dispatcher.send(EngineEvent::OperationFailed {
                device_id: ctx.device_id.clone(),
                operation: op_name(&op).to_string(),
                reason: "session closed".to_string(),
            });
        }
    }
}

fn op_name(op: &SessionOp) -> &'static str {
    match op {
        SessionOp::Discover => "discoverServices",
        SessionOp::Read { .. } => "readValue",
        SessionOp::Write { .. } => "writeValue",
        SessionOp::SetNotify { .. } => "setNotifiable",
        SessionOp::ReadRssi => "readRssi",
        SessionOp::RequestMtu { .. } => "requestMtu",
        SessionOp::RequestLatency { .. } => "requestLatency",
        SessionOp::Disconnect => "disconnect",
        SessionOp::ConnectionLost => "connectionLost",
    }
}

/// Run discovery and populate the cache. Failure leaves the link up and the
/// session in Connected; the application decides what to do next.
async fn discover(ctx: &SessionContext) {
    ctx.set_state(SessionState::Discovering);
    match ctx.adapter.discover_services(&ctx.device_id).await {
        Ok(services) => {
            let services: Vec<_> = services
                .into_iter()
                .map(|mut s| {
                    s.uuid = normalize_uuid(&s.uuid);
                    for c in &mut s.characteristics {
                        c.uuid = normalize_uuid(&c.uuid);
                    }
                    s
                })
                .collect();
            {
                let mut cache = ctx.cache.lock().unwrap();
                cache.clear();
                for service in &services {
                    cache.insert(service.uuid.clone(), service.characteristics.clone());
                }
            }
            ctx.set_state(SessionState::Ready);
            info!(device = %ctx.device_id, services = services.len(), "Discovery complete");
            for service in services {
                ctx.dispatcher.send(EngineEvent::ServiceDiscovered {
                    device_id: ctx.device_id.clone(),
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|c| c.uuid.clone())
                        .collect(),
                    service: service.uuid,
                });
            }
        }
        Err(e) => {
            warn!(device = %ctx.device_id, error = %e, "Service discovery failed");
            ctx.set_state(SessionState::Connected);
            ctx.dispatcher.send(EngineEvent::ServiceDiscoveryFailed {
                device_id: ctx.device_id.clone(),
            });
        }
    }
}

/// Populate state for a peripheral the platform kept connected across a
/// relaunch, replaying the events the application would have seen live.
fn synthesize_restored(ctx: &SessionContext, snapshot: PeripheralSnapshot) {
    info!(device = %ctx.device_id, "Synthesizing restored session");
    ctx.dispatcher.send(EngineEvent::Connected {
        device_id: ctx.device_id.clone(),
    });
    {
        let mut cache = ctx.cache.lock().unwrap();
        cache.clear();
        for service in &snapshot.services {
            cache.insert(
                normalize_uuid(&service.uuid),
                service
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: normalize_uuid(&c.uuid),
                        properties: c.properties,
                    })
                    .collect(),
            );
        }
    }
    ctx.set_state(SessionState::Ready);
    for service in &snapshot.services {
        ctx.dispatcher.send(EngineEvent::ServiceDiscovered {
            device_id: ctx.device_id.clone(),
            service: normalize_uuid(&service.uuid),
            characteristics: service
                .characteristics
                .iter()
                .map(|c| normalize_uuid(&c.uuid))
                .collect(),
        });
    }
    // Re-announce live notification registrations with an empty value so the
    // application can re-attach its handlers.
    for (_, characteristic) in &snapshot.notifying {
        ctx.dispatcher.send(EngineEvent::CharacteristicChanged {
            device_id: ctx.device_id.clone(),
            characteristic: normalize_uuid(characteristic),
            value: Vec::new(),
        });
    }
}

/// Execute one operation to completion; exactly one event per completion.
async fn handle_op(ctx: &SessionContext, op: SessionOp) {
    match op {
        SessionOp::Discover => discover(ctx).await,
        SessionOp::Read {
            service,
            characteristic,
        } => {
            match ctx
                .adapter
                .read_characteristic(&ctx.device_id, &service, &characteristic)
                .await
            {
                Ok(value) => ctx.dispatcher.send(EngineEvent::CharacteristicRead {
                    device_id: ctx.device_id.clone(),
                    characteristic,
                    value,
                }),
                Err(e) => ctx.dispatcher.send(EngineEvent::OperationFailed {
                    device_id: ctx.device_id.clone(),
                    operation: "readValue".to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        SessionOp::Write {
            service,
            characteristic,
            value,
            mode,
        } => {
            let status = match ctx
                .adapter
                .write_characteristic(&ctx.device_id, &service, &characteristic, &value, mode)
                .await
            {
                Ok(()) => OperationStatus::Success,
                Err(e) => {
                    warn!(device = %ctx.device_id, %characteristic, error = %e, "Write failed");
                    OperationStatus::Failure
                }
            };
            ctx.dispatcher.send(EngineEvent::CharacteristicWrite {
                device_id: ctx.device_id.clone(),
                characteristic,
                status,
            });
        }
        SessionOp::SetNotify {
            service,
            characteristic,
            mode,
        } => {
            if let Err(e) = ctx
                .adapter
                .set_notify(&ctx.device_id, &service, &characteristic, mode)
                .await
            {
                ctx.dispatcher.send(EngineEvent::OperationFailed {
                    device_id: ctx.device_id.clone(),
                    operation: "setNotifiable".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        SessionOp::ReadRssi => match ctx.adapter.read_rssi(&ctx.device_id).await {
            Ok(rssi) => ctx.dispatcher.send(EngineEvent::RssiRead {
                device_id: ctx.device_id.clone(),
                rssi,
            }),
            Err(e) => ctx.dispatcher.send(EngineEvent::OperationFailed {
                device_id: ctx.device_id.clone(),
                operation: "readRssi".to_string(),
                reason: e.to_string(),
            }),
        },
        SessionOp::RequestMtu { expected } => {
            match ctx.adapter.request_mtu(&ctx.device_id, expected).await {
                Ok(mtu) => ctx.dispatcher.send(EngineEvent::MtuChanged {
                    device_id: ctx.device_id.clone(),
                    mtu_config: mtu,
                }),
                Err(e) => ctx.dispatcher.send(EngineEvent::OperationFailed {
                    device_id: ctx.device_id.clone(),
                    operation: "requestMtu".to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        SessionOp::RequestLatency { priority } => {
            // Best-effort hint; some platforms manage intervals themselves.
            if let Err(e) = ctx.adapter.request_latency(&ctx.device_id, priority).await {
                debug!(device = %ctx.device_id, error = %e, "Latency request ignored");
            }
        }
        // Intercepted by the worker loop before reaching here.
        SessionOp::Disconnect | SessionOp::ConnectionLost => {}
    }
}
