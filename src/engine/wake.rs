//! Presence wake pipeline.
//!
//! Presence signals arrive while the application may not be running. The
//! pipeline deduplicates rapid repeats, lazily spawns a background wake
//! context from persisted handles, and holds events in FIFO queues until the
//! context signals readiness. The readiness wait is bounded and runs off the
//! event path; on timeout events stay queued and a later readiness signal
//! still flushes them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::domain::models::{EngineEvent, WakeEvent, WakeHandles};
use crate::domain::store::Store;
use crate::error::EngineError;

/// Accept at most one event per `deviceId|wakeType` key in this window.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(1000);

/// Bound on the readiness wait for a freshly spawned context.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// A live background execution context able to consume wake events.
pub struct WakeContext {
    pub sink: mpsc::UnboundedSender<WakeEvent>,
}

/// Spawns background execution contexts from persisted callback handles.
/// Injected so tests can substitute a channel-backed context.
pub trait WakeContextFactory: Send + Sync {
    fn spawn_context(&self, handles: &WakeHandles) -> Result<WakeContext, EngineError>;
}

struct PipelineState {
    context: Option<WakeContext>,
    ready: bool,
    pending_wakes: VecDeque<WakeEvent>,
    pending_messages: VecDeque<EngineEvent>,
    dedup: HashMap<String, tokio::time::Instant>,
    waiter_active: bool,
}

pub struct WakePipeline {
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    factory: Box<dyn WakeContextFactory>,
    store: Arc<Store>,
    // Arc'd so the readiness waiter task can observe them without holding
    // the pipeline itself alive.
    state: Arc<Mutex<PipelineState>>,
    ready_notify: Arc<Notify>,
}

impl WakePipeline {
    pub fn new(
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        factory: Box<dyn WakeContextFactory>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            events_tx,
            factory,
            store,
            state: Arc::new(Mutex::new(PipelineState {
                context: None,
                ready: false,
                pending_wakes: VecDeque::new(),
                pending_messages: VecDeque::new(),
                dedup: HashMap::new(),
                waiter_active: false,
            })),
            ready_notify: Arc::new(Notify::new()),
        }
    }

    /// Ingest a presence signal. Returns true when the event was accepted
    /// (forwarded or queued); duplicates and undeliverable events return
    /// false. Never errors toward the caller.
    pub fn handle_wake(&self, event: WakeEvent) -> bool {
        let key = event.dedup_key();
        let now = tokio::time::Instant::now();
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &key {
            state
                .dedup
                .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
            if state.dedup.contains_key(key) {
                debug!(device = ?event.device_id, wake = event.wake_type.as_str(), "Duplicate wake suppressed");
                return false;
            }
        }

        if state.context.is_none() {
            let Some(handles) = self.store.wake_handles() else {
                // Operator problem, not an application error.
                error!("Wake event dropped: no wake callback registered");
                return false;
            };
            match self.factory.spawn_context(&handles) {
                Ok(context) => {
                    info!("Spawned background wake context");
                    state.context = Some(context);
                }
                Err(e) => {
                    error!(error = %e, "Failed to spawn background wake context");
                    return false;
                }
            }
        }

        // Only accepted events open a dedup window; dropped ones must not
        // suppress a retry.
        if let Some(key) = key {
            state.dedup.insert(key, now);
        }

        if state.ready {
            if let Some(context) = &state.context {
                let _ = context.sink.send(event);
            }
        } else {
            state.pending_wakes.push_back(event);
            if !state.waiter_active {
                state.waiter_active = true;
                self.spawn_readiness_waiter();
            }
        }
        true
    }

    /// Bounded wait observing the readiness latch, off the event path. On
    /// timeout the queue is left intact for a late readiness signal.
    fn spawn_readiness_waiter(&self) {
        let notify = self.ready_notify.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(READINESS_TIMEOUT, notify.notified()).await;
            let mut state = state.lock().unwrap();
            state.waiter_active = false;
            if outcome.is_err() && !state.ready {
                warn!(
                    queued = state.pending_wakes.len(),
                    "Background context not ready after {}s; events stay queued",
                    READINESS_TIMEOUT.as_secs()
                );
            }
        });
    }

    /// The background context finished initializing: latch readiness and
    /// flush queued wakes, then deferred application messages, in order.
    pub fn signal_ready(&self) {
        let (wakes, messages, sink) = {
            let mut state = self.state.lock().unwrap();
            if state.context.is_none() {
                debug!("Readiness signal with no live context");
                return;
            }
            state.ready = true;
            let sink = state.context.as_ref().map(|c| c.sink.clone());
            (
                state.pending_wakes.drain(..).collect::<Vec<_>>(),
                state.pending_messages.drain(..).collect::<Vec<_>>(),
                sink,
            )
        };
        self.ready_notify.notify_waiters();
        info!(
            wakes = wakes.len(),
            messages = messages.len(),
            "Background context ready; flushing queues"
        );
        if let Some(sink) = sink {
            for event in wakes {
                let _ = sink.send(event);
            }
        }
        for message in messages {
            let _ = self.events_tx.send(message);
        }
    }

    /// Foreground handoff: drop the context and reset the latch, queues and
    /// dedup history. The next wake starts from scratch.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.context = None;
        state.ready = false;
        state.pending_wakes.clear();
        state.pending_messages.clear();
        state.dedup.clear();
        info!("Background wake context torn down");
    }

    /// Route an application event: deferred while a context exists but has
    /// not signalled readiness, delivered immediately otherwise.
    pub fn dispatch_message(&self, event: EngineEvent) {
        {
            let mut state = self.state.lock().unwrap();
            if state.context.is_some() && !state.ready {
                state.pending_messages.push_back(event);
                return;
            }
        }
        let _ = self.events_tx.send(event);
    }

}

/// Cheap handle the rest of the engine uses to emit application events
/// through the pipeline's deferral logic.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<WakePipeline>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<WakePipeline>) -> Self {
        Self { pipeline }
    }

    pub fn send(&self, event: EngineEvent) {
        self.pipeline.dispatch_message(event);
    }
}
