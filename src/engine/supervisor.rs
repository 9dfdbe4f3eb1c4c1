//! Reconnection and state-restoration supervision.
//!
//! Persisted presence targets survive process death. When the radio becomes
//! available the supervisor re-issues pending connects for absent targets and
//! synthesizes sessions for peripherals the platform kept connected on our
//! behalf, replaying the connection and discovery events the application
//! would have seen live. Unexpected link drops of observed targets get
//! exactly one re-armed pending connect each.

use tracing::{info, warn};

use crate::domain::models::{normalize_device_id, EngineEvent, WakeType};
use crate::engine::session::SessionOrigin;
use crate::engine::EngineShared;
use crate::infrastructure::adapter::PeripheralSnapshot;

impl EngineShared {
    /// Radio came up (or the engine cold-started with the radio on): bring
    /// every persisted device target back to a live or pending session.
    pub(crate) async fn restore_pending(&self) {
        let targets = self.store.targets();
        if targets.is_empty() {
            return;
        }
        let connected = match self.adapter.connected_peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                warn!(error = %e, "Could not list connected peripherals");
                Vec::new()
            }
        };
        for snapshot in &connected {
            self.registry.upsert_snapshot(snapshot);
        }
        info!(
            targets = targets.len(),
            connected = connected.len(),
            "Restoring persisted presence targets"
        );
        for target in targets {
            let Some(id) = target.device_id.map(|id| normalize_device_id(&id)) else {
                // Association-only targets are watched by the platform itself.
                continue;
            };
            let live = connected
                .iter()
                .find(|s| normalize_device_id(&s.device_id) == id && s.connected);
            match live {
                Some(snapshot) => {
                    self.spawn_session(
                        &id,
                        SessionOrigin::Restored {
                            snapshot: snapshot.clone(),
                        },
                    );
                }
                None => {
                    if self.spawn_session(&id, SessionOrigin::Fresh { pending: true }) {
                        self.dispatcher()
                            .send(EngineEvent::PendingConnectionRestored { device_id: id });
                    }
                }
            }
        }
    }

    /// The OS relaunched us with peripherals it held alive. Synthesize
    /// sessions for the connected ones, re-arm the rest, then announce the
    /// restoration to both the application and the wake sink.
    pub(crate) fn handle_state_restored(&self, peripherals: Vec<PeripheralSnapshot>) {
        let mut restored_ids = Vec::with_capacity(peripherals.len());
        for snapshot in peripherals {
            let id = normalize_device_id(&snapshot.device_id);
            self.registry.upsert_snapshot(&snapshot);
            let name = snapshot.name.clone();
            if snapshot.connected {
                self.spawn_session(&id, SessionOrigin::Restored { snapshot });
            } else if self.spawn_session(&id, SessionOrigin::Fresh { pending: true }) {
                self.dispatcher()
                    .send(EngineEvent::PendingConnectionRestored {
                        device_id: id.clone(),
                    });
            }
            self.handle_presence_wake(Some(id.clone()), name, None, WakeType::StateRestored);
            restored_ids.push(id);
        }
        info!(count = restored_ids.len(), "State restoration complete");
        self.dispatcher().send(EngineEvent::StateRestored {
            restored_peripherals: restored_ids,
        });
    }

    /// One re-armed pending connect after an unexpected drop of an observed
    /// target. The caller has already removed the dead session, so the bind
    /// here can only race another restore path, in which case it loses and
    /// does nothing.
    pub(crate) fn re_arm(&self, device_id: &str) {
        if self.spawn_session(device_id, SessionOrigin::Fresh { pending: true }) {
            info!(device = %device_id, "Re-armed pending connect");
        }
    }
}
