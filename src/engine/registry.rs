//! Device registry: advertisement records plus the live session table.
//!
//! Both maps sit behind one mutex so a session can never be observed without
//! its record. The lock is never held across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::domain::models::{epoch_millis, DeviceRecord};
use crate::engine::session::SessionHandle;
use crate::infrastructure::adapter::PeripheralSnapshot;

#[derive(Default)]
struct RegistryInner {
    records: HashMap<String, DeviceRecord>,
    sessions: HashMap<String, SessionHandle>,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_token: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Monotonic token identifying one session generation.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or refresh a record from advertisement data. Ids are expected
    /// pre-normalized.
    pub fn upsert_advertisement(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .entry(id.to_string())
            .or_insert_with(|| DeviceRecord {
                id: id.to_string(),
                name: None,
                last_rssi: None,
                last_seen_at: 0,
            });
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            record.name = Some(name.to_string());
        }
        if rssi.is_some() {
            record.last_rssi = rssi;
        }
        record.last_seen_at = epoch_millis();
    }

    /// Record a peripheral the platform handed back (repopulation or state
    /// restoration).
    pub fn upsert_snapshot(&self, snapshot: &PeripheralSnapshot) {
        self.upsert_advertisement(&snapshot.device_id, snapshot.name.as_deref(), None);
    }

    /// Guarantee a record exists for a session about to be bound.
    pub fn ensure_record(&self, id: &str) {
        self.upsert_advertisement(id, None, None);
    }

    pub fn lookup(&self, id: &str) -> Option<DeviceRecord> {
        self.inner.lock().unwrap().records.get(id).cloned()
    }

    pub fn records_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }

    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    /// Bind a session to a device. Returns false (and drops the handle) when
    /// the device already has one; connect is idempotent at this layer.
    pub fn bind(&self, id: &str, handle: SessionHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(id) {
            return false;
        }
        inner.sessions.insert(id.to_string(), handle);
        true
    }

    /// Remove a session only if the stored generation token matches, so a
    /// superseded worker cannot evict its replacement.
    pub fn unbind(&self, id: &str, token: u64) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get(id) {
            Some(handle) if handle.token == token => inner.sessions.remove(id),
            _ => None,
        }
    }

    /// Remove a session unconditionally (platform reported the link gone).
    pub fn take_session(&self, id: &str) -> Option<SessionHandle> {
        self.inner.lock().unwrap().sessions.remove(id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::new_session_parts;

    #[test]
    fn test_bind_is_idempotent() {
        let registry = Registry::new();
        let (first, _rx1) = new_session_parts(registry.next_token());
        let (second, _rx2) = new_session_parts(registry.next_token());

        assert!(registry.bind("AA", first));
        assert!(!registry.bind("AA", second));
        assert!(registry.session("AA").is_some());
    }

    #[test]
    fn test_unbind_is_token_guarded() {
        let registry = Registry::new();
        let (first, _rx1) = new_session_parts(registry.next_token());
        let stale_token = first.token;
        assert!(registry.bind("AA", first));

        // Platform loss removes the first generation; a replacement binds.
        registry.take_session("AA");
        let (second, _rx2) = new_session_parts(registry.next_token());
        let live_token = second.token;
        assert!(registry.bind("AA", second));

        // The stale worker's cleanup must not evict the replacement.
        assert!(registry.unbind("AA", stale_token).is_none());
        assert!(registry.session("AA").is_some());
        assert!(registry.unbind("AA", live_token).is_some());
        assert!(registry.session("AA").is_none());
    }

    #[test]
    fn test_advertisement_updates_record() {
        let registry = Registry::new();
        registry.upsert_advertisement("AA", Some("Sensor"), Some(-50));
        registry.upsert_advertisement("AA", None, Some(-60));

        let record = registry.lookup("AA").unwrap();
        assert_eq!(record.name.as_deref(), Some("Sensor"));
        assert_eq!(record.last_rssi, Some(-60));
        assert!(registry.lookup("BB").is_none());
    }
}
