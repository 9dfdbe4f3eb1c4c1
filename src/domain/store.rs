//! Persisted engine state.
//!
//! A single JSON document under the user config directory holds everything
//! that must survive process death: the observed presence targets, the
//! registered wake callback handles and the optional auto-command.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::models::{AutoCommandConfig, ObservedTarget, WakeHandles};

const STATE_FILE_NAME: &str = "engine_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    pub observed_targets: Vec<ObservedTarget>,
    pub wake_handles: Option<WakeHandles>,
    pub auto_command_service: Option<String>,
    pub auto_command_characteristic: Option<String>,
    /// Comma-separated byte list, e.g. "1,2,3".
    pub auto_command_payload: Option<String>,
}

pub struct Store {
    state: Mutex<PersistedState>,
    path: PathBuf,
}

impl Store {
    /// Open the store at the default platform location, loading existing
    /// state or starting from defaults.
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Ok(Self::with_path(path))
    }

    /// Open the store at an explicit path (used by tests).
    pub fn with_path(path: PathBuf) -> Self {
        let state = match Self::load_from_file(&path) {
            Ok(state) => {
                info!("Loaded engine state from {:?}", path);
                state
            }
            Err(e) => {
                info!("Starting with empty engine state ({})", e);
                PersistedState::default()
            }
        };
        Self {
            state: Mutex::new(state),
            path,
        }
    }

    fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().context("Could not find config directory")?;
        path.push("bluelink");
        fs::create_dir_all(&path)?;
        path.push(STATE_FILE_NAME);
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> Result<PersistedState> {
        let contents = fs::read_to_string(path)?;
        let state = serde_json::from_str(&contents)?;
        Ok(state)
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write engine state to {:?}", self.path))?;
        Ok(())
    }

    fn mutate<F: FnOnce(&mut PersistedState)>(&self, f: F) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
        self.save(&state)
    }

    /// Add an observed target; duplicates are ignored.
    pub fn add_target(&self, target: ObservedTarget) -> Result<()> {
        self.mutate(|state| {
            if !state.observed_targets.contains(&target) {
                state.observed_targets.push(target);
            }
        })
    }

    /// Remove a specific target.
    pub fn remove_target(&self, target: &ObservedTarget) -> Result<()> {
        self.mutate(|state| {
            state.observed_targets.retain(|t| t != target);
        })
    }

    /// Remove every target bound to the given device id. Returns whether
    /// anything was removed.
    pub fn remove_device_target(&self, device_id: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate(|state| {
            let before = state.observed_targets.len();
            state
                .observed_targets
                .retain(|t| !t.matches_device(device_id));
            removed = state.observed_targets.len() != before;
        })?;
        Ok(removed)
    }

    pub fn targets(&self) -> Vec<ObservedTarget> {
        self.state.lock().unwrap().observed_targets.clone()
    }

    pub fn is_observed_device(&self, device_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .observed_targets
            .iter()
            .any(|t| t.matches_device(device_id))
    }

    pub fn set_wake_handles(&self, handles: WakeHandles) -> Result<()> {
        self.mutate(|state| state.wake_handles = Some(handles))
    }

    pub fn wake_handles(&self) -> Option<WakeHandles> {
        self.state.lock().unwrap().wake_handles
    }

    pub fn set_auto_command(
        &self,
        service: &str,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<()> {
        let csv = payload
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.mutate(|state| {
            state.auto_command_service = Some(service.to_string());
            state.auto_command_characteristic = Some(characteristic.to_string());
            state.auto_command_payload = Some(csv);
        })
    }

    pub fn clear_auto_command(&self) -> Result<()> {
        self.mutate(|state| {
            state.auto_command_service = None;
            state.auto_command_characteristic = None;
            state.auto_command_payload = None;
        })
    }

    /// The persisted auto-command, if one is fully configured.
    pub fn auto_command(&self) -> Option<AutoCommandConfig> {
        let state = self.state.lock().unwrap();
        let service = state.auto_command_service.clone()?;
        let characteristic = state.auto_command_characteristic.clone()?;
        let csv = state.auto_command_payload.as_deref()?;
        let payload = AutoCommandConfig::parse_payload_csv(csv);
        if service.trim().is_empty() || characteristic.trim().is_empty() {
            warn!("Ignoring auto-command with blank service or characteristic");
            return None;
        }
        Some(AutoCommandConfig {
            service,
            characteristic,
            payload,
        })
    }
}
