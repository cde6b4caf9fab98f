use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;
use crate::models::Settings;
use crate::store::{DocumentStore, SETTINGS};

pub const SETTINGS_ID: &str = "app_settings";

/// Fixed delays of the send flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendTimings {
    pub initial_delay_ms: u64,
    pub step_hold_ms: u64,
    pub settle_ms: u64,
    pub repoll_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for SendTimings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            step_hold_ms: 1_500,
            settle_ms: 2_000,
            repoll_ms: 1_500,
            probe_timeout_ms: 30_000,
        }
    }
}

impl SendTimings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn step_hold(&self) -> Duration {
        Duration::from_millis(self.step_hold_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn repoll(&self) -> Duration {
        Duration::from_millis(self.repoll_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Fixed delays of the number verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationTimings {
    pub settle_ms: u64,
    pub inter_item_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for VerificationTimings {
    fn default() -> Self {
        Self {
            settle_ms: 1_000,
            inter_item_ms: 2_000,
            probe_timeout_ms: 30_000,
        }
    }
}

impl VerificationTimings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn inter_item(&self) -> Duration {
        Duration::from_millis(self.inter_item_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Stored settings, or defaults when none were saved. A document that no
/// longer parses also yields defaults.
pub fn load_settings(store: &dyn DocumentStore) -> Result<Settings, CoreError> {
    let Some(doc) = store.get(SETTINGS, SETTINGS_ID)? else {
        return Ok(Settings::default());
    };
    match serde_json::from_value(doc) {
        Ok(settings) => Ok(settings),
        Err(err) => {
            warn!("stored settings unreadable, using defaults: {}", err);
            Ok(Settings::default())
        }
    }
}

pub fn save_settings(store: &dyn DocumentStore, settings: &Settings) -> Result<(), CoreError> {
    store.put(SETTINGS, SETTINGS_ID, &serde_json::to_value(settings)?)
}

/// Loads, applies `change`, saves and returns the result.
pub fn update_settings<F>(store: &dyn DocumentStore, change: F) -> Result<Settings, CoreError>
where
    F: FnOnce(&mut Settings),
{
    let mut settings = load_settings(store)?;
    change(&mut settings);
    save_settings(store, &settings)?;
    Ok(settings)
}
