//! Mock relay provider for testing and non-Pi development.
//!
//! Tracks logical relay states in memory. A registered change callback
//! fires when — and only when — a state actually changes, which is how the
//! physics simulator observes relay activity.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};

use crate::error::{HalError, Result};

use super::{RelayChannelConfig, RelayControl, RelayName};

/// Callback invoked on every real relay state change.
pub type RelayChangeCallback = Box<dyn Fn(RelayName, bool) + Send + Sync>;

struct Inner {
    states: HashMap<RelayName, bool>,
    configs: HashMap<RelayName, RelayChannelConfig>,
    on_change: Option<RelayChangeCallback>,
}

/// In-memory relay set.
pub struct MockGpio {
    inner: Mutex<Inner>,
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGpio {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                states: HashMap::new(),
                configs: HashMap::new(),
                on_change: None,
            }),
        }
    }

    /// Register the relay-change callback (simulator integration).
    pub fn set_change_callback(&self, callback: RelayChangeCallback) {
        self.inner.lock().expect("mock gpio lock poisoned").on_change = Some(callback);
    }

    fn set_locked(inner: &mut Inner, relay: RelayName, on: bool) -> Result<bool> {
        if !inner.configs.contains_key(&relay) {
            return Err(HalError::RelayNotConfigured(relay.as_str()).into());
        }
        let old = inner.states.insert(relay, on).unwrap_or(false);
        let changed = old != on;
        if changed {
            if let Some(cb) = &inner.on_change {
                cb(relay, on);
            }
            debug!("[MOCK] Relay {relay}: {}", if on { "ON" } else { "OFF" });
        }
        Ok(changed)
    }
}

#[async_trait]
impl RelayControl for MockGpio {
    async fn setup(&self, configs: HashMap<RelayName, RelayChannelConfig>) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock gpio lock poisoned");
        for relay in configs.keys() {
            inner.states.insert(*relay, false);
        }
        info!("MockGpio initialized with {} relays", configs.len());
        inner.configs = configs;
        Ok(())
    }

    async fn set_relay(&self, relay: RelayName, on: bool) -> Result<bool> {
        let mut inner = self.inner.lock().expect("mock gpio lock poisoned");
        Self::set_locked(&mut inner, relay, on)
    }

    async fn get_relay(&self, relay: RelayName) -> bool {
        self.inner
            .lock()
            .expect("mock gpio lock poisoned")
            .states
            .get(&relay)
            .copied()
            .unwrap_or(false)
    }

    async fn get_all_relays(&self) -> HashMap<RelayName, bool> {
        self.inner
            .lock()
            .expect("mock gpio lock poisoned")
            .states
            .clone()
    }

    async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock gpio lock poisoned");
        let on_relays: Vec<RelayName> = inner
            .states
            .iter()
            .filter_map(|(r, on)| on.then_some(*r))
            .collect();
        for relay in on_relays {
            Self::set_locked(&mut inner, relay, false)?;
        }
        info!("[MOCK] GPIO cleanup complete");
        Ok(())
    }
}
