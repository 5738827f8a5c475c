//! Physical relay provider (Raspberry Pi GPIO via rppal).
//!
//! Relays are wired active-low: the line is pulled LOW to energize the
//! coil. Every pin is taken as an output already driven HIGH (relay OFF)
//! before any command is accepted. Register writes are sub-microsecond, so
//! they run inline on the cooperative scheduler.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};
use rppal::gpio::{Gpio, OutputPin};

use crate::error::{HalError, Result};

use super::{RelayChannelConfig, RelayControl, RelayName};

struct Channel {
    pin: OutputPin,
    config: RelayChannelConfig,
    on: bool,
}

/// GPIO-backed relay set.
pub struct RpiGpio {
    channels: Mutex<HashMap<RelayName, Channel>>,
}

impl Default for RpiGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl RpiGpio {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn drive(channel: &mut Channel, on: bool) {
        // Active low: ON pulls the line LOW.
        let level_low = on == channel.config.active_low;
        if level_low {
            channel.pin.set_low();
        } else {
            channel.pin.set_high();
        }
        channel.on = on;
    }
}

#[async_trait]
impl RelayControl for RpiGpio {
    async fn setup(&self, configs: HashMap<RelayName, RelayChannelConfig>) -> Result<()> {
        let gpio = Gpio::new().map_err(HalError::from)?;
        let mut channels = self.channels.lock().expect("gpio lock poisoned");
        for (relay, config) in configs {
            // Output taken HIGH = relay OFF for active-low wiring.
            let pin = gpio
                .get(config.gpio_pin)
                .map_err(HalError::from)?
                .into_output_high();
            debug!("Initialized relay {relay} on GPIO pin {}", config.gpio_pin);
            channels.insert(
                relay,
                Channel {
                    pin,
                    config,
                    on: false,
                },
            );
        }
        info!("RpiGpio initialized with {} relays", channels.len());
        Ok(())
    }

    async fn set_relay(&self, relay: RelayName, on: bool) -> Result<bool> {
        let mut channels = self.channels.lock().expect("gpio lock poisoned");
        let channel = channels
            .get_mut(&relay)
            .ok_or(HalError::RelayNotConfigured(relay.as_str()))?;
        if channel.on == on {
            return Ok(false);
        }
        Self::drive(channel, on);
        debug!("Relay {relay}: {}", if on { "ON" } else { "OFF" });
        Ok(true)
    }

    async fn get_relay(&self, relay: RelayName) -> bool {
        self.channels
            .lock()
            .expect("gpio lock poisoned")
            .get(&relay)
            .is_some_and(|c| c.on)
    }

    async fn get_all_relays(&self) -> HashMap<RelayName, bool> {
        self.channels
            .lock()
            .expect("gpio lock poisoned")
            .iter()
            .map(|(relay, c)| (*relay, c.on))
            .collect()
    }

    async fn cleanup(&self) -> Result<()> {
        let mut channels = self.channels.lock().expect("gpio lock poisoned");
        for channel in channels.values_mut() {
            if channel.on {
                Self::drive(channel, false);
            }
        }
        // Dropping the pins returns them to inputs.
        channels.clear();
        info!("RpiGpio cleanup complete");
        Ok(())
    }
}
