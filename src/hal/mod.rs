//! Hardware abstraction layer.
//!
//! The contract between the controller and the machine: a relay capability
//! and a temperature capability, each with two providers — physical
//! (Raspberry Pi GPIO + 1-Wire, behind the `hardware` feature) and mock
//! (in-memory, optionally driven by the physics simulator).
//!
//! Contract rules the providers uphold:
//! - every operation is async and never blocks the tick scheduler;
//! - `set_relay` is idempotent — re-commanding the current value produces
//!   no observable change outside the HAL (the returned flag tells the
//!   caller whether anything actually changed);
//! - physical lines are initialized HIGH (relay OFF for active-low) before
//!   any command is accepted;
//! - failed sensor reads degrade to the 70 °F ambient sentinel and never
//!   propagate errors to callers.

pub mod mock_gpio;
pub mod mock_sensors;
#[cfg(feature = "hardware")]
pub mod rpi_gpio;
pub mod rpi_sensors;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ambient fallback reading (°F) for failed or unconfigured sensors.
pub const FALLBACK_TEMP_F: f64 = 70.0;

// ---------------------------------------------------------------------------
// Relay and sensor identity
// ---------------------------------------------------------------------------

/// The eight relay channels of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayName {
    WaterValve,
    HotGasSolenoid,
    RecirculatingPump,
    Compressor1,
    Compressor2,
    CondenserFan,
    Led,
    IceCutter,
}

impl RelayName {
    pub const ALL: [Self; 8] = [
        Self::WaterValve,
        Self::HotGasSolenoid,
        Self::RecirculatingPump,
        Self::Compressor1,
        Self::Compressor2,
        Self::CondenserFan,
        Self::Led,
        Self::IceCutter,
    ];

    /// Stable wire/log name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaterValve => "water_valve",
            Self::HotGasSolenoid => "hot_gas_solenoid",
            Self::RecirculatingPump => "recirculating_pump",
            Self::Compressor1 => "compressor_1",
            Self::Compressor2 => "compressor_2",
            Self::CondenserFan => "condenser_fan",
            Self::Led => "led",
            Self::IceCutter => "ice_cutter",
        }
    }
}

impl core::fmt::Display for RelayName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two temperature sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorName {
    Plate,
    IceBin,
}

impl SensorName {
    pub const ALL: [Self; 2] = [Self::Plate, Self::IceBin];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plate => "plate",
            Self::IceBin => "ice_bin",
        }
    }
}

impl core::fmt::Display for SensorName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel wiring: BCM pin, human name, polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayChannelConfig {
    pub gpio_pin: u8,
    pub display_name: &'static str,
    /// Logical ON drives the line LOW.
    pub active_low: bool,
}

/// The production pin map (BCM numbering).
pub fn default_relay_config() -> HashMap<RelayName, RelayChannelConfig> {
    fn ch(gpio_pin: u8, display_name: &'static str) -> RelayChannelConfig {
        RelayChannelConfig {
            gpio_pin,
            display_name,
            active_low: true,
        }
    }
    HashMap::from([
        (RelayName::WaterValve, ch(12, "Water Valve")),
        (RelayName::HotGasSolenoid, ch(5, "Hot Gas Solenoid")),
        (RelayName::RecirculatingPump, ch(6, "Recirculating Pump")),
        (RelayName::Compressor1, ch(24, "Compressor 1")),
        (RelayName::Compressor2, ch(25, "Compressor 2")),
        (RelayName::CondenserFan, ch(23, "Condenser Fan")),
        (RelayName::Led, ch(22, "LED")),
        (RelayName::IceCutter, ch(27, "Ice Cutter")),
    ])
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Relay capability. Mutations of the relay set flow only through this
/// trait; nothing outside the HAL sees physical polarity.
#[async_trait]
pub trait RelayControl: Send + Sync {
    /// Initialize the relay channels. Physical providers must drive every
    /// line to the OFF level before returning.
    async fn setup(&self, configs: HashMap<RelayName, RelayChannelConfig>) -> Result<()>;

    /// Command a relay. Returns `true` when the logical state actually
    /// changed, `false` for a no-op re-command.
    async fn set_relay(&self, relay: RelayName, on: bool) -> Result<bool>;

    /// Current logical state of one relay (`false` if never commanded).
    async fn get_relay(&self, relay: RelayName) -> bool;

    /// Snapshot of all logical relay states.
    async fn get_all_relays(&self) -> HashMap<RelayName, bool>;

    /// Drive every relay OFF and release the underlying resources.
    async fn cleanup(&self) -> Result<()>;
}

/// Temperature capability. Reads never fail: providers degrade to
/// [`FALLBACK_TEMP_F`] and log instead.
#[async_trait]
pub trait TemperatureSensors: Send + Sync {
    /// Bind sensor names to their hardware identifier strings.
    async fn setup(&self, sensor_ids: HashMap<SensorName, String>);

    /// Read one sensor in °F.
    async fn read_temperature(&self, sensor: SensorName) -> f64;

    /// Read every sensor in °F.
    async fn read_all_temperatures(&self) -> HashMap<SensorName, f64>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the HAL pair for this platform.
///
/// With the `hardware` feature on a Raspberry Pi this returns the physical
/// providers; everywhere else (or with `force_mock`) the in-memory mocks.
pub fn create_hal(force_mock: bool) -> (Arc<dyn RelayControl>, Arc<dyn TemperatureSensors>) {
    #[cfg(feature = "hardware")]
    {
        if !force_mock && crate::config::is_raspberry_pi() {
            log::info!("Using Raspberry Pi HAL (GPIO + 1-Wire)");
            return (
                Arc::new(rpi_gpio::RpiGpio::new()),
                Arc::new(rpi_sensors::RpiSensors::new()),
            );
        }
    }
    let _ = force_mock;
    log::info!("Using mock HAL implementations");
    (
        Arc::new(mock_gpio::MockGpio::new()),
        Arc::new(mock_sensors::MockSensors::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pin_map_matches_the_wiring_sheet() {
        let map = default_relay_config();
        assert_eq!(map.len(), 8);
        assert_eq!(map[&RelayName::WaterValve].gpio_pin, 12);
        assert_eq!(map[&RelayName::HotGasSolenoid].gpio_pin, 5);
        assert_eq!(map[&RelayName::RecirculatingPump].gpio_pin, 6);
        assert_eq!(map[&RelayName::Compressor1].gpio_pin, 24);
        assert_eq!(map[&RelayName::Compressor2].gpio_pin, 25);
        assert_eq!(map[&RelayName::CondenserFan].gpio_pin, 23);
        assert_eq!(map[&RelayName::Led].gpio_pin, 22);
        assert_eq!(map[&RelayName::IceCutter].gpio_pin, 27);
        assert!(map.values().all(|c| c.active_low));
    }

    #[test]
    fn relay_names_are_stable() {
        assert_eq!(RelayName::HotGasSolenoid.as_str(), "hot_gas_solenoid");
        assert_eq!(SensorName::IceBin.as_str(), "ice_bin");
    }
}
