//! Mock temperature sensors.
//!
//! Supports static values (set manually from tests) and a dynamic provider
//! function, which is how the physics simulator feeds live temperatures.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use log::info;

use super::{FALLBACK_TEMP_F, SensorName, TemperatureSensors};

/// Provider function mapping a sensor to its current temperature (°F).
pub type TemperatureProvider = Box<dyn Fn(SensorName) -> f64 + Send + Sync>;

struct Inner {
    temps: HashMap<SensorName, f64>,
    provider: Option<TemperatureProvider>,
}

/// In-memory sensor set.
pub struct MockSensors {
    inner: Mutex<Inner>,
}

impl Default for MockSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSensors {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                temps: HashMap::from([
                    (SensorName::Plate, FALLBACK_TEMP_F),
                    (SensorName::IceBin, FALLBACK_TEMP_F),
                ]),
                provider: None,
            }),
        }
    }

    /// Pin one sensor to a static value (test scenarios).
    pub fn set_temperature(&self, sensor: SensorName, temp_f: f64) {
        self.inner
            .lock()
            .expect("mock sensors lock poisoned")
            .temps
            .insert(sensor, temp_f);
    }

    /// Route reads through a dynamic provider (simulator integration).
    /// Static values are ignored while a provider is set.
    pub fn set_temperature_provider(&self, provider: TemperatureProvider) {
        self.inner
            .lock()
            .expect("mock sensors lock poisoned")
            .provider = Some(provider);
    }
}

#[async_trait]
impl TemperatureSensors for MockSensors {
    async fn setup(&self, _sensor_ids: HashMap<SensorName, String>) {
        info!("[MOCK] Temperature sensors initialized");
    }

    async fn read_temperature(&self, sensor: SensorName) -> f64 {
        let inner = self.inner.lock().expect("mock sensors lock poisoned");
        match &inner.provider {
            Some(provider) => provider(sensor),
            None => inner.temps.get(&sensor).copied().unwrap_or(FALLBACK_TEMP_F),
        }
    }

    async fn read_all_temperatures(&self) -> HashMap<SensorName, f64> {
        let inner = self.inner.lock().expect("mock sensors lock poisoned");
        SensorName::ALL
            .iter()
            .map(|s| {
                let temp = match &inner.provider {
                    Some(provider) => provider(*s),
                    None => inner.temps.get(s).copied().unwrap_or(FALLBACK_TEMP_F),
                };
                (*s, temp)
            })
            .collect()
    }
}
