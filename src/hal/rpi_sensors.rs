//! DS18B20 1-Wire temperature reader (Linux sysfs).
//!
//! The kernel w1-therm driver exposes each probe as
//! `/sys/bus/w1/devices/28-<id>/w1_slave`; reads go through `tokio::fs` so
//! the ~750 ms conversion latency suspends instead of blocking the tick
//! scheduler. Any failure — missing device, CRC line not "YES", parse —
//! degrades to the 70 °F ambient sentinel with a logged warning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use log::{info, warn};

use super::{FALLBACK_TEMP_F, SensorName, TemperatureSensors};

/// DS18B20 family code prefixed to bare sensor IDs.
const W1_FAMILY_PREFIX: &str = "28-";
const W1_DEVICES_DIR: &str = "/sys/bus/w1/devices";

/// 1-Wire sensor set on the Raspberry Pi.
pub struct RpiSensors {
    ids: Mutex<HashMap<SensorName, String>>,
}

impl Default for RpiSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl RpiSensors {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashMap::new()),
        }
    }

    fn device_path(sensor_id: &str) -> PathBuf {
        let device = if sensor_id.contains('-') {
            sensor_id.to_owned()
        } else {
            format!("{W1_FAMILY_PREFIX}{sensor_id}")
        };
        PathBuf::from(W1_DEVICES_DIR).join(device).join("w1_slave")
    }
}

/// Parse the two-line `w1_slave` format into °F.
///
/// ```text
/// 6e 01 4b 46 7f ff 02 10 7b : crc=7b YES
/// 6e 01 4b 46 7f ff 02 10 7b t=22875
/// ```
pub fn parse_w1_slave(contents: &str) -> Option<f64> {
    let mut lines = contents.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let temp_line = lines.next()?;
    let raw = temp_line.rsplit_once("t=")?.1.trim();
    let milli_c: f64 = raw.parse().ok()?;
    let celsius = milli_c / 1000.0;
    Some(celsius * 9.0 / 5.0 + 32.0)
}

#[async_trait]
impl TemperatureSensors for RpiSensors {
    async fn setup(&self, sensor_ids: HashMap<SensorName, String>) {
        for (name, id) in &sensor_ids {
            info!("Initialized sensor {name} with ID {id}");
        }
        *self.ids.lock().expect("sensor id lock poisoned") = sensor_ids;
    }

    async fn read_temperature(&self, sensor: SensorName) -> f64 {
        let id = self
            .ids
            .lock()
            .expect("sensor id lock poisoned")
            .get(&sensor)
            .cloned();
        let Some(id) = id else {
            warn!("Sensor {sensor} not initialized, returning ambient fallback");
            return FALLBACK_TEMP_F;
        };

        let path = Self::device_path(&id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_w1_slave(&contents).unwrap_or_else(|| {
                warn!("Sensor {sensor}: unparseable reading from {}", path.display());
                FALLBACK_TEMP_F
            }),
            Err(e) => {
                warn!("Failed to read sensor {sensor}: {e}");
                FALLBACK_TEMP_F
            }
        }
    }

    async fn read_all_temperatures(&self) -> HashMap<SensorName, f64> {
        let mut results = HashMap::new();
        let names: Vec<SensorName> = self
            .ids
            .lock()
            .expect("sensor id lock poisoned")
            .keys()
            .copied()
            .collect();
        for name in names {
            results.insert(name, self.read_temperature(name).await);
        }
        results
    }
}
