//! System configuration parameters.
//!
//! All tunable parameters for the ice-maker control core. Temperatures are
//! in Fahrenheit, durations in seconds. Values can be overridden through
//! `ICEMAKER_*` environment variables; a `.env` file in the working
//! directory is consulted for variables not already set in the real
//! environment. The YAML layering used by the deployment tooling sits
//! outside this crate — only the resulting record lives here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Temperature and timeout settings for a single setpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateSetpoint {
    /// Target plate temperature (°F).
    pub target_temp_f: f64,
    /// Maximum time allowed in the state before the guard advances anyway.
    pub timeout_seconds: f64,
}

/// Harvest adds a water-fill window on top of the usual setpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub target_temp_f: f64,
    pub timeout_seconds: f64,
    /// Water valve stays open for this long at the start of harvest.
    pub fill_time_seconds: f64,
}

/// Durations of the three sequential priming phases (POWER_ON state).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrimingConfig {
    /// Phase 1: flush with the water valve open.
    pub flush_seconds: f64,
    /// Phase 2: run the recirculating pump dry of inlet water.
    pub pump_seconds: f64,
    /// Phase 3: final fill with the valve open again.
    pub fill_seconds: f64,
}

impl PrimingConfig {
    /// Total length of the priming sequence.
    pub fn total_seconds(&self) -> f64 {
        self.flush_seconds + self.pump_seconds + self.fill_seconds
    }
}

/// Deployment environment, used for logging defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

/// Main configuration record for the ice-maker control core.
///
/// Frozen at start; runtime edits arrive through controller commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcemakerConfig {
    // --- State setpoints ---
    pub prechill: StateSetpoint,
    pub ice_making: StateSetpoint,
    pub harvest: HarvestConfig,
    pub rechill: StateSetpoint,

    // --- Priming (POWER_ON) ---
    pub priming: PrimingConfig,
    /// Priming is opt-in; power-on without priming goes straight to CHILL.
    pub priming_enabled: bool,

    // --- Thresholds ---
    /// Bin is considered full when the bin sensor reads below this (°F).
    pub bin_full_threshold_f: f64,

    // --- Timing ---
    /// FSM tick / sensor poll interval (seconds).
    pub poll_interval_seconds: f64,
    /// Auto-transition STANDBY → OFF after this long. The ice cutter stays
    /// on during standby so residual sheet ice still gets cut.
    pub standby_timeout_seconds: f64,

    // --- Hardware IDs (1-Wire DS18B20) ---
    pub plate_sensor_id: String,
    pub bin_sensor_id: String,

    // --- Simulation ---
    pub use_simulator: bool,
    pub simulator_speed: f64,

    // --- Persistence ---
    /// Directory for the cycle counter, resume flag, and state snapshot.
    pub data_dir: PathBuf,

    // --- Deployment ---
    pub environment: Environment,
}

impl Default for IcemakerConfig {
    fn default() -> Self {
        Self {
            prechill: StateSetpoint {
                target_temp_f: 32.0,
                timeout_seconds: 120.0,
            },
            ice_making: StateSetpoint {
                target_temp_f: -2.0,
                timeout_seconds: 1500.0,
            },
            harvest: HarvestConfig {
                target_temp_f: 38.0,
                timeout_seconds: 240.0,
                fill_time_seconds: 18.0,
            },
            rechill: StateSetpoint {
                target_temp_f: 35.0,
                timeout_seconds: 300.0,
            },
            priming: PrimingConfig {
                flush_seconds: 60.0,
                pump_seconds: 15.0,
                fill_seconds: 15.0,
            },
            priming_enabled: false,
            bin_full_threshold_f: 35.0,
            poll_interval_seconds: 5.0,
            standby_timeout_seconds: 1200.0,
            plate_sensor_id: "092101487373".to_owned(),
            bin_sensor_id: "3c01f0956abd".to_owned(),
            use_simulator: false,
            simulator_speed: 1.0,
            data_dir: PathBuf::from("data"),
            environment: Environment::Development,
        }
    }
}

impl IcemakerConfig {
    /// Restore the initial configuration record, discarding every runtime
    /// edit.
    pub fn reset_to_factory_defaults(&mut self) {
        *self = Self::default();
    }
}

/// Detect whether the process is running on a Raspberry Pi.
pub fn is_raspberry_pi() -> bool {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(cpuinfo) => cpuinfo.contains("Raspberry Pi") || cpuinfo.contains("BCM"),
        Err(_) => false,
    }
}

/// Load the configuration: defaults, then `.env`, then real environment
/// variables (highest priority).
///
/// `env` forces the deployment environment; otherwise `ICEMAKER_ENV` is
/// consulted and a Raspberry Pi defaults to production.
pub fn load_config(env: Option<Environment>) -> IcemakerConfig {
    let dotenv = load_dotenv(Path::new(".env"));
    let lookup = |key: &str| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned());

    let mut config = IcemakerConfig {
        environment: resolve_environment(env, &lookup),
        ..IcemakerConfig::default()
    };
    apply_env_overrides(&mut config, &lookup);

    info!(
        "Configuration loaded for environment: {:?}",
        config.environment
    );
    config
}

/// Parse a `.env` file into a map. Missing file is not an error; the real
/// environment always takes precedence over these values.
pub fn load_dotenv(path: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return vars;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_owned();
            let value = value.trim().trim_matches('"').trim_matches('\'').to_owned();
            vars.insert(key, value);
        }
    }
    vars
}

/// Resolve the deployment environment: explicit flag > `ICEMAKER_ENV` >
/// Raspberry Pi auto-detect > development.
pub fn resolve_environment(
    explicit: Option<Environment>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Environment {
    if let Some(env) = explicit {
        return env;
    }
    if let Some(name) = lookup("ICEMAKER_ENV") {
        match name.to_ascii_lowercase().as_str() {
            "production" => return Environment::Production,
            "development" => return Environment::Development,
            other => warn!("Unknown ICEMAKER_ENV '{other}', ignoring"),
        }
    }
    if is_raspberry_pi() {
        info!("Raspberry Pi detected, using production environment");
        Environment::Production
    } else {
        Environment::Development
    }
}

/// Apply `ICEMAKER_*` overrides onto a config record.
///
/// Invalid values are logged and skipped, never fatal.
pub fn apply_env_overrides(
    config: &mut IcemakerConfig,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    fn set_f64(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut f64) {
        if let Some(raw) = lookup(key) {
            match raw.parse::<f64>() {
                Ok(v) => {
                    debug!("Applied env override: {key}={v}");
                    *slot = v;
                }
                Err(e) => warn!("Invalid env var {key}={raw}: {e}"),
            }
        }
    }

    fn set_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
        if let Some(raw) = lookup(key) {
            let v = matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on");
            debug!("Applied env override: {key}={v}");
            *slot = v;
        }
    }

    set_f64(lookup, "ICEMAKER_PRECHILL_TEMP", &mut config.prechill.target_temp_f);
    set_f64(lookup, "ICEMAKER_PRECHILL_TIMEOUT", &mut config.prechill.timeout_seconds);
    set_f64(lookup, "ICEMAKER_ICE_TEMP", &mut config.ice_making.target_temp_f);
    set_f64(lookup, "ICEMAKER_ICE_TIMEOUT", &mut config.ice_making.timeout_seconds);
    set_f64(lookup, "ICEMAKER_HARVEST_TEMP", &mut config.harvest.target_temp_f);
    set_f64(lookup, "ICEMAKER_HARVEST_TIMEOUT", &mut config.harvest.timeout_seconds);
    set_f64(lookup, "ICEMAKER_HARVEST_FILL_TIME", &mut config.harvest.fill_time_seconds);
    set_f64(lookup, "ICEMAKER_RECHILL_TEMP", &mut config.rechill.target_temp_f);
    set_f64(lookup, "ICEMAKER_RECHILL_TIMEOUT", &mut config.rechill.timeout_seconds);
    set_f64(lookup, "ICEMAKER_BIN_THRESHOLD", &mut config.bin_full_threshold_f);
    set_f64(lookup, "ICEMAKER_POLL_INTERVAL", &mut config.poll_interval_seconds);
    set_f64(lookup, "ICEMAKER_STANDBY_TIMEOUT", &mut config.standby_timeout_seconds);
    set_f64(lookup, "ICEMAKER_SIMULATOR_SPEED", &mut config.simulator_speed);
    set_bool(lookup, "ICEMAKER_USE_SIMULATOR", &mut config.use_simulator);
    set_bool(lookup, "ICEMAKER_PRIMING_ENABLED", &mut config.priming_enabled);

    if let Some(dir) = lookup("ICEMAKER_DATA_DIR") {
        debug!("Applied env override: ICEMAKER_DATA_DIR={dir}");
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(id) = lookup("ICEMAKER_PLATE_SENSOR_ID") {
        config.plate_sensor_id = id;
    }
    if let Some(id) = lookup("ICEMAKER_BIN_SENSOR_ID") {
        config.bin_sensor_id = id;
    }
}
