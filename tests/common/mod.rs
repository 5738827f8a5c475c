//! Shared fixtures for the controller integration tests.
//!
//! Two harnesses: `sim_harness` wires the controller to the physics
//! simulator in lockstep (tests advance simulated time by hand, so runs
//! are deterministic at any speed); `mock_harness` uses static mock
//! sensors for guard-level tests that pin temperatures directly.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use icectl::clock::SimClock;
use icectl::config::IcemakerConfig;
use icectl::controller::Controller;
use icectl::events::{Event, EventKind, EventListener};
use icectl::fsm::states::IcemakerState;
use icectl::hal::mock_gpio::MockGpio;
use icectl::hal::mock_sensors::MockSensors;
use icectl::sim::{SharedSimulator, SimParams, shared_simulator, wire_simulated_hal};

// ── Recording listener ────────────────────────────────────────

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.name())
            .collect()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.kinds().iter().filter(|k| **k == name).count()
    }

    pub fn relay_changes(&self) -> Vec<(icectl::hal::RelayName, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::RelayChanged { relay, on } => Some((relay, on)),
                _ => None,
            })
            .collect()
    }

    pub fn entered_states(&self) -> Vec<IcemakerState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::StateEnter { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ── Config / data-dir fixtures ────────────────────────────────

pub fn temp_data_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("icectl-itests")
        .join(format!("{tag}-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

/// Default config pointed at a fresh per-test data directory.
pub fn test_config(tag: &str) -> IcemakerConfig {
    IcemakerConfig {
        data_dir: temp_data_dir(tag),
        ..IcemakerConfig::default()
    }
}

// ── Harnesses ─────────────────────────────────────────────────

pub struct SimHarness {
    pub controller: Controller,
    pub sim: SharedSimulator,
    pub gpio: Arc<MockGpio>,
    pub rec: Arc<RecordingListener>,
}

/// Controller wired to the physics simulator, sim clock bound. Callers
/// run `controller.initialize()` themselves (some tests seed the data
/// directory first).
pub fn sim_harness(config: IcemakerConfig) -> SimHarness {
    let sim = shared_simulator(SimParams::default());
    let (gpio, sensors) = wire_simulated_hal(&sim);
    let mut controller = Controller::new(config, gpio.clone(), sensors);
    controller.bind_sim_clock(SimClock::new(Arc::clone(&sim)));
    let rec = Arc::new(RecordingListener::default());
    controller.subscribe(rec.clone());
    SimHarness {
        controller,
        sim,
        gpio,
        rec,
    }
}

pub struct MockHarness {
    pub controller: Controller,
    pub gpio: Arc<MockGpio>,
    pub sensors: Arc<MockSensors>,
    pub rec: Arc<RecordingListener>,
}

/// Controller on static mock sensors (wall clock, pinned temperatures).
pub fn mock_harness(config: IcemakerConfig) -> MockHarness {
    let gpio = Arc::new(MockGpio::new());
    let sensors = Arc::new(MockSensors::new());
    let controller = Controller::new(config, gpio.clone(), sensors.clone());
    let rec = Arc::new(RecordingListener::default());
    controller.subscribe(rec.clone());
    MockHarness {
        controller,
        gpio,
        sensors,
        rec,
    }
}

// ── Lockstep stepping ─────────────────────────────────────────

impl SimHarness {
    /// One lockstep iteration: refresh sensors, run one FSM tick, advance
    /// the simulator by one poll interval of simulated time.
    pub async fn step(&mut self) {
        self.controller.poll_sensors_once().await;
        self.controller.tick().await;
        let ticks = self.controller.config().poll_interval_seconds.round() as usize;
        let mut sim = self.sim.lock().unwrap();
        for _ in 0..ticks {
            sim.tick();
        }
    }

    /// Step until the FSM reaches `target`. Returns the number of steps
    /// taken, or `None` if `max_steps` was exhausted first.
    pub async fn run_until(&mut self, target: IcemakerState, max_steps: usize) -> Option<usize> {
        for n in 0..max_steps {
            if self.controller.state() == target {
                return Some(n);
            }
            self.step().await;
        }
        (self.controller.state() == target).then_some(max_steps)
    }

    pub fn sim_time(&self) -> f64 {
        self.sim.lock().unwrap().simulated_time()
    }
}

impl MockHarness {
    /// Pin both sensor temperatures, refresh the context, run one tick.
    pub async fn tick_at(&mut self, plate_f: f64, bin_f: f64) {
        self.sensors
            .set_temperature(icectl::hal::SensorName::Plate, plate_f);
        self.sensors
            .set_temperature(icectl::hal::SensorName::IceBin, bin_f);
        self.controller.poll_sensors_once().await;
        self.controller.tick().await;
    }
}
