//! Physics-based thermal simulator.
//!
//! A discrete-tick model of the reservoir, cooling plate, plate ice layer,
//! and ice bin, driven by the relay states it observes through the mock
//! HAL. Fixed 1-second ticks keep the model deterministic regardless of
//! the speed multiplier: `update(dt)` converts wall time to whole simulated
//! ticks and carries the remainder.
//!
//! Ice growth follows the Stefan problem — conduction through the existing
//! ice layer limits the freezing rate, so the layer's own growth slows it
//! down. Harvest melts from the plate side; whatever sheet remains when the
//! hot-gas valve closes drops into the bin.

pub mod bodies;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;

use crate::hal::mock_gpio::MockGpio;
use crate::hal::mock_sensors::MockSensors;
use crate::hal::{RelayName, SensorName};
use bodies::{
    CoolingPlate, FREEZING_POINT_F, ICE_DENSITY, ICE_LATENT_HEAT, IceBin, Reservoir, delta_f_to_k,
};

/// Simulated seconds per tick.
pub const TICK_SIZE_SECONDS: f64 = 1.0;

/// Cap on ticks per `update()` call. At very high speed multipliers this
/// drops excess accumulated time instead of letting the physics run away
/// after a long stall.
pub const MAX_TICKS_PER_UPDATE: u32 = 100;

/// Wall-clock dt cap per `update()`; anything larger is a pause/suspend.
const MAX_WALL_DT: f64 = 0.5;

/// Shared handle: the simulator is written by the physics loop and the
/// relay-change callback, read by the sensor provider and the sim clock.
pub type SharedSimulator = Arc<Mutex<PhysicsSimulator>>;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Tuning parameters. Heat transfer coefficients in W/(m²·K), areas in m²,
/// flow in L/s, temperatures in °F.
///
/// Defaults are tuned so a full cycle lands inside the controller's
/// timeouts: prechill 70→32 °F in ~100 s, ice build to −2 °F in ~1200 s,
/// harvest to 38 °F in ~180 s, rechill 38→35 °F in ~10 s.
#[derive(Debug, Clone)]
pub struct SimParams {
    pub ambient_temp_f: f64,
    pub inlet_water_temp_f: f64,
    /// Evaporator refrigerant temperature.
    pub refrigerant_temp_f: f64,
    /// Hot-gas bypass temperature.
    pub hot_gas_temp_f: f64,

    pub h_refrigerant: f64,
    pub h_hotgas: f64,
    /// Forced convection, water over bare plate.
    pub h_water_plate: f64,
    pub h_ambient_water: f64,
    pub h_ambient_plate: f64,

    /// Ice thermal conductivity (W/(m·K)).
    pub ice_thermal_conductivity: f64,
    pub max_ice_thickness_m: f64,

    pub plate_water_contact_area: f64,
    pub evaporator_area: f64,
    pub reservoir_surface_area: f64,
    pub plate_ambient_area: f64,

    /// Inlet flow with the water valve open (L/s).
    pub water_inlet_flow_rate: f64,
    pub reservoir_volume_liters: f64,
    pub reservoir_max_volume_liters: f64,
    pub plate_mass_kg: f64,
    pub bin_capacity_kg: f64,

    pub speed_multiplier: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            ambient_temp_f: 70.0,
            inlet_water_temp_f: 65.0,
            refrigerant_temp_f: -20.0,
            hot_gas_temp_f: 140.0,
            h_refrigerant: 350.0,
            h_hotgas: 80.0,
            h_water_plate: 800.0,
            h_ambient_water: 5.0,
            h_ambient_plate: 8.0,
            ice_thermal_conductivity: 2.2,
            max_ice_thickness_m: 0.015,
            plate_water_contact_area: 0.08,
            evaporator_area: 0.02,
            reservoir_surface_area: 0.04,
            plate_ambient_area: 0.03,
            water_inlet_flow_rate: 0.05,
            reservoir_volume_liters: 1.0,
            reservoir_max_volume_liters: 1.5,
            plate_mass_kg: 0.5,
            bin_capacity_kg: 10.0,
            speed_multiplier: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct PhysicsSimulator {
    pub params: SimParams,
    reservoir: Reservoir,
    plate: CoolingPlate,
    ice_bin: IceBin,

    relay_states: HashMap<RelayName, bool>,

    /// Ice layer currently on the plate.
    ice_thickness_m: f64,
    ice_mass_kg: f64,

    /// Hot-gas level on the previous tick, for the harvest-completion edge.
    prev_hot_gas_on: bool,

    simulated_time_seconds: f64,
    /// Partial-tick accumulator.
    accumulated_time: f64,
    last_log_simtime: f64,
}

impl PhysicsSimulator {
    pub fn new(params: SimParams) -> Self {
        let reservoir = Reservoir {
            volume_liters: params.reservoir_volume_liters,
            temp_f: params.ambient_temp_f,
            max_volume_liters: params.reservoir_max_volume_liters,
        };
        let plate = CoolingPlate {
            mass_kg: params.plate_mass_kg,
            temp_f: params.ambient_temp_f,
        };
        let ice_bin = IceBin {
            ice_mass_kg: 0.0,
            temp_f: params.ambient_temp_f,
            max_ice_mass_kg: params.bin_capacity_kg,
        };
        Self {
            params,
            reservoir,
            plate,
            ice_bin,
            relay_states: RelayName::ALL.iter().map(|r| (*r, false)).collect(),
            ice_thickness_m: 0.0,
            ice_mass_kg: 0.0,
            prev_hot_gas_on: false,
            simulated_time_seconds: 0.0,
            accumulated_time: 0.0,
            last_log_simtime: 0.0,
        }
    }

    // ── HAL-facing surface ────────────────────────────────────

    /// Relay-change callback target (wired to the mock GPIO).
    pub fn set_relay_state(&mut self, relay: RelayName, on: bool) {
        self.relay_states.insert(relay, on);
    }

    /// Temperature provider target (wired to the mock sensors).
    pub fn get_temperature(&self, sensor: SensorName) -> f64 {
        match sensor {
            SensorName::Plate => self.plate.temp_f,
            SensorName::IceBin => self.ice_bin.temp_f,
        }
    }

    // ── Query surface ─────────────────────────────────────────

    pub fn simulated_time(&self) -> f64 {
        self.simulated_time_seconds
    }

    pub fn water_temp_f(&self) -> f64 {
        self.reservoir.temp_f
    }

    pub fn water_volume_liters(&self) -> f64 {
        self.reservoir.volume_liters
    }

    pub fn plate_temp_f(&self) -> f64 {
        self.plate.temp_f
    }

    pub fn bin_temp_f(&self) -> f64 {
        self.ice_bin.temp_f
    }

    pub fn ice_thickness_mm(&self) -> f64 {
        self.ice_thickness_m * 1000.0
    }

    pub fn bin_fill_percent(&self) -> f64 {
        self.ice_bin.fill_fraction() * 100.0
    }

    pub fn bin_ice_mass_kg(&self) -> f64 {
        self.ice_bin.ice_mass_kg
    }

    pub fn speed_multiplier(&self) -> f64 {
        self.params.speed_multiplier
    }

    /// Set the speed multiplier, clamped to [0.1, 1000].
    pub fn set_speed_multiplier(&mut self, multiplier: f64) {
        let multiplier = multiplier.clamp(0.1, 1000.0);
        self.params.speed_multiplier = multiplier;
        info!("Simulation speed set to {multiplier:.1}x");
    }

    // ── Stepping ──────────────────────────────────────────────

    /// Advance one fixed tick of simulated time.
    pub fn tick(&mut self) {
        self.update_physics(TICK_SIZE_SECONDS);
        self.simulated_time_seconds += TICK_SIZE_SECONDS;
    }

    /// Advance the simulation by a wall-clock step. Returns the number of
    /// whole ticks processed.
    pub fn update(&mut self, wallclock_dt: f64) -> u32 {
        let dt = wallclock_dt.min(MAX_WALL_DT);
        self.accumulated_time += dt * self.params.speed_multiplier;

        let mut ticks = 0;
        while self.accumulated_time >= TICK_SIZE_SECONDS && ticks < MAX_TICKS_PER_UPDATE {
            self.tick();
            self.accumulated_time -= TICK_SIZE_SECONDS;
            ticks += 1;
        }

        if ticks >= MAX_TICKS_PER_UPDATE && self.accumulated_time > TICK_SIZE_SECONDS {
            warn!(
                "Physics tick cap reached: discarding {:.1}s of accumulated time",
                self.accumulated_time
            );
            self.accumulated_time %= TICK_SIZE_SECONDS;
        }
        ticks
    }

    /// Return the model to initial conditions and drop all relay state.
    pub fn reset(&mut self, plate_temp_f: f64, water_temp_f: f64, water_volume: f64, bin_ice_mass: f64) {
        self.plate.temp_f = plate_temp_f;
        self.reservoir.temp_f = water_temp_f;
        self.reservoir.volume_liters = water_volume;
        self.ice_thickness_m = 0.0;
        self.ice_mass_kg = 0.0;
        self.ice_bin.ice_mass_kg = bin_ice_mass;
        self.ice_bin.update_temperature(self.params.ambient_temp_f);
        self.prev_hot_gas_on = false;
        self.simulated_time_seconds = 0.0;
        self.accumulated_time = 0.0;
        for relay in RelayName::ALL {
            self.relay_states.insert(relay, false);
        }
        info!(
            "Simulation reset: plate={plate_temp_f:.1}°F, water={water_temp_f:.1}°F, \
             volume={water_volume:.2}L, bin={:.1}% full",
            self.bin_fill_percent()
        );
    }

    /// Preload the bin to a fill fraction (test scenarios).
    pub fn preload_bin(&mut self, fill_fraction: f64) {
        self.ice_bin.ice_mass_kg = self.ice_bin.max_ice_mass_kg * fill_fraction.clamp(0.0, 1.0);
        self.ice_bin.update_temperature(self.params.ambient_temp_f);
    }

    // ── Relay helpers ─────────────────────────────────────────

    fn relay(&self, name: RelayName) -> bool {
        self.relay_states.get(&name).copied().unwrap_or(false)
    }

    fn compressor_on(&self) -> bool {
        self.relay(RelayName::Compressor1) || self.relay(RelayName::Compressor2)
    }

    // ── Physics ───────────────────────────────────────────────

    /// `Q = h · A · ΔT · dt`, with ΔT converted °F → K. Positive means
    /// heat flows from body 1 to body 2.
    fn heat_transfer(h: f64, area: f64, t1_f: f64, t2_f: f64, dt: f64) -> f64 {
        h * area * delta_f_to_k(t1_f - t2_f) * dt
    }

    /// Effective coefficient for water→plate exchange through the current
    /// ice layer: series resistance of water convection and ice conduction,
    /// `h_eff = 1 / (1/h_water + thickness/k_ice)`.
    fn effective_h_through_ice(&self) -> f64 {
        let p = &self.params;
        if self.ice_thickness_m <= 0.0 {
            return p.h_water_plate;
        }
        let r_water = 1.0 / p.h_water_plate;
        let r_ice = self.ice_thickness_m / p.ice_thermal_conductivity;
        1.0 / (r_water + r_ice)
    }

    fn update_physics(&mut self, dt: f64) {
        let p = self.params.clone();

        let compressor_on = self.compressor_on();
        let hot_gas_on = self.relay(RelayName::HotGasSolenoid);
        let pump_on = self.relay(RelayName::RecirculatingPump);
        let water_valve_on = self.relay(RelayName::WaterValve);

        // 1. Water inlet.
        if water_valve_on {
            let volume = p.water_inlet_flow_rate * dt;
            self.reservoir.add_water(volume, p.inlet_water_temp_f);
        }

        // 2. Plate ↔ water exchange.
        if pump_on {
            let plate_below_freezing = self.plate.temp_f < FREEZING_POINT_F;
            let water_can_freeze = self.reservoir.temp_f <= FREEZING_POINT_F + 0.5;

            if plate_below_freezing && water_can_freeze && compressor_on {
                // Ice-forming branch: Stefan conduction through the layer.
                // A minimum effective thickness stands in for nucleation.
                let delta_t_k = delta_f_to_k(FREEZING_POINT_F - self.plate.temp_f);
                let min_thickness = 0.0001; // 0.1 mm
                let thickness = self.ice_thickness_m.max(min_thickness);

                let q_through_ice =
                    p.ice_thermal_conductivity * p.plate_water_contact_area * delta_t_k / thickness;
                let energy_for_freezing = q_through_ice * dt;

                self.ice_mass_kg += energy_for_freezing / ICE_LATENT_HEAT;
                self.ice_thickness_m =
                    self.ice_mass_kg / (ICE_DENSITY * p.plate_water_contact_area);
                if self.ice_thickness_m > p.max_ice_thickness_m {
                    self.ice_thickness_m = p.max_ice_thickness_m;
                    self.ice_mass_kg =
                        self.ice_thickness_m * ICE_DENSITY * p.plate_water_contact_area;
                }

                // Excess heat above freezing is extracted first; the water
                // is pinned at 32 °F while the phase change runs.
                if self.reservoir.temp_f > FREEZING_POINT_F {
                    let q_to_freezing = Self::heat_transfer(
                        p.h_water_plate,
                        p.plate_water_contact_area,
                        self.reservoir.temp_f,
                        FREEZING_POINT_F,
                        dt,
                    );
                    self.reservoir.apply_heat(-q_to_freezing);
                    if self.reservoir.temp_f < FREEZING_POINT_F {
                        self.reservoir.temp_f = FREEZING_POINT_F;
                    }
                }

                // Latent heat conducted to the plate warms it against the
                // refrigerant; this is what sets the steady growth rate.
                self.plate.apply_heat(energy_for_freezing);
            } else {
                // Convective branch through whatever ice is present.
                let q = Self::heat_transfer(
                    self.effective_h_through_ice(),
                    p.plate_water_contact_area,
                    self.reservoir.temp_f,
                    self.plate.temp_f,
                    dt,
                );
                self.reservoir.apply_heat(-q);
                self.plate.apply_heat(q);
            }
        }

        // 3. Refrigerant cooling.
        if compressor_on && !hot_gas_on {
            let q = Self::heat_transfer(
                p.h_refrigerant,
                p.evaporator_area,
                self.plate.temp_f,
                p.refrigerant_temp_f,
                dt,
            );
            self.plate.apply_heat(-q);
        }

        // 4. Hot-gas heating.
        if compressor_on && hot_gas_on {
            let q_hotgas = Self::heat_transfer(
                p.h_hotgas,
                p.evaporator_area,
                p.hot_gas_temp_f,
                self.plate.temp_f,
                dt,
            );
            let ice_present = self.ice_mass_kg > 0.0;
            if ice_present && self.plate.temp_f <= FREEZING_POINT_F + 2.0 {
                // Sheet still bonded: 70 % of the energy melts ice at the
                // plate interface, 30 % raises the plate temperature.
                let energy = q_hotgas.max(0.0);
                let melted = (energy * 0.7) / ICE_LATENT_HEAT;
                self.ice_mass_kg = (self.ice_mass_kg - melted).max(0.0);
                self.ice_thickness_m = if self.ice_mass_kg > 0.0 {
                    self.ice_mass_kg / (ICE_DENSITY * p.plate_water_contact_area)
                } else {
                    0.0
                };
                self.plate.apply_heat(energy * 0.3);
            } else {
                self.plate.apply_heat(q_hotgas);
            }
        }

        // 5. Harvest completion edge: hot gas ON→OFF drops the remaining
        // sheet into the bin.
        if self.prev_hot_gas_on && !hot_gas_on {
            if self.ice_mass_kg > 0.0 {
                info!(
                    "Harvest complete: {:.3} kg ice transferred to bin ({:.1}% full)",
                    self.ice_mass_kg,
                    (self.ice_bin.ice_mass_kg + self.ice_mass_kg) / self.ice_bin.max_ice_mass_kg
                        * 100.0
                );
                self.ice_bin.add_ice(self.ice_mass_kg);
                self.ice_mass_kg = 0.0;
                self.ice_thickness_m = 0.0;
            }
        }
        self.prev_hot_gas_on = hot_gas_on;

        // 6. Bin melt under ambient convection.
        if self.ice_bin.ice_mass_kg > 0.0 {
            let q = Self::heat_transfer(
                IceBin::H_AMBIENT,
                IceBin::SURFACE_AREA,
                p.ambient_temp_f,
                FREEZING_POINT_F,
                dt,
            );
            if q > 0.0 {
                self.ice_bin.melt_ice(q);
            }
        }

        // 7. Bin sensor contact model.
        self.ice_bin.update_temperature(p.ambient_temp_f);

        // 8. Ambient drift.
        let q_reservoir = Self::heat_transfer(
            p.h_ambient_water,
            p.reservoir_surface_area,
            p.ambient_temp_f,
            self.reservoir.temp_f,
            dt,
        );
        self.reservoir.apply_heat(q_reservoir);

        if !compressor_on {
            let q_plate = Self::heat_transfer(
                p.h_ambient_plate,
                p.plate_ambient_area,
                p.ambient_temp_f,
                self.plate.temp_f,
                dt,
            );
            self.plate.apply_heat(q_plate);
        }
    }

    /// Periodic state line for the debug log.
    fn log_state(&mut self) {
        const LOG_INTERVAL: f64 = 10.0;
        if self.simulated_time_seconds - self.last_log_simtime < LOG_INTERVAL {
            return;
        }
        self.last_log_simtime = self.simulated_time_seconds;

        let comp = self.compressor_on();
        let hot_gas = self.relay(RelayName::HotGasSolenoid);
        let pump = self.relay(RelayName::RecirculatingPump);
        let mode = if hot_gas && comp {
            "HEATING"
        } else if comp && pump {
            "ICE_MAKING"
        } else if comp {
            "COOLING"
        } else {
            "IDLE"
        };
        debug!(
            "SIM t={:.1}s | mode={mode} | plate={:.1}°F water={:.1}°F | ice={:.1}mm | bin={:.0}%",
            self.simulated_time_seconds,
            self.plate.temp_f,
            self.reservoir.temp_f,
            self.ice_thickness_mm(),
            self.bin_fill_percent(),
        );
    }
}

// ---------------------------------------------------------------------------
// Wiring and the background loop
// ---------------------------------------------------------------------------

/// Build a shared simulator handle.
pub fn shared_simulator(params: SimParams) -> SharedSimulator {
    Arc::new(Mutex::new(PhysicsSimulator::new(params)))
}

/// Build mock GPIO + sensors bound to a shared simulator: relay changes
/// feed the model, temperature reads come from it. The simulator outlives
/// both mocks; the closures hold their own handles.
pub fn wire_simulated_hal(sim: &SharedSimulator) -> (Arc<MockGpio>, Arc<MockSensors>) {
    let gpio = Arc::new(MockGpio::new());
    let sensors = Arc::new(MockSensors::new());

    let sim_relays = Arc::clone(sim);
    gpio.set_change_callback(Box::new(move |relay, on| {
        sim_relays
            .lock()
            .expect("simulator lock poisoned")
            .set_relay_state(relay, on);
    }));

    let sim_temps = Arc::clone(sim);
    sensors.set_temperature_provider(Box::new(move |sensor| {
        sim_temps
            .lock()
            .expect("simulator lock poisoned")
            .get_temperature(sensor)
    }));

    (gpio, sensors)
}

/// Continuous physics loop. Steps the model with a fixed wall interval
/// (deterministic under load) until the shutdown signal flips.
pub async fn run_simulator(
    sim: SharedSimulator,
    update_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval_secs = update_interval.as_secs_f64();
    {
        let sim = sim.lock().expect("simulator lock poisoned");
        info!(
            "Physics simulation started (speed: {:.1}x)",
            sim.speed_multiplier()
        );
    }

    loop {
        {
            let mut sim = sim.lock().expect("simulator lock poisoned");
            sim.update(interval_secs);
            sim.log_state();
        }
        tokio::select! {
            () = tokio::time::sleep(update_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Physics simulation stopped");
}
