//! Thermal bodies of the physics simulation.
//!
//! Each body carries its thermal mass and applies heat in Joules;
//! temperature bookkeeping stays in Fahrenheit at the interface, with the
//! ΔT converted through Kelvin inside (`ΔT(K) = Q / (m·c)`).

use log::debug;

/// Water freezing point (°F).
pub const FREEZING_POINT_F: f64 = 32.0;
/// Latent heat of fusion for ice (J/kg).
pub const ICE_LATENT_HEAT: f64 = 334_000.0;
/// Ice density (kg/m³).
pub const ICE_DENSITY: f64 = 917.0;
/// Water density (kg/L).
pub const WATER_DENSITY: f64 = 1.0;
/// Water specific heat (J/(kg·K)).
pub const WATER_SPECIFIC_HEAT: f64 = 4186.0;
/// Aluminum specific heat (J/(kg·K)).
pub const ALUMINUM_SPECIFIC_HEAT: f64 = 897.0;

/// ΔT Fahrenheit → Kelvin.
pub fn delta_f_to_k(delta_f: f64) -> f64 {
    delta_f * 5.0 / 9.0
}

/// ΔT Kelvin → Fahrenheit.
pub fn delta_k_to_f(delta_k: f64) -> f64 {
    delta_k * 9.0 / 5.0
}

// ---------------------------------------------------------------------------
// Reservoir
// ---------------------------------------------------------------------------

/// Water reservoir: receives inlet water, overflows above capacity, and
/// exchanges heat with the plate and ambient air.
#[derive(Debug, Clone)]
pub struct Reservoir {
    pub volume_liters: f64,
    pub temp_f: f64,
    pub max_volume_liters: f64,
}

impl Reservoir {
    pub fn mass_kg(&self) -> f64 {
        self.volume_liters * WATER_DENSITY
    }

    /// Energy needed to change the water temperature by 1 K (J/K).
    pub fn thermal_mass(&self) -> f64 {
        self.mass_kg() * WATER_SPECIFIC_HEAT
    }

    /// Mix incoming water into the reservoir by volume-weighted mean
    /// (conservation of energy; density and specific heat cancel).
    /// Returns the overflowed volume, if any.
    pub fn add_water(&mut self, volume_liters: f64, temp_f: f64) -> f64 {
        if volume_liters <= 0.0 {
            return 0.0;
        }
        let total = self.volume_liters + volume_liters;
        self.temp_f = (self.volume_liters * self.temp_f + volume_liters * temp_f) / total;

        let overflow = (total - self.max_volume_liters).max(0.0);
        self.volume_liters = total.min(self.max_volume_liters);
        overflow
    }

    /// Apply heat in Joules (positive warms, negative cools).
    pub fn apply_heat(&mut self, joules: f64) {
        let thermal_mass = self.thermal_mass();
        if thermal_mass <= 0.0 {
            return;
        }
        self.temp_f += delta_k_to_f(joules / thermal_mass);
    }
}

// ---------------------------------------------------------------------------
// Cooling plate
// ---------------------------------------------------------------------------

/// Aluminum evaporator plate: cooled by refrigerant, heated by hot gas,
/// exchanging heat with the recirculated water.
#[derive(Debug, Clone)]
pub struct CoolingPlate {
    pub mass_kg: f64,
    pub temp_f: f64,
}

impl CoolingPlate {
    /// Energy needed to change the plate temperature by 1 K (J/K).
    pub fn thermal_mass(&self) -> f64 {
        self.mass_kg * ALUMINUM_SPECIFIC_HEAT
    }

    /// Apply heat in Joules (positive warms, negative cools).
    pub fn apply_heat(&mut self, joules: f64) {
        let thermal_mass = self.thermal_mass();
        if thermal_mass <= 0.0 {
            return;
        }
        self.temp_f += delta_k_to_f(joules / thermal_mass);
    }
}

// ---------------------------------------------------------------------------
// Ice bin
// ---------------------------------------------------------------------------

/// Ice storage bin with the sensor-contact model.
///
/// The bin sensor sits at the fill line: once accumulated ice reaches it
/// (~70 % of capacity) the sensor reads freezing; below that it reads
/// ambient air. Bin ice melts slowly under ambient convection.
#[derive(Debug, Clone)]
pub struct IceBin {
    pub ice_mass_kg: f64,
    /// Reported sensor temperature (°F).
    pub temp_f: f64,
    pub max_ice_mass_kg: f64,
}

impl IceBin {
    /// Exposed surface for ambient heat transfer (m²).
    pub const SURFACE_AREA: f64 = 0.2;
    /// Natural convection into the bin (W/(m²·K)).
    pub const H_AMBIENT: f64 = 5.0;
    /// Fill fraction at which ice contacts the sensor.
    pub const SENSOR_CONTACT_FILL: f64 = 0.7;

    /// Fraction of capacity filled, 0.0 – 1.0.
    pub fn fill_fraction(&self) -> f64 {
        (self.ice_mass_kg / self.max_ice_mass_kg).min(1.0)
    }

    pub fn is_full(&self) -> bool {
        self.ice_mass_kg >= self.max_ice_mass_kg
    }

    /// Add harvested ice, capped at capacity.
    pub fn add_ice(&mut self, mass_kg: f64) {
        self.ice_mass_kg = (self.ice_mass_kg + mass_kg).min(self.max_ice_mass_kg);
        debug!(
            "Bin ice: added {mass_kg:.3} kg, total {:.3} kg ({:.0}% full)",
            self.ice_mass_kg,
            self.fill_fraction() * 100.0
        );
    }

    /// Melt bin ice with the given heat input. Returns the mass melted.
    pub fn melt_ice(&mut self, energy_joules: f64) -> f64 {
        if self.ice_mass_kg <= 0.0 || energy_joules <= 0.0 {
            return 0.0;
        }
        let melted = (energy_joules / ICE_LATENT_HEAT).min(self.ice_mass_kg);
        self.ice_mass_kg -= melted;
        melted
    }

    /// Update the reported sensor temperature from the fill level.
    pub fn update_temperature(&mut self, ambient_temp_f: f64) {
        self.temp_f = if self.fill_fraction() < Self::SENSOR_CONTACT_FILL {
            ambient_temp_f
        } else {
            FREEZING_POINT_F
        };
    }
}
