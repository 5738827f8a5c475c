//! Shared runtime context threaded through every state handler.
//!
//! Two writers touch this record: the sensor poller (temperature fields)
//! and the FSM/controller (state timing, targets, counters, chill mode).
//! The fields are disjoint between the two, but the context still lives
//! behind a mutex because the writers are separate tasks. The lock is never
//! held across an await.

use serde::{Deserialize, Serialize};

use super::states::ChillMode;

/// Seeded temperature before the first sensor poll (ambient).
pub const DEFAULT_TEMP_F: f64 = 70.0;

/// Runtime context for the FSM.
///
/// Contains the latest sensor readings, the active setpoint, timing
/// stamps, and cycle statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmContext {
    /// Last plate temperature reading (°F).
    pub plate_temp_f: f64,
    /// Last ice-bin temperature reading (°F).
    pub bin_temp_f: f64,
    /// Active state's target temperature (°F); set on state entry.
    pub target_temp_f: f64,

    /// Completed rechill cycles across the machine's lifetime (persisted).
    pub lifetime_cycle_count: u64,
    /// Completed rechill cycles since this process started.
    pub session_cycle_count: u64,

    /// Wall-clock stamp (monotonic seconds) of the last state entry.
    pub state_enter_wallclock: f64,
    /// Simulated-time stamp of the last state entry; present only when a
    /// simulation clock is bound.
    pub state_enter_simtime: Option<f64>,

    /// Clock stamp of the start of the current ice-making cycle.
    pub cycle_start_time: Option<f64>,
    /// Active CHILL sub-mode, if any.
    pub chill_mode: Option<ChillMode>,
}

impl Default for FsmContext {
    fn default() -> Self {
        Self {
            plate_temp_f: DEFAULT_TEMP_F,
            bin_temp_f: DEFAULT_TEMP_F,
            target_temp_f: 32.0,
            lifetime_cycle_count: 0,
            session_cycle_count: 0,
            state_enter_wallclock: 0.0,
            state_enter_simtime: None,
            cycle_start_time: None,
            chill_mode: None,
        }
    }
}
