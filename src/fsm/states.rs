//! State alphabet, chill sub-modes, and the transition table.
//!
//! ```text
//!  OFF ──start──▶ POWER_ON ──▶ CHILL(prechill) ──▶ ICE ──▶ HEAT
//!                                  ▲                         │
//!                                  └──────── rechill ◀───────┘
//!
//!  CHILL(rechill done) ──▶ IDLE (bin full) / STANDBY (shutdown requested)
//!  STANDBY ──timeout──▶ OFF      ERROR ──operator──▶ OFF
//! ```
//!
//! The table below is the single source of truth for which transitions the
//! engine accepts from state handlers. Supervisor-level operations
//! (`emergency_stop`, operator-initiated start) may bypass it via
//! [`Fsm::force_to`](super::Fsm::force_to).

use serde::{Deserialize, Serialize};

/// Ice-maker operational states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IcemakerState {
    /// Machine powered down; unique initial state.
    Off,
    /// Transitional rest: ice cutter finishes residual cutting, then auto-OFF.
    Standby,
    /// Bin full; waiting for ice to melt down below the sensor.
    Idle,
    /// Water-system priming sequence (flush / pump / fill).
    PowerOn,
    /// Cooling the plate (prechill or rechill sub-mode).
    Chill,
    /// Ice formation with recirculation.
    Ice,
    /// Harvest: hot gas releases the ice sheet.
    Heat,
    /// Absorbing fault state; all relays off until the operator clears it.
    Error,
    /// Transient drain toward OFF.
    Shutdown,
    /// Manual relay control for service; handlers are inert.
    Diagnostic,
}

impl IcemakerState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Off,
        Self::Standby,
        Self::Idle,
        Self::PowerOn,
        Self::Chill,
        Self::Ice,
        Self::Heat,
        Self::Error,
        Self::Shutdown,
        Self::Diagnostic,
    ];

    /// Stable wire/log name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Standby => "STANDBY",
            Self::Idle => "IDLE",
            Self::PowerOn => "POWER_ON",
            Self::Chill => "CHILL",
            Self::Ice => "ICE",
            Self::Heat => "HEAT",
            Self::Error => "ERROR",
            Self::Shutdown => "SHUTDOWN",
            Self::Diagnostic => "DIAGNOSTIC",
        }
    }

    /// States a handler may legally transition to from `self`.
    pub fn allowed_transitions(self) -> &'static [IcemakerState] {
        use IcemakerState::*;
        match self {
            Off => &[PowerOn, Standby, Shutdown, Diagnostic],
            Standby => &[Chill, Off, Shutdown],
            Idle => &[Chill, Standby, Off, Shutdown],
            PowerOn => &[Standby, Chill, Error, Shutdown],
            Chill => &[Ice, Idle, Standby, Off, Error, Shutdown],
            Ice => &[Heat, Idle, Standby, Error, Shutdown],
            Heat => &[Chill, Idle, Standby, Error, Shutdown],
            Error => &[Off, Shutdown],
            Shutdown => &[Off],
            Diagnostic => &[Off],
        }
    }
}

impl core::fmt::Display for IcemakerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Check whether `from → to` is a legal handler transition.
pub fn can_transition(from: IcemakerState, to: IcemakerState) -> bool {
    from.allowed_transitions().contains(&to)
}

/// Sub-modes of the CHILL state.
///
/// Prechill brings a warm plate down to 32 °F before ice making; rechill
/// drives the post-harvest plate (~38 °F) back to 35 °F before the next
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChillMode {
    Prechill,
    Rechill,
}
