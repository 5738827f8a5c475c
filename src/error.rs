//! Unified error types for the icectl control core.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! controller loop's error handling uniform. Sensor read failures are *not*
//! errors — the HAL degrades them to a 70 °F ambient reading so they never
//! reach the state machine (see `hal`).

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the control core funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A relay operation failed at the hardware boundary.
    Hal(HalError),
    /// Configuration is invalid or could not be applied.
    Config(&'static str),
    /// An operation was refused in the current operational state.
    Denied(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hal(e) => write!(f, "hal: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Denied(msg) => write!(f, "denied: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// HAL errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// A relay was commanded before `setup()` configured it.
    RelayNotConfigured(&'static str),
    /// The GPIO subsystem rejected an operation.
    Gpio(String),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayNotConfigured(name) => write!(f, "relay {name} not configured"),
            Self::Gpio(msg) => write!(f, "GPIO: {msg}"),
        }
    }
}

impl From<HalError> for Error {
    fn from(e: HalError) -> Self {
        Self::Hal(e)
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::gpio::Error> for HalError {
    fn from(e: rppal::gpio::Error) -> Self {
        Self::Gpio(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
