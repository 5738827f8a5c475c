//! Typed event records and the append-only fan-out bus.
//!
//! Events are produced by the FSM (state enter/exit/timeout), the controller
//! (relay changes, cycle lifecycle, bin level), and the sensor poller
//! (temperature readings). Listeners are registered once at wiring time and
//! receive every event in emission order. Dispatch is best-effort: a failing
//! listener is logged and the remaining listeners still run.

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use log::warn;

use crate::fsm::states::IcemakerState;
use crate::hal::RelayName;

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// A single event instance: when it happened, who emitted it, and what.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: SystemTime,
    /// Emitting component ("fsm", "controller", "sensors", "gpio").
    pub source: &'static str,
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: &'static str, kind: EventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source,
            kind,
        }
    }
}

/// Every event kind in the system, with its kind-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // -- State machine --
    StateEnter {
        state: IcemakerState,
        from: Option<IcemakerState>,
    },
    StateExit {
        state: IcemakerState,
    },
    StateTimeout {
        state: IcemakerState,
        elapsed: f64,
        timeout: f64,
    },

    // -- Temperature --
    TempReading {
        plate_f: f64,
        bin_f: f64,
    },

    // -- Control --
    StartCycle,
    StopCycle,
    EmergencyStop,

    // -- Hardware --
    RelayChanged {
        relay: RelayName,
        on: bool,
    },

    // -- Cycle / bin --
    CycleComplete {
        lifetime_count: u64,
        session_count: u64,
    },
    BinFull,
    BinNotFull,

    // -- Errors --
    Error {
        message: String,
    },
    Recovered,
}

impl EventKind {
    /// Stable wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateEnter { .. } => "STATE_ENTER",
            Self::StateExit { .. } => "STATE_EXIT",
            Self::StateTimeout { .. } => "STATE_TIMEOUT",
            Self::TempReading { .. } => "TEMP_READING",
            Self::StartCycle => "START_CYCLE",
            Self::StopCycle => "STOP_CYCLE",
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::RelayChanged { .. } => "RELAY_CHANGED",
            Self::CycleComplete { .. } => "CYCLE_COMPLETE",
            Self::BinFull => "BIN_FULL",
            Self::BinNotFull => "BIN_NOT_FULL",
            Self::Error { .. } => "ERROR",
            Self::Recovered => "RECOVERED",
        }
    }
}

// ---------------------------------------------------------------------------
// Listener trait and bus
// ---------------------------------------------------------------------------

/// Consumers of the event stream (loggers, the external API façade, tests).
///
/// `on_event` may suspend; the bus awaits each listener in sequence.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Fan-out bus. Listeners are appended once and never removed mid-run;
/// emission never fails the emitter.
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for all subsequent events.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("event listener lock poisoned")
            .push(listener);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .expect("event listener lock poisoned")
            .len()
    }

    /// Deliver an event to every listener in registration order.
    pub async fn publish(&self, event: Event) {
        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .expect("event listener lock poisoned")
            .clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!("Event listener error on {}: {e}", event.kind.name());
            }
        }
    }
}

/// Listener that mirrors every event to the log at debug level.
pub struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        log::debug!("[{}] {:?}", event.source, event.kind);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording listener shared by the unit and integration tests.

    use std::sync::Mutex;

    use super::*;

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
    }

    #[async_trait]
    impl EventListener for RecordingListener {
        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}
