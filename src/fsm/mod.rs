//! Finite state machine engine.
//!
//! The engine owns the current/previous state, the shared runtime context,
//! and the clocks. It validates requested transitions against the table in
//! [`states`], stamps entry times atomically with the state change, and
//! emits the paired `STATE_EXIT` / `STATE_ENTER` events. The polling loop
//! that drives handlers lives in the controller; the engine is pure state
//! mechanics.

pub mod context;
pub mod states;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Notify;

use crate::clock::{Clock, SimClock, SystemClock};
use crate::events::{Event, EventBus, EventKind};
use context::FsmContext;
use states::{IcemakerState, can_transition};

/// The state machine engine.
pub struct Fsm {
    state: IcemakerState,
    previous: Option<IcemakerState>,
    context: Arc<Mutex<FsmContext>>,
    wall: SystemClock,
    sim_clock: Option<SimClock>,
    bus: Arc<EventBus>,
    state_changed: Arc<Notify>,
}

impl Fsm {
    /// Construct an engine in `initial` (OFF in production wiring).
    pub fn new(initial: IcemakerState, bus: Arc<EventBus>) -> Self {
        let fsm = Self {
            state: initial,
            previous: None,
            context: Arc::new(Mutex::new(FsmContext::default())),
            wall: SystemClock::new(),
            sim_clock: None,
            bus,
            state_changed: Arc::new(Notify::new()),
        };
        fsm.stamp_entry();
        fsm
    }

    /// Bind the simulated clock. From here on, `time_in_state` and the
    /// entry stamps use simulated seconds.
    pub fn bind_sim_clock(&mut self, clock: SimClock) {
        self.sim_clock = Some(clock);
        self.stamp_entry();
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> IcemakerState {
        self.state
    }

    pub fn previous_state(&self) -> Option<IcemakerState> {
        self.previous
    }

    /// Handle to the shared runtime context.
    pub fn context(&self) -> Arc<Mutex<FsmContext>> {
        Arc::clone(&self.context)
    }

    pub fn sim_clock(&self) -> Option<&SimClock> {
        self.sim_clock.as_ref()
    }

    /// Current time on the effective clock (simulated iff one is bound).
    pub fn now_secs(&self) -> f64 {
        match &self.sim_clock {
            Some(sim) => sim.now_secs(),
            None => self.wall.now_secs(),
        }
    }

    /// Seconds elapsed in the current state on the effective clock.
    pub fn time_in_state(&self) -> f64 {
        let ctx = self.context.lock().expect("fsm context lock poisoned");
        match &self.sim_clock {
            Some(sim) => sim.now_secs() - ctx.state_enter_simtime.unwrap_or(0.0),
            None => self.wall.now_secs() - ctx.state_enter_wallclock,
        }
    }

    // ── Transitions ───────────────────────────────────────────

    /// Attempt a table-validated transition. Invalid requests are logged and
    /// leave the state unchanged.
    pub async fn transition_to(&mut self, new_state: IcemakerState) -> bool {
        if !can_transition(self.state, new_state) {
            warn!("Invalid transition: {} -> {}", self.state, new_state);
            return false;
        }
        self.do_transition(new_state).await;
        true
    }

    /// Force a transition regardless of the table. Reserved for
    /// supervisor-level operations (emergency stop, operator-initiated
    /// start); handlers must use [`transition_to`](Self::transition_to).
    pub async fn force_to(&mut self, new_state: IcemakerState) {
        if new_state == self.state {
            return;
        }
        self.do_transition(new_state).await;
    }

    /// Wait until the state changes, or until `timeout` elapses.
    /// Returns `true` on a state change.
    pub async fn wait_for_state_change(&self, timeout: Option<Duration>) -> bool {
        let notified = self.state_changed.notified();
        match timeout {
            Some(t) => tokio::time::timeout(t, notified).await.is_ok(),
            None => {
                notified.await;
                true
            }
        }
    }

    /// Restore a persisted state pair without emitting transition events.
    /// Used once during snapshot recovery, before the loop starts.
    pub fn restore(&mut self, state: IcemakerState, previous: Option<IcemakerState>) {
        self.state = state;
        self.previous = previous;
        self.stamp_entry();
    }

    /// Emit the `STATE_ENTER` for the initial state. Called once by the
    /// controller before the first tick.
    pub async fn emit_initial_enter(&self) {
        self.bus
            .publish(Event::new(
                "fsm",
                EventKind::StateEnter {
                    state: self.state,
                    from: None,
                },
            ))
            .await;
    }

    // ── Internal ──────────────────────────────────────────────

    async fn do_transition(&mut self, new_state: IcemakerState) {
        let old = self.state;

        self.bus
            .publish(Event::new("fsm", EventKind::StateExit { state: old }))
            .await;

        self.previous = Some(old);
        self.state = new_state;
        self.stamp_entry();

        self.bus
            .publish(Event::new(
                "fsm",
                EventKind::StateEnter {
                    state: new_state,
                    from: Some(old),
                },
            ))
            .await;

        self.state_changed.notify_waiters();
        info!("State transition: {old} -> {new_state}");
    }

    /// Stamp the context's entry times for the current state. The wall
    /// stamp is always written; the simtime stamp only when a simulation
    /// clock is bound.
    fn stamp_entry(&self) {
        let mut ctx = self.context.lock().expect("fsm context lock poisoned");
        ctx.state_enter_wallclock = self.wall.now_secs();
        ctx.state_enter_simtime = self.sim_clock.as_ref().map(Clock::now_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingListener;

    fn engine() -> (Fsm, Arc<RecordingListener>) {
        let bus = Arc::new(EventBus::new());
        let rec = Arc::new(RecordingListener::default());
        bus.subscribe(rec.clone());
        (Fsm::new(IcemakerState::Off, bus), rec)
    }

    #[tokio::test]
    async fn valid_transition_updates_state_and_previous() {
        let (mut fsm, _rec) = engine();
        assert!(fsm.transition_to(IcemakerState::Standby).await);
        assert_eq!(fsm.state(), IcemakerState::Standby);
        assert_eq!(fsm.previous_state(), Some(IcemakerState::Off));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_and_state_unchanged() {
        let (mut fsm, rec) = engine();
        assert!(!fsm.transition_to(IcemakerState::Ice).await);
        assert_eq!(fsm.state(), IcemakerState::Off);
        assert!(rec.kinds().is_empty(), "no events for rejected transition");
    }

    #[tokio::test]
    async fn exit_precedes_enter_for_every_transition() {
        let (mut fsm, rec) = engine();
        fsm.transition_to(IcemakerState::Standby).await;
        fsm.transition_to(IcemakerState::Chill).await;
        assert_eq!(
            rec.kinds(),
            vec!["STATE_EXIT", "STATE_ENTER", "STATE_EXIT", "STATE_ENTER"]
        );
        let events = rec.events.lock().unwrap();
        match (&events[0].kind, &events[1].kind) {
            (
                EventKind::StateExit { state: exited },
                EventKind::StateEnter { state: entered, from },
            ) => {
                assert_eq!(*exited, IcemakerState::Off);
                assert_eq!(*entered, IcemakerState::Standby);
                assert_eq!(*from, Some(IcemakerState::Off));
            }
            other => panic!("unexpected event pair: {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_to_bypasses_the_table() {
        let (mut fsm, rec) = engine();
        fsm.force_to(IcemakerState::Chill).await;
        assert_eq!(fsm.state(), IcemakerState::Chill);
        assert_eq!(rec.kinds(), vec!["STATE_EXIT", "STATE_ENTER"]);
    }

    #[tokio::test]
    async fn entry_stamp_updates_on_transition() {
        let (mut fsm, _rec) = engine();
        let before = fsm.context().lock().unwrap().state_enter_wallclock;
        tokio::time::sleep(Duration::from_millis(5)).await;
        fsm.transition_to(IcemakerState::Standby).await;
        let after = fsm.context().lock().unwrap().state_enter_wallclock;
        assert!(after > before);
        assert!(fsm.time_in_state() < 1.0);
    }

    #[tokio::test]
    async fn wait_for_state_change_times_out() {
        let (fsm, _rec) = engine();
        let changed = fsm
            .wait_for_state_change(Some(Duration::from_millis(20)))
            .await;
        assert!(!changed);
    }
}
