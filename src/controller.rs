//! Controller: state handlers, external operations, and the run loop.
//!
//! The controller owns the HAL handles, the FSM engine, the event bus, and
//! the persistence store, and implements the ice-making protocol:
//!
//! ```text
//! start ──▶ POWER_ON (priming) ──▶ CHILL(prechill, 32°F) ──▶ ICE(−2°F)
//!                                        ▲                      │
//!                                        │                      ▼
//!              IDLE ◀── bin full ── CHILL(rechill, 35°F) ◀── HEAT(38°F)
//! ```
//!
//! Every handler writes the full relay matrix for its state each tick and
//! then evaluates its guards — no relay value is remembered across
//! handlers. Per-state timeouts in CHILL/ICE/HEAT advance the cycle rather
//! than fault it; the STANDBY timeout forces OFF.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::clock::{Clock, LOCKSTEP_POLL_INTERVAL, SimClock};
use crate::config::IcemakerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind, EventListener};
use crate::fsm::Fsm;
use crate::fsm::context::FsmContext;
use crate::fsm::states::{ChillMode, IcemakerState, can_transition};
use crate::hal::{
    FALLBACK_TEMP_F, RelayControl, RelayName, SensorName, TemperatureSensors,
    default_relay_config,
};
use crate::persist::{DataStore, StateSnapshot};

/// How long stopping waits for cooperative tasks before aborting them.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Commands and status
// ---------------------------------------------------------------------------

/// Operations external adapters can request while the loop is running.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    StartIcemaking,
    /// Operator-initiated power-on (primes, then rests in STANDBY).
    PowerOn,
    PowerOff,
    EmergencyStop,
    EnterDiagnostic,
    ExitDiagnostic,
    /// Direct relay control; honored only in DIAGNOSTIC.
    SetRelay {
        relay: RelayName,
        on: bool,
    },
    UpdateConfig(Box<IcemakerConfig>),
    ResetConfig,
    /// Stop the loop. With `preserve_relays` the relay matrix is left live
    /// and a restart snapshot is written instead of the usual all-off.
    Stop {
        preserve_relays: bool,
    },
}

/// Cloneable handle for sending commands into a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    cmd_tx: mpsc::Sender<ControlCommand>,
}

impl ControllerHandle {
    pub async fn send(&self, cmd: ControlCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("Controller command channel closed");
        }
    }

    pub async fn stop(&self) {
        self.send(ControlCommand::Stop {
            preserve_relays: false,
        })
        .await;
    }
}

/// Point-in-time view of the machine, as served to the external API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ControllerStatus {
    pub state: IcemakerState,
    pub previous_state: Option<IcemakerState>,
    pub plate_temp_f: f64,
    pub bin_temp_f: f64,
    pub target_temp_f: f64,
    pub lifetime_cycle_count: u64,
    pub session_cycle_count: u64,
    pub time_in_state: f64,
    pub chill_mode: Option<ChillMode>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    config: IcemakerConfig,
    relays: Arc<dyn RelayControl>,
    sensors: Arc<dyn TemperatureSensors>,
    fsm: Fsm,
    bus: Arc<EventBus>,
    store: DataStore,

    /// Graceful shutdown: honored at the next rechill completion.
    shutdown_requested: bool,
    /// Mirrors the on-disk resume flag.
    ice_making_active: bool,
    /// Last observed bin predicate, for BIN_FULL/BIN_NOT_FULL edges.
    bin_full_latch: Option<bool>,

    cmd_tx: mpsc::Sender<ControlCommand>,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    shutdown_tx: watch::Sender<bool>,
    initialized: bool,
}

impl Controller {
    pub fn new(
        config: IcemakerConfig,
        relays: Arc<dyn RelayControl>,
        sensors: Arc<dyn TemperatureSensors>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let fsm = Fsm::new(IcemakerState::Off, Arc::clone(&bus));
        let store = DataStore::new(config.data_dir.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            relays,
            sensors,
            fsm,
            bus,
            store,
            shutdown_requested: false,
            ice_making_active: false,
            bin_full_latch: None,
            cmd_tx,
            cmd_rx,
            shutdown_tx,
            initialized: false,
        }
    }

    /// Drive state timing from the simulator clock (lockstep mode).
    pub fn bind_sim_clock(&mut self, clock: SimClock) {
        self.fsm.bind_sim_clock(clock);
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn state(&self) -> IcemakerState {
        self.fsm.state()
    }

    pub fn fsm(&self) -> &Fsm {
        &self.fsm
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Register an event listener (delegates to the bus).
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.bus.subscribe(listener);
    }

    pub fn config(&self) -> &IcemakerConfig {
        &self.config
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Shutdown signal observed by the sensor and simulator tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn status(&self) -> ControllerStatus {
        let ctx = self.ctx_snapshot();
        ControllerStatus {
            state: self.fsm.state(),
            previous_state: self.fsm.previous_state(),
            plate_temp_f: ctx.plate_temp_f,
            bin_temp_f: ctx.bin_temp_f,
            target_temp_f: ctx.target_temp_f,
            lifetime_cycle_count: ctx.lifetime_cycle_count,
            session_cycle_count: ctx.session_cycle_count,
            time_in_state: self.fsm.time_in_state(),
            chill_mode: ctx.chill_mode,
        }
    }

    pub fn update_config(&mut self, config: IcemakerConfig) {
        info!("Configuration updated at runtime");
        self.config = config;
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Set up the HAL, load persisted state, and perform power-loss
    /// recovery. Must run before the first tick.
    pub async fn initialize(&mut self) -> Result<()> {
        self.relays.setup(default_relay_config()).await?;
        self.sensors
            .setup(HashMap::from([
                (SensorName::Plate, self.config.plate_sensor_id.clone()),
                (SensorName::IceBin, self.config.bin_sensor_id.clone()),
            ]))
            .await;

        let lifetime = self.store.load_cycle_count();
        self.with_ctx(|ctx| ctx.lifetime_cycle_count = lifetime);

        if let Some(snapshot) = self.store.load_snapshot() {
            self.restore_snapshot(snapshot, lifetime).await?;
        }

        self.initialized = true;
        info!("Controller initialized (lifetime cycles: {lifetime})");

        // Power-loss recovery: the resume flag re-arms ice making.
        if self.store.ice_making_active() && self.fsm.state() == IcemakerState::Off {
            info!("Ice-making resume flag present, restarting after power loss");
            self.start_icemaking().await;
        }
        Ok(())
    }

    /// Relays are written before the FSM state is restored, so the machine
    /// is physically consistent the moment handlers resume.
    async fn restore_snapshot(&mut self, snapshot: StateSnapshot, disk_lifetime: u64) -> Result<()> {
        info!("Restoring state snapshot ({})", snapshot.state);
        for (relay, on) in snapshot.relay_states() {
            self.set_relay(relay, on).await?;
        }
        let mut restored = snapshot.context.clone();
        restored.lifetime_cycle_count = restored.lifetime_cycle_count.max(disk_lifetime);
        restored.session_cycle_count = 0;
        self.with_ctx(|ctx| *ctx = restored.clone());
        self.fsm.restore(snapshot.state, snapshot.previous_state);
        self.ice_making_active = self.store.ice_making_active();
        self.store.clear_snapshot();
        Ok(())
    }

    /// Main loop: drain commands, tick the FSM, wait one poll interval.
    /// Returns after a `Stop` command, having drained the sensor task and
    /// (unless relays are preserved) driven everything off.
    pub async fn run(&mut self) -> Result<()> {
        if !self.initialized {
            self.initialize().await?;
        }
        self.fsm.emit_initial_enter().await;

        let mut sensor_task = tokio::spawn(sensor_poll_loop(
            Arc::clone(&self.sensors),
            self.fsm.context(),
            Arc::clone(&self.bus),
            self.config.poll_interval_seconds,
            self.fsm.sim_clock().cloned(),
            self.shutdown_tx.subscribe(),
        ));
        info!("Controller running in state {}", self.fsm.state());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut preserve_relays = false;
        'main: loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if let Some(preserve) = self.handle_command(cmd).await {
                    preserve_relays = preserve;
                    break 'main;
                }
            }
            self.tick().await;
            let interval = self.config.poll_interval_seconds;
            if !wait_poll_interval(interval, self.fsm.sim_clock(), &mut shutdown_rx).await {
                break;
            }
        }

        self.shutdown_tx.send_replace(true);
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, &mut sensor_task)
            .await
            .is_err()
        {
            warn!("Sensor task did not drain in time, aborting it");
            sensor_task.abort();
        }

        if preserve_relays {
            self.save_restart_snapshot().await;
        } else {
            if let Err(e) = self.all_relays_off().await {
                error!("Failed to clear relays on stop: {e}");
            }
            if let Err(e) = self.relays.cleanup().await {
                error!("HAL cleanup failed: {e}");
            }
        }
        info!("Controller stopped");
        Ok(())
    }

    /// Snapshot the live machine for a relay-preserving restart.
    pub async fn save_restart_snapshot(&self) {
        let relays = self.relays.get_all_relays().await;
        let snapshot = StateSnapshot::from_parts(
            self.fsm.state(),
            self.fsm.previous_state(),
            relays,
            self.ctx_snapshot(),
        );
        self.store.save_snapshot(&snapshot);
    }

    /// Process one queued command. `Some(preserve_relays)` means stop.
    async fn handle_command(&mut self, cmd: ControlCommand) -> Option<bool> {
        match cmd {
            ControlCommand::StartIcemaking => {
                self.start_icemaking().await;
            }
            ControlCommand::PowerOn => {
                self.power_on().await;
            }
            ControlCommand::PowerOff => {
                self.power_off().await;
            }
            ControlCommand::EmergencyStop => {
                self.emergency_stop().await;
            }
            ControlCommand::EnterDiagnostic => {
                self.enter_diagnostic().await;
            }
            ControlCommand::ExitDiagnostic => {
                if let Err(e) = self.exit_diagnostic().await {
                    warn!("Diagnostic exit failed: {e}");
                }
            }
            ControlCommand::SetRelay { relay, on } => {
                if let Err(e) = self.diagnostic_set_relay(relay, on).await {
                    warn!("Relay command rejected: {e}");
                }
            }
            ControlCommand::UpdateConfig(config) => self.update_config(*config),
            ControlCommand::ResetConfig => {
                self.config.reset_to_factory_defaults();
                info!("Configuration reset to factory defaults");
            }
            ControlCommand::Stop { preserve_relays } => return Some(preserve_relays),
        }
        None
    }

    // ── One FSM iteration ─────────────────────────────────────

    /// Run one polling-loop iteration: observational timeout event, handler
    /// dispatch, validated transition. Handler errors become an `ERROR`
    /// event plus a transition to ERROR where the table allows it.
    pub async fn tick(&mut self) {
        if let Some(timeout) = self.state_timeout() {
            let elapsed = self.fsm.time_in_state();
            if elapsed > timeout {
                self.bus
                    .publish(Event::new(
                        "fsm",
                        EventKind::StateTimeout {
                            state: self.fsm.state(),
                            elapsed,
                            timeout,
                        },
                    ))
                    .await;
            }
        }

        match self.dispatch().await {
            Ok(Some(next)) if next != self.fsm.state() => {
                self.fsm.transition_to(next).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Handler error in {}: {e}", self.fsm.state());
                self.bus
                    .publish(Event::new(
                        "fsm",
                        EventKind::Error {
                            message: e.to_string(),
                        },
                    ))
                    .await;
                if can_transition(self.fsm.state(), IcemakerState::Error) {
                    self.fsm.transition_to(IcemakerState::Error).await;
                }
            }
        }
    }

    /// Read the sensors once and refresh the context (the running loop does
    /// this from the background poller; tests drive it directly).
    pub async fn poll_sensors_once(&self) {
        let temps = self.sensors.read_all_temperatures().await;
        let plate = temps
            .get(&SensorName::Plate)
            .copied()
            .unwrap_or(FALLBACK_TEMP_F);
        let bin = temps
            .get(&SensorName::IceBin)
            .copied()
            .unwrap_or(FALLBACK_TEMP_F);
        self.with_ctx(|ctx| {
            ctx.plate_temp_f = plate;
            ctx.bin_temp_f = bin;
        });
        self.bus
            .publish(Event::new(
                "sensors",
                EventKind::TempReading {
                    plate_f: plate,
                    bin_f: bin,
                },
            ))
            .await;
    }

    // ── External operations ───────────────────────────────────

    /// Begin (or resume) ice making. Returns `false` when the current
    /// state does not permit it.
    pub async fn start_icemaking(&mut self) -> bool {
        match self.fsm.state() {
            IcemakerState::Off => {
                self.set_active(true);
                self.bus
                    .publish(Event::new("controller", EventKind::StartCycle))
                    .await;
                if self.config.priming_enabled {
                    self.fsm.transition_to(IcemakerState::PowerOn).await
                } else {
                    // Supervisor-level entry: the transition table governs
                    // handler returns, not operator start.
                    self.begin_prechill();
                    self.fsm.force_to(IcemakerState::Chill).await;
                    true
                }
            }
            IcemakerState::Standby | IcemakerState::Idle => {
                self.set_active(true);
                self.bus
                    .publish(Event::new("controller", EventKind::StartCycle))
                    .await;
                self.begin_prechill();
                self.fsm.transition_to(IcemakerState::Chill).await
            }
            state => {
                debug!("start_icemaking ignored in state {state}");
                false
            }
        }
    }

    /// Operator-initiated power-on: primes the water system, then rests in
    /// STANDBY (no ice-making flag set).
    pub async fn power_on(&mut self) -> bool {
        match self.fsm.state() {
            IcemakerState::Off => {
                if self.config.priming_enabled {
                    self.fsm.transition_to(IcemakerState::PowerOn).await
                } else {
                    self.fsm.transition_to(IcemakerState::Standby).await
                }
            }
            state => {
                debug!("power_on ignored in state {state}");
                false
            }
        }
    }

    /// Stop ice making. From rest states this is an immediate OFF; from an
    /// active cycle it sets the graceful-shutdown flag, honored when the
    /// current cycle's rechill completes.
    pub async fn power_off(&mut self) -> bool {
        self.set_active(false);
        self.bus
            .publish(Event::new("controller", EventKind::StopCycle))
            .await;
        match self.fsm.state() {
            IcemakerState::Standby | IcemakerState::Idle | IcemakerState::Error => {
                self.fsm.transition_to(IcemakerState::Off).await
            }
            IcemakerState::Chill | IcemakerState::Ice | IcemakerState::Heat => {
                info!("Graceful shutdown requested; finishing current cycle");
                self.shutdown_requested = true;
                true
            }
            IcemakerState::PowerOn => {
                // Priming continues, but with the flag cleared it settles
                // into STANDBY instead of starting a cycle.
                true
            }
            state => {
                debug!("power_off ignored in state {state}");
                false
            }
        }
    }

    /// Immediate halt: relays off, state forced to OFF, flag cleared.
    pub async fn emergency_stop(&mut self) {
        warn!("EMERGENCY STOP");
        if let Err(e) = self.all_relays_off().await {
            error!("Emergency relay shutdown failed: {e}");
        }
        self.set_active(false);
        self.shutdown_requested = false;
        self.fsm.force_to(IcemakerState::Off).await;
        self.bus
            .publish(Event::new("controller", EventKind::EmergencyStop))
            .await;
    }

    /// Enter service mode (from OFF only).
    pub async fn enter_diagnostic(&mut self) -> bool {
        match self.fsm.state() {
            IcemakerState::Off => self.fsm.transition_to(IcemakerState::Diagnostic).await,
            state => {
                debug!("enter_diagnostic ignored in state {state}");
                false
            }
        }
    }

    /// Leave service mode: everything off, back to OFF.
    pub async fn exit_diagnostic(&mut self) -> Result<bool> {
        if self.fsm.state() != IcemakerState::Diagnostic {
            return Ok(false);
        }
        self.all_relays_off().await?;
        Ok(self.fsm.transition_to(IcemakerState::Off).await)
    }

    /// Direct relay control, gated on DIAGNOSTIC.
    pub async fn diagnostic_set_relay(&mut self, relay: RelayName, on: bool) -> Result<()> {
        if self.fsm.state() != IcemakerState::Diagnostic {
            return Err(Error::Denied("relay control requires DIAGNOSTIC state"));
        }
        self.set_relay(relay, on).await
    }

    /// Drive every relay OFF (always permitted).
    pub async fn all_relays_off(&self) -> Result<()> {
        for relay in RelayName::ALL {
            self.set_relay(relay, false).await?;
        }
        Ok(())
    }

    // ── Handler dispatch ──────────────────────────────────────

    async fn dispatch(&mut self) -> Result<Option<IcemakerState>> {
        match self.fsm.state() {
            IcemakerState::Off => self.handle_off().await,
            IcemakerState::Standby => self.handle_standby().await,
            IcemakerState::Idle => self.handle_idle().await,
            IcemakerState::PowerOn => self.handle_power_on().await,
            IcemakerState::Chill => self.handle_chill().await,
            IcemakerState::Ice => self.handle_ice().await,
            IcemakerState::Heat => self.handle_heat().await,
            IcemakerState::Error => self.handle_error().await,
            IcemakerState::Shutdown => self.handle_shutdown().await,
            // Relays are driven only by direct external commands here.
            IcemakerState::Diagnostic => Ok(None),
        }
    }

    async fn handle_off(&mut self) -> Result<Option<IcemakerState>> {
        self.shutdown_requested = false;
        if self.ice_making_active {
            self.set_active(false);
        }
        self.all_relays_off().await?;
        Ok(None)
    }

    async fn handle_standby(&mut self) -> Result<Option<IcemakerState>> {
        for relay in RelayName::ALL {
            let on = relay == RelayName::IceCutter;
            self.set_relay(relay, on).await?;
        }
        if self.fsm.time_in_state() >= self.config.standby_timeout_seconds {
            info!("Standby timeout reached, powering off");
            return Ok(Some(IcemakerState::Off));
        }
        Ok(None)
    }

    async fn handle_idle(&mut self) -> Result<Option<IcemakerState>> {
        self.all_relays_off().await?;
        if self.bin_full() {
            Ok(None)
        } else {
            self.note_bin_level(false).await;
            info!("Bin has room again, starting next cycle");
            self.begin_prechill();
            Ok(Some(IcemakerState::Chill))
        }
    }

    /// Priming: flush with the valve, run the pump, final fill, then hand
    /// off to CHILL (ice making) or STANDBY (operator power-on).
    async fn handle_power_on(&mut self) -> Result<Option<IcemakerState>> {
        let p = self.config.priming;
        let elapsed = self.fsm.time_in_state();

        if elapsed < p.flush_seconds {
            self.set_relay(RelayName::WaterValve, true).await?;
            self.set_relay(RelayName::RecirculatingPump, false).await?;
            return Ok(None);
        }
        if elapsed < p.flush_seconds + p.pump_seconds {
            self.set_relay(RelayName::WaterValve, false).await?;
            self.set_relay(RelayName::RecirculatingPump, true).await?;
            return Ok(None);
        }
        if elapsed < p.total_seconds() {
            self.set_relay(RelayName::RecirculatingPump, false).await?;
            self.set_relay(RelayName::WaterValve, true).await?;
            return Ok(None);
        }

        self.set_relay(RelayName::WaterValve, false).await?;
        if self.ice_making_active {
            self.begin_prechill();
            Ok(Some(IcemakerState::Chill))
        } else {
            Ok(Some(IcemakerState::Standby))
        }
    }

    async fn handle_chill(&mut self) -> Result<Option<IcemakerState>> {
        let mode = match self.ctx_snapshot().chill_mode {
            Some(mode) => mode,
            None => {
                self.with_ctx(|ctx| ctx.chill_mode = Some(ChillMode::Prechill));
                ChillMode::Prechill
            }
        };
        let setpoint = match mode {
            ChillMode::Prechill => self.config.prechill,
            ChillMode::Rechill => self.config.rechill,
        };
        self.with_ctx(|ctx| ctx.target_temp_f = setpoint.target_temp_f);

        self.set_cooling_relays(false).await?;

        let plate = self.ctx_snapshot().plate_temp_f;
        let elapsed = self.fsm.time_in_state();
        if plate <= setpoint.target_temp_f {
            info!(
                "Chill complete: plate {plate:.1}°F reached target {:.1}°F",
                setpoint.target_temp_f
            );
            return self.chill_complete(mode).await;
        }
        if elapsed > setpoint.timeout_seconds {
            warn!(
                "Chill timeout: {elapsed:.1}s elapsed, plate {plate:.1}°F (target {:.1}°F)",
                setpoint.target_temp_f
            );
            return self.chill_complete(mode).await;
        }
        Ok(None)
    }

    /// Shared completion path for target-reached and timeout; the policy is
    /// to advance the cycle either way and let the next phase's guards
    /// decide.
    async fn chill_complete(&mut self, mode: ChillMode) -> Result<Option<IcemakerState>> {
        match mode {
            ChillMode::Prechill => {
                let now = self.fsm.now_secs();
                self.with_ctx(|ctx| {
                    ctx.chill_mode = None;
                    ctx.cycle_start_time = Some(now);
                });
                Ok(Some(IcemakerState::Ice))
            }
            ChillMode::Rechill => {
                let (lifetime, session) = {
                    let ctx = self.fsm.context();
                    let mut ctx = ctx.lock().expect("fsm context lock poisoned");
                    ctx.chill_mode = None;
                    ctx.lifetime_cycle_count += 1;
                    ctx.session_cycle_count += 1;
                    (ctx.lifetime_cycle_count, ctx.session_cycle_count)
                };
                self.store.store_cycle_count(lifetime);
                self.bus
                    .publish(Event::new(
                        "controller",
                        EventKind::CycleComplete {
                            lifetime_count: lifetime,
                            session_count: session,
                        },
                    ))
                    .await;
                info!("Cycle complete (lifetime {lifetime}, session {session})");

                if self.shutdown_requested {
                    info!("Graceful shutdown: resting in STANDBY");
                    return Ok(Some(IcemakerState::Standby));
                }
                if self.bin_full() {
                    self.note_bin_level(true).await;
                    info!("Bin full, entering IDLE");
                    return Ok(Some(IcemakerState::Idle));
                }
                // Next cycle: stay in CHILL as a fresh prechill.
                self.begin_prechill();
                Ok(None)
            }
        }
    }

    async fn handle_ice(&mut self) -> Result<Option<IcemakerState>> {
        let setpoint = self.config.ice_making;
        self.with_ctx(|ctx| ctx.target_temp_f = setpoint.target_temp_f);

        self.set_cooling_relays(true).await?;

        let plate = self.ctx_snapshot().plate_temp_f;
        let elapsed = self.fsm.time_in_state();
        if plate <= setpoint.target_temp_f {
            info!(
                "Ice making complete: plate {plate:.1}°F reached target {:.1}°F",
                setpoint.target_temp_f
            );
            return Ok(Some(IcemakerState::Heat));
        }
        if elapsed > setpoint.timeout_seconds {
            warn!(
                "Ice making timeout: {elapsed:.1}s elapsed, plate {plate:.1}°F (target {:.1}°F)",
                setpoint.target_temp_f
            );
            return Ok(Some(IcemakerState::Heat));
        }
        Ok(None)
    }

    async fn handle_heat(&mut self) -> Result<Option<IcemakerState>> {
        let harvest = self.config.harvest;
        self.with_ctx(|ctx| ctx.target_temp_f = harvest.target_temp_f);

        let elapsed = self.fsm.time_in_state();
        let fill_open = elapsed < harvest.fill_time_seconds;
        self.set_heating_relays(fill_open).await?;

        let plate = self.ctx_snapshot().plate_temp_f;
        if plate >= harvest.target_temp_f {
            info!(
                "Harvest complete: plate {plate:.1}°F reached target {:.1}°F",
                harvest.target_temp_f
            );
            self.with_ctx(|ctx| ctx.chill_mode = Some(ChillMode::Rechill));
            return Ok(Some(IcemakerState::Chill));
        }
        if elapsed > harvest.timeout_seconds {
            warn!(
                "Harvest timeout: {elapsed:.1}s elapsed, plate {plate:.1}°F (target {:.1}°F)",
                harvest.target_temp_f
            );
            self.with_ctx(|ctx| ctx.chill_mode = Some(ChillMode::Rechill));
            return Ok(Some(IcemakerState::Chill));
        }
        Ok(None)
    }

    async fn handle_error(&mut self) -> Result<Option<IcemakerState>> {
        self.all_relays_off().await?;
        Ok(None)
    }

    async fn handle_shutdown(&mut self) -> Result<Option<IcemakerState>> {
        self.all_relays_off().await?;
        Ok(Some(IcemakerState::Off))
    }

    // ── Relay matrices ────────────────────────────────────────

    async fn set_relay(&self, relay: RelayName, on: bool) -> Result<()> {
        let changed = self.relays.set_relay(relay, on).await?;
        if changed {
            self.bus
                .publish(Event::new("gpio", EventKind::RelayChanged { relay, on }))
                .await;
        }
        Ok(())
    }

    /// Cooling matrix: both compressors, condenser fan, and ice cutter on;
    /// hot gas and water valve off; recirculation per phase.
    async fn set_cooling_relays(&self, with_recirculation: bool) -> Result<()> {
        self.set_relay(RelayName::Compressor1, true).await?;
        self.set_relay(RelayName::Compressor2, true).await?;
        self.set_relay(RelayName::CondenserFan, true).await?;
        self.set_relay(RelayName::IceCutter, true).await?;
        self.set_relay(RelayName::HotGasSolenoid, false).await?;
        self.set_relay(RelayName::WaterValve, false).await?;
        self.set_relay(RelayName::RecirculatingPump, with_recirculation)
            .await?;
        Ok(())
    }

    /// Harvest matrix: compressors and hot gas on, fan and pump off; the
    /// water valve refills the reservoir only during the fill window.
    async fn set_heating_relays(&self, fill_open: bool) -> Result<()> {
        self.set_relay(RelayName::Compressor1, true).await?;
        self.set_relay(RelayName::Compressor2, true).await?;
        self.set_relay(RelayName::HotGasSolenoid, true).await?;
        self.set_relay(RelayName::IceCutter, true).await?;
        self.set_relay(RelayName::CondenserFan, false).await?;
        self.set_relay(RelayName::RecirculatingPump, false).await?;
        self.set_relay(RelayName::WaterValve, fill_open).await?;
        Ok(())
    }

    // ── Internal helpers ──────────────────────────────────────

    fn ctx_snapshot(&self) -> FsmContext {
        self.fsm
            .context()
            .lock()
            .expect("fsm context lock poisoned")
            .clone()
    }

    fn with_ctx(&self, f: impl FnOnce(&mut FsmContext)) {
        let ctx = self.fsm.context();
        let mut ctx = ctx.lock().expect("fsm context lock poisoned");
        f(&mut ctx);
    }

    /// `bin_temp < threshold` means ice has reached the bin sensor.
    fn bin_full(&self) -> bool {
        self.ctx_snapshot().bin_temp_f < self.config.bin_full_threshold_f
    }

    /// Emit BIN_FULL / BIN_NOT_FULL on predicate edges only.
    async fn note_bin_level(&mut self, full: bool) {
        if self.bin_full_latch == Some(full) {
            return;
        }
        self.bin_full_latch = Some(full);
        let kind = if full {
            EventKind::BinFull
        } else {
            EventKind::BinNotFull
        };
        self.bus.publish(Event::new("controller", kind)).await;
    }

    /// Arm a prechill pass and stamp the cycle start.
    fn begin_prechill(&mut self) {
        let now = self.fsm.now_secs();
        self.with_ctx(|ctx| {
            ctx.chill_mode = Some(ChillMode::Prechill);
            ctx.cycle_start_time = Some(now);
        });
    }

    fn set_active(&mut self, active: bool) {
        self.ice_making_active = active;
        self.store.set_ice_making_active(active);
    }

    /// Advisory timeout for the current state, if it has one.
    fn state_timeout(&self) -> Option<f64> {
        let c = &self.config;
        match self.fsm.state() {
            IcemakerState::PowerOn => Some(c.priming.total_seconds() + 30.0),
            IcemakerState::Chill => Some(match self.ctx_snapshot().chill_mode {
                Some(ChillMode::Rechill) => c.rechill.timeout_seconds,
                _ => c.prechill.timeout_seconds,
            }),
            IcemakerState::Ice => Some(c.ice_making.timeout_seconds),
            IcemakerState::Heat => Some(c.harvest.timeout_seconds),
            IcemakerState::Standby => Some(c.standby_timeout_seconds),
            IcemakerState::Shutdown => Some(30.0),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cooperative waits and the sensor poller
// ---------------------------------------------------------------------------

/// Wait one poll interval. In lockstep mode this busy-polls the simulated
/// clock in ~10 ms wall slices so the FSM advances a fixed amount of
/// simulated time per tick, whatever the speed multiplier. Returns `false`
/// when the shutdown signal fired instead.
pub async fn wait_poll_interval(
    interval_seconds: f64,
    sim_clock: Option<&SimClock>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    match sim_clock {
        Some(clock) => {
            let start = clock.now_secs();
            while clock.now_secs() - start < interval_seconds {
                if *shutdown.borrow() {
                    return false;
                }
                tokio::select! {
                    () = tokio::time::sleep(LOCKSTEP_POLL_INTERVAL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return false;
                        }
                    }
                }
            }
            true
        }
        None => {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs_f64(interval_seconds)) => true,
                changed = shutdown.changed() => !(changed.is_err() || *shutdown.borrow()),
            }
        }
    }
}

/// Long-lived sensor poller: refreshes the context's temperature fields
/// between FSM ticks and publishes `TEMP_READING`.
pub async fn sensor_poll_loop(
    sensors: Arc<dyn TemperatureSensors>,
    ctx: Arc<Mutex<FsmContext>>,
    bus: Arc<EventBus>,
    poll_interval_seconds: f64,
    sim_clock: Option<SimClock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let temps = sensors.read_all_temperatures().await;
        let plate = temps
            .get(&SensorName::Plate)
            .copied()
            .unwrap_or(FALLBACK_TEMP_F);
        let bin = temps
            .get(&SensorName::IceBin)
            .copied()
            .unwrap_or(FALLBACK_TEMP_F);
        {
            let mut ctx = ctx.lock().expect("fsm context lock poisoned");
            ctx.plate_temp_f = plate;
            ctx.bin_temp_f = bin;
        }
        bus.publish(Event::new(
            "sensors",
            EventKind::TempReading {
                plate_f: plate,
                bin_f: bin,
            },
        ))
        .await;

        if !wait_poll_interval(poll_interval_seconds, sim_clock.as_ref(), &mut shutdown).await {
            break;
        }
    }
    debug!("Sensor poller stopped");
}
