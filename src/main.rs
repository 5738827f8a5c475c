//! icectl — ice-maker control daemon.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Controller (handlers · operations · run loop)           │
//! │      │ RelayControl / TemperatureSensors (HAL traits)    │
//! │      ▼                                                   │
//! │  Physical: rppal GPIO + 1-Wire sysfs   (hardware, on Pi) │
//! │  Simulated: mock HAL ⇆ physics model   (--simulator)     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Runs on a current-thread tokio runtime: the FSM loop, the sensor
//! poller, and (in simulation) the physics loop are cooperative tasks. A
//! SIGINT triggers the graceful stop, which drains the tasks and drives
//! every relay off.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use icectl::clock::SimClock;
use icectl::config::{self, Environment, IcemakerConfig};
use icectl::controller::Controller;
use icectl::events::LogListener;
use icectl::hal::{RelayControl, TemperatureSensors, create_hal};
use icectl::sim::{SimParams, run_simulator, shared_simulator, wire_simulated_hal};

/// Wall interval between physics updates in simulation mode.
const SIM_UPDATE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EnvArg {
    Development,
    Production,
}

impl From<EnvArg> for Environment {
    fn from(value: EnvArg) -> Self {
        match value {
            EnvArg::Development => Environment::Development,
            EnvArg::Production => Environment::Production,
        }
    }
}

/// Ice-maker control daemon.
#[derive(Debug, Parser)]
#[command(name = "icectl", version, about)]
struct Cli {
    /// Use the physics-based simulator instead of real hardware.
    #[arg(long)]
    simulator: bool,

    /// Simulation speed multiplier (0.1 – 1000).
    #[arg(long)]
    speed: Option<f64>,

    /// Deployment environment (defaults to production on a Raspberry Pi).
    #[arg(long, value_enum)]
    env: Option<EnvArg>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for persistent state (cycle counter, resume flag).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .init();

    // Defaults → .env → environment variables, then CLI flags on top.
    let mut config = config::load_config(cli.env.map(Environment::from));
    if cli.simulator {
        config.use_simulator = true;
    }
    if let Some(speed) = cli.speed {
        config.simulator_speed = speed;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    info!(
        "icectl v{} starting ({:?}, simulator: {})",
        env!("CARGO_PKG_VERSION"),
        config.environment,
        config.use_simulator
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: IcemakerConfig) -> Result<()> {
    // ── 1. HAL wiring ─────────────────────────────────────────
    let mut sim = None;
    let (relays, sensors): (Arc<dyn RelayControl>, Arc<dyn TemperatureSensors>) =
        if config.use_simulator {
            let params = SimParams {
                speed_multiplier: config.simulator_speed.clamp(0.1, 1000.0),
                ..SimParams::default()
            };
            let shared = shared_simulator(params);
            let (gpio, mock_sensors) = wire_simulated_hal(&shared);
            sim = Some(shared);
            (gpio, mock_sensors)
        } else {
            create_hal(false)
        };

    // ── 2. Controller ─────────────────────────────────────────
    let mut controller = Controller::new(config, relays, sensors);
    controller.subscribe(Arc::new(LogListener));
    if let Some(shared) = &sim {
        controller.bind_sim_clock(SimClock::new(Arc::clone(shared)));
    }

    // ── 3. Background tasks ───────────────────────────────────
    let sim_task = sim.map(|shared| {
        tokio::spawn(run_simulator(
            shared,
            SIM_UPDATE_INTERVAL,
            controller.shutdown_signal(),
        ))
    });

    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, stopping");
            handle.stop().await;
        }
    });

    // ── 4. Run until stopped ──────────────────────────────────
    controller
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("controller failed: {e}"))?;

    if let Some(mut task) = sim_task {
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            warn!("Simulator task did not drain in time, aborting it");
            task.abort();
        }
    }
    Ok(())
}
