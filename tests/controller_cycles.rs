//! End-to-end cycle tests: controller + FSM + simulated HAL in lockstep.
//!
//! Each step advances the physics by one poll interval of simulated time,
//! so these runs are deterministic and independent of wall-clock speed.

mod common;

use std::collections::HashMap;

use common::{SimHarness, sim_harness, test_config};
use icectl::fsm::states::IcemakerState;
use icectl::hal::{RelayControl, RelayName};

async fn started_harness(tag: &str) -> SimHarness {
    let mut h = sim_harness(test_config(tag));
    h.controller.initialize().await.unwrap();
    h
}

// ── Scenario 1: cold-start cycle ──────────────────────────────

#[tokio::test]
async fn cold_start_runs_one_full_cycle() {
    let mut h = sim_harness(test_config("cold-start"));
    // Lifetime counter persisted by an earlier life of the machine.
    std::fs::write(
        h.controller.config().data_dir.join("cycle_count.txt"),
        "41\n",
    )
    .unwrap();
    h.controller.initialize().await.unwrap();

    assert_eq!(h.controller.state(), IcemakerState::Off);
    assert!(h.controller.start_icemaking().await);
    assert_eq!(h.controller.state(), IcemakerState::Chill);

    // Prechill: the plate must cross 32°F within 150 simulated seconds.
    let steps = h.run_until(IcemakerState::Ice, 31).await;
    assert!(steps.is_some(), "prechill did not finish within 150s (sim)");

    // Ice making advances to harvest within its 1500s timeout.
    assert!(
        h.run_until(IcemakerState::Heat, 305).await.is_some(),
        "ice making did not hand off to harvest"
    );

    // Harvest must reach 38°F within 240 simulated seconds.
    assert!(
        h.run_until(IcemakerState::Chill, 50).await.is_some(),
        "harvest did not complete within 240s (sim)"
    );

    // Rechill completion increments exactly one cycle.
    for _ in 0..61 {
        if h.rec.count_of("CYCLE_COMPLETE") == 1 {
            break;
        }
        h.step().await;
    }
    assert_eq!(h.rec.count_of("CYCLE_COMPLETE"), 1);

    let status = h.controller.status();
    assert_eq!(status.lifetime_cycle_count, 42, "41 persisted + 1 completed");
    assert_eq!(status.session_cycle_count, 1);
    let on_disk =
        std::fs::read_to_string(h.controller.config().data_dir.join("cycle_count.txt")).unwrap();
    assert_eq!(on_disk.trim(), "42");

    // Observed state sequence so far.
    assert_eq!(
        h.rec.entered_states(),
        vec![
            IcemakerState::Chill,
            IcemakerState::Ice,
            IcemakerState::Heat,
            IcemakerState::Chill,
        ]
    );

    // Bin is nowhere near full after one harvest: the next cycle starts.
    assert!(
        h.run_until(IcemakerState::Ice, 40).await.is_some(),
        "second cycle should begin after rechill with an empty bin"
    );
}

// ── Scenario 2: priming sequence ──────────────────────────────

#[tokio::test]
async fn priming_phases_follow_the_configured_durations() {
    let mut config = test_config("priming");
    config.priming_enabled = true;
    let mut h = sim_harness(config);
    h.controller.initialize().await.unwrap();

    assert!(h.controller.start_icemaking().await);
    assert_eq!(h.controller.state(), IcemakerState::PowerOn);

    // Step k runs a tick at elapsed = 5·(k−1) simulated seconds.
    for _ in 0..7 {
        h.step().await;
    }
    // t = 30s: phase 1 (flush).
    assert!(h.gpio.get_relay(RelayName::WaterValve).await);
    assert!(!h.gpio.get_relay(RelayName::RecirculatingPump).await);

    for _ in 0..8 {
        h.step().await;
    }
    // t = 70s: phase 2 (pump priming).
    assert!(!h.gpio.get_relay(RelayName::WaterValve).await);
    assert!(h.gpio.get_relay(RelayName::RecirculatingPump).await);

    for _ in 0..3 {
        h.step().await;
    }
    // t = 85s: phase 3 (final fill).
    assert!(h.gpio.get_relay(RelayName::WaterValve).await);
    assert!(!h.gpio.get_relay(RelayName::RecirculatingPump).await);

    h.step().await;
    // t = 90s: priming over, cycle begins.
    assert!(!h.gpio.get_relay(RelayName::WaterValve).await);
    assert_eq!(h.controller.state(), IcemakerState::Chill);
}

// ── Scenario 3: bin-full pause and auto-restart ───────────────

#[tokio::test]
async fn full_bin_pauses_in_idle_until_ice_melts_down() {
    let mut h = started_harness("bin-full").await;
    h.sim.lock().unwrap().preload_bin(0.8);

    assert!(h.controller.start_icemaking().await);
    assert!(
        h.run_until(IcemakerState::Idle, 420).await.is_some(),
        "cycle against a full bin should end in IDLE"
    );
    assert_eq!(h.rec.count_of("BIN_FULL"), 1);
    assert_eq!(h.controller.status().lifetime_cycle_count, 1);

    // Ice melts below the sensor line; the FSM restarts on its own.
    h.sim.lock().unwrap().preload_bin(0.6);
    assert!(
        h.run_until(IcemakerState::Chill, 3).await.is_some(),
        "IDLE should auto-restart once the bin has room"
    );
    assert_eq!(h.rec.count_of("BIN_NOT_FULL"), 1);
}

// ── Scenario 4: graceful shutdown mid-cycle ───────────────────

#[tokio::test]
async fn power_off_mid_cycle_finishes_the_cycle_then_rests() {
    let mut h = started_harness("graceful").await;
    assert!(h.controller.start_icemaking().await);
    assert!(h.run_until(IcemakerState::Ice, 31).await.is_some());

    assert!(h.controller.power_off().await);
    assert_eq!(
        h.controller.state(),
        IcemakerState::Ice,
        "graceful shutdown must not interrupt the running cycle"
    );

    // The cycle runs to its rechill completion, then rests in STANDBY
    // instead of starting another cycle.
    assert!(h.run_until(IcemakerState::Standby, 420).await.is_some());
    h.step().await;
    assert!(
        h.gpio.get_relay(RelayName::IceCutter).await,
        "ice cutter finishes residual cutting in standby"
    );
    assert!(!h.gpio.get_relay(RelayName::Compressor1).await);
    assert!(!h.gpio.get_relay(RelayName::Compressor2).await);

    // STANDBY times out into OFF.
    assert!(
        h.run_until(IcemakerState::Off, 245).await.is_some(),
        "standby should auto-power-off after its timeout"
    );
    h.step().await;
    let relays = h.gpio.get_all_relays().await;
    assert!(relays.values().all(|on| !on), "everything off in OFF");
    assert!(
        !h.controller.config().data_dir.join("ice_making_active").exists(),
        "resume flag cleared by power_off"
    );
}

// ── Scenario 5: emergency stop, and restart equivalence ───────

#[tokio::test]
async fn emergency_stop_kills_relays_and_forces_off() {
    let mut h = started_harness("estop").await;
    assert!(h.controller.start_icemaking().await);
    for _ in 0..3 {
        h.step().await;
    }
    assert!(h.gpio.get_relay(RelayName::Compressor1).await);

    h.controller.emergency_stop().await;
    assert_eq!(h.controller.state(), IcemakerState::Off);
    let relays = h.gpio.get_all_relays().await;
    assert!(relays.values().all(|on| !on));
    assert_eq!(h.rec.count_of("EMERGENCY_STOP"), 1);

    // Restarting after an emergency stop produces the same relay matrix
    // as a fresh start from OFF.
    assert!(h.controller.start_icemaking().await);
    h.step().await;
    let after_estop: HashMap<RelayName, bool> = h.gpio.get_all_relays().await;

    let mut fresh = started_harness("estop-fresh").await;
    assert!(fresh.controller.start_icemaking().await);
    fresh.step().await;
    let fresh_matrix: HashMap<RelayName, bool> = fresh.gpio.get_all_relays().await;

    assert_eq!(after_estop, fresh_matrix);
}

// ── Scenario 6: power-loss recovery ───────────────────────────

#[tokio::test]
async fn resume_flag_restarts_ice_making_on_boot() {
    let h = sim_harness(test_config("power-loss"));
    std::fs::write(
        h.controller.config().data_dir.join("ice_making_active"),
        b"",
    )
    .unwrap();

    let mut h = h;
    h.controller.initialize().await.unwrap();
    assert_ne!(
        h.controller.state(),
        IcemakerState::Off,
        "controller should auto-resume ice making"
    );
    assert_eq!(h.controller.state(), IcemakerState::Chill);
    assert_eq!(h.rec.count_of("START_CYCLE"), 1);
}

// ── Relay-change discipline across a run ──────────────────────

#[tokio::test]
async fn relay_changed_events_fire_only_on_real_changes() {
    let mut h = started_harness("relay-dedup").await;
    assert!(h.controller.start_icemaking().await);
    for _ in 0..10 {
        h.step().await;
    }

    // Ten CHILL ticks re-command the same matrix; the compressor must have
    // produced exactly one ON event.
    let comp1_on = h
        .rec
        .relay_changes()
        .iter()
        .filter(|(r, on)| *r == RelayName::Compressor1 && *on)
        .count();
    assert_eq!(comp1_on, 1);

    // No relay ever reports the same value twice in a row.
    let mut last: HashMap<RelayName, bool> = HashMap::new();
    for (relay, on) in h.rec.relay_changes() {
        assert_ne!(last.get(&relay), Some(&on), "{relay} repeated {on}");
        last.insert(relay, on);
    }
}
