//! On-disk persistence under the data directory.
//!
//! Three small artifacts:
//! - `cycle_count.txt` — the lifetime cycle counter as a single decimal
//!   integer, read at start and rewritten after each rechill completion;
//! - `ice_making_active` — a zero-byte presence file; if present at start
//!   the controller resumes ice making (power-loss recovery);
//! - `state.json` — optional snapshot for a restart that preserves relay
//!   state; deleted after a successful restore.
//!
//! Persistence never fails the caller: I/O errors are logged and the
//! operation continues. The in-memory counter may drift from disk in that
//! case, which is accepted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::fsm::context::FsmContext;
use crate::fsm::states::IcemakerState;
use crate::hal::RelayName;

const CYCLE_COUNT_FILE: &str = "cycle_count.txt";
const ACTIVE_FLAG_FILE: &str = "ice_making_active";
const SNAPSHOT_FILE: &str = "state.json";

/// Snapshot of the running machine, for restarts that keep relays live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: IcemakerState,
    pub previous_state: Option<IcemakerState>,
    /// Logical relay matrix at snapshot time.
    pub relays: BTreeMap<String, bool>,
    pub context: FsmContext,
}

impl StateSnapshot {
    /// Decode the relay matrix back into typed names, skipping unknowns.
    pub fn relay_states(&self) -> Vec<(RelayName, bool)> {
        self.relays
            .iter()
            .filter_map(|(name, on)| {
                RelayName::ALL
                    .iter()
                    .find(|r| r.as_str() == name)
                    .map(|r| (*r, *on))
            })
            .collect()
    }

    pub fn from_parts(
        state: IcemakerState,
        previous_state: Option<IcemakerState>,
        relays: impl IntoIterator<Item = (RelayName, bool)>,
        context: FsmContext,
    ) -> Self {
        Self {
            state,
            previous_state,
            relays: relays
                .into_iter()
                .map(|(r, on)| (r.as_str().to_owned(), on))
                .collect(),
            context,
        }
    }
}

/// Handle to the data directory.
pub struct DataStore {
    dir: PathBuf,
}

impl DataStore {
    /// Open (and create if needed) the data directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create data dir {}: {e}", dir.display());
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Lifetime cycle counter ────────────────────────────────

    /// Read the persisted lifetime cycle count; 0 when missing or invalid.
    pub fn load_cycle_count(&self) -> u64 {
        let path = self.dir.join(CYCLE_COUNT_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(count) => count,
                Err(e) => {
                    warn!("Corrupt cycle count in {}: {e}", path.display());
                    0
                }
            },
            Err(_) => 0,
        }
    }

    /// Overwrite the persisted lifetime cycle count.
    pub fn store_cycle_count(&self, count: u64) {
        let path = self.dir.join(CYCLE_COUNT_FILE);
        if let Err(e) = fs::write(&path, format!("{count}\n")) {
            error!("Failed to persist cycle count: {e}");
        }
    }

    // ── Ice-making resume flag ────────────────────────────────

    /// Whether the resume flag was present at the last check.
    pub fn ice_making_active(&self) -> bool {
        self.dir.join(ACTIVE_FLAG_FILE).exists()
    }

    /// Create or remove the resume presence file.
    pub fn set_ice_making_active(&self, active: bool) {
        let path = self.dir.join(ACTIVE_FLAG_FILE);
        let result = if active {
            fs::write(&path, b"")
        } else {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        };
        if let Err(e) = result {
            error!("Failed to update ice-making flag: {e}");
        }
    }

    // ── State snapshot ────────────────────────────────────────

    /// Write the restart snapshot.
    pub fn save_snapshot(&self, snapshot: &StateSnapshot) {
        let path = self.dir.join(SNAPSHOT_FILE);
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    error!("Failed to write state snapshot: {e}");
                } else {
                    info!("State snapshot saved ({})", snapshot.state);
                }
            }
            Err(e) => error!("Failed to encode state snapshot: {e}"),
        }
    }

    /// Read the restart snapshot, if one exists and decodes.
    pub fn load_snapshot(&self) -> Option<StateSnapshot> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Corrupt state snapshot in {}: {e}", path.display());
                None
            }
        }
    }

    /// Delete the restart snapshot after a successful restore.
    pub fn clear_snapshot(&self) {
        let path = self.dir.join(SNAPSHOT_FILE);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove state snapshot: {e}");
            }
        }
    }
}
