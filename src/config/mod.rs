//! Node configuration.
//!
//! ```json
//! {
//!   "node_index": 0,
//!   "ownership": {
//!     "abort_queued_and_pending_on_state_change": true,
//!     "abort_mutating_ideal_state_ops": true,
//!     "abort_mutating_external_load_ops": true
//!   }
//! }
//! ```
//!
//! Every ownership switch defaults to enabled when absent.
use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{error::Result, message::classifier::MutationClass};

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Index of the local storage node
    pub node_index: u16,
    #[serde(default)]
    pub ownership: OwnershipConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let c = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&c)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OwnershipConfig {
    /// Abort queued operations and wait for pending ones whose bucket changed owner on state change
    #[serde(default = "enabled")]
    pub abort_queued_and_pending_on_state_change: bool,
    /// Abort incoming ideal state operations sent by a distributor that doesn't own the bucket
    #[serde(default = "enabled")]
    pub abort_mutating_ideal_state_ops: bool,
    /// Abort incoming external load operations sent by a distributor that doesn't own the bucket
    #[serde(default = "enabled")]
    pub abort_mutating_external_load_ops: bool,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            abort_queued_and_pending_on_state_change: true,
            abort_mutating_ideal_state_ops: true,
            abort_mutating_external_load_ops: true,
        }
    }
}

/// Live view of the [`OwnershipConfig`] switches.
///
/// Each switch is read independently with relaxed ordering. They're never linearized with snapshot reads.
#[derive(Debug)]
pub struct AbortSwitches {
    abort_queued_and_pending_on_state_change: AtomicBool,
    abort_mutating_ideal_state_ops: AtomicBool,
    abort_mutating_external_load_ops: AtomicBool,
}

impl AbortSwitches {
    pub fn new(config: &OwnershipConfig) -> Self {
        Self {
            abort_queued_and_pending_on_state_change: AtomicBool::new(
                config.abort_queued_and_pending_on_state_change,
            ),
            abort_mutating_ideal_state_ops: AtomicBool::new(config.abort_mutating_ideal_state_ops),
            abort_mutating_external_load_ops: AtomicBool::new(
                config.abort_mutating_external_load_ops,
            ),
        }
    }

    /// Applies a new config. Takes effect for the next checked operation.
    pub fn configure(&self, config: &OwnershipConfig) {
        self.abort_queued_and_pending_on_state_change.store(
            config.abort_queued_and_pending_on_state_change,
            Ordering::Relaxed,
        );
        self.abort_mutating_ideal_state_ops
            .store(config.abort_mutating_ideal_state_ops, Ordering::Relaxed);
        self.abort_mutating_external_load_ops
            .store(config.abort_mutating_external_load_ops, Ordering::Relaxed);
    }

    pub fn aborting_on_state_change(&self) -> bool {
        self.abort_queued_and_pending_on_state_change
            .load(Ordering::Relaxed)
    }

    pub fn aborting(&self, class: MutationClass) -> bool {
        match class {
            MutationClass::IdealState => self.abort_mutating_ideal_state_ops.load(Ordering::Relaxed),
            MutationClass::ExternalLoad => {
                self.abort_mutating_external_load_ops.load(Ordering::Relaxed)
            }
        }
    }
}

impl Default for AbortSwitches {
    fn default() -> Self {
        Self::new(&OwnershipConfig::default())
    }
}
