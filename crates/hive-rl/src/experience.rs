//! The atomic learning record exchanged between the RL engine and memory tiers

use chrono::{DateTime, Utc};
use hive_core::MetricMap;
use serde::{Deserialize, Serialize};

use crate::state::{ActionKind, ActionParams};

/// One completed learning step.
///
/// Invariant: `q_value` reflects the Q-table entry *after* the associated
/// learning update was applied, not before. The engine creates the record
/// with a provisional 0.0 and overwrites it once the update resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state_hash: String,
    /// Empty until the next state is observed; an empty hash means
    /// `max_next_q` is treated as 0 during the TD update.
    pub next_state_hash: String,
    pub action: ActionKind,
    pub parameters: ActionParams,
    pub reward: f64,
    pub q_value: f64,
    /// Serialized state for later similarity/pattern mining
    pub state: serde_json::Value,
    pub metrics_before: MetricMap,
    pub metrics_after: MetricMap,
    pub time_elapsed_hours: f64,
    pub timestamp: DateTime<Utc>,
}
