//! Common types used throughout Hivemind

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for an agent.
///
/// Agents are registered under human-chosen names like `channel_auditor`;
/// the identifier doubles as the storage namespace key (STM key prefix,
/// LTM partition), so it must be stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registration profile for an agent participating in collective memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
}

impl AgentProfile {
    pub fn new(
        agent_id: impl Into<AgentId>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities,
        }
    }
}

/// Raw metric snapshot keyed by metric name (views, likes, watch_time, ...)
///
/// Snapshots come straight from the caller's analytics fetch and are kept
/// loosely typed: the reward calculator only reads the fixed weighted subset
/// and ignores everything else.
pub type MetricMap = HashMap<String, f64>;
