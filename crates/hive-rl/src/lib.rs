//! Hivemind RL - tabular Q-learning for YouTube channel optimization
//!
//! This crate provides the per-agent learning loop: state observation,
//! epsilon-greedy action selection over a discretized state space, reward
//! computation from before/after metric snapshots, and the online TD update.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::float_cmp)]
#![allow(clippy::similar_names)]

pub mod engine;
pub mod experience;
pub mod qlearning;
pub mod reward;
pub mod state;

pub use engine::{ChannelObservation, ContextData, EngineStatus, RlEngine};
pub use experience::Experience;
pub use qlearning::{BinDiscretizer, LearningProgress, ModelSnapshot, QLearningAgent, StateDiscretizer};
pub use reward::RewardCalculator;
pub use state::{Action, ActionKind, ActionParams, State};
