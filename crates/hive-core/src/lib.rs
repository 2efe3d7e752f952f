//! Hivemind Core - shared types and error taxonomy
//!
//! This crate provides the foundational types used across the RL engine and
//! the tiered memory subsystem.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod types;

pub use error::{HiveError, Result};
pub use types::{AgentId, AgentProfile, MetricMap};
