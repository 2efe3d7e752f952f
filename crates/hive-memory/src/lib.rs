//! Tiered memory for Q-learning agents.
//!
//! Three tiers with distinct roles:
//! - short-term memory (STM): recent experiences in Redis with a TTL
//! - long-term memory (LTM): promoted high-value experiences, patterns and
//!   strategies in PostgreSQL, partitioned per agent
//! - central memory: the shared cross-agent tier where insights, patterns
//!   and the performance leaderboard live
//!
//! Storage back ends are optional at runtime: every tier degrades to neutral
//! no-op results when its backing store is unreachable, so a Redis or
//! Postgres outage never takes the learning loop down with it.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]

pub mod central;
pub mod config;
pub mod integrator;
pub mod ltm;
pub mod orchestrator;
pub mod stm;

pub use central::{
    AgentInsights, Applicability, BestExperience, CentralMemory, CollectiveStrategy,
    CrossAgentPattern, GlobalInsight, GlobalStats, LeaderboardEntry, LtmSummary,
};
pub use config::{IntegrationConfig, MemoryConfig, PostgresConfig, RedisConfig};
pub use integrator::{
    AgentMemoryIntegrator, CycleReport, InsightApplicator, InsightIntent, IntegrationStatus,
    LoggingApplicator,
};
pub use ltm::{Database, Ltm, LtmExperienceRecord, LtmPatternRecord, LtmStats, LtmStrategyRecord};
pub use orchestrator::{CollectiveMetrics, CollectiveOrchestrator, CollectiveReport, SystemHealth};
pub use stm::{AgentStm, RedisClient, StmRecord, StmStats};
