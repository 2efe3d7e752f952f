//! Central memory: the shared cross-agent tier.
//!
//! Agents push long-term memory summaries here; central memory mines them
//! into global insights, detects patterns supported by several agents and
//! maintains the performance leaderboard. Insight mining and scoring are
//! pure functions over sync summaries so they stay testable without a
//! database.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, info, warn};

use hive_core::{AgentId, AgentProfile};
use hive_rl::ActionKind;

use crate::ltm::Database;

/// Minimum samples per action before a performance insight is mined
const MIN_PERFORMANCE_SAMPLES: usize = 3;

/// Minimum samples per action before a timing insight is mined
const MIN_TIMING_SAMPLES: usize = 5;

/// Confidence floor for insights handed out to agents
const INSIGHT_RELEVANCE_FLOOR: f64 = 0.3;

/// Distinct agents required to support a cross-agent pattern
const PATTERN_MIN_AGENTS: usize = 3;

/// Q-value an experience needs to support a cross-agent pattern
const PATTERN_HIGH_Q: f64 = 0.8;

/// Sync window inspected for cross-agent patterns
const PATTERN_WINDOW_HOURS: i64 = 24;

/// One high-value experience carried in a sync summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestExperience {
    pub action: ActionKind,
    pub reward: f64,
    pub q_value: f64,
    pub state: serde_json::Value,
}

/// Long-term memory summary an agent pushes on synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtmSummary {
    pub total_experiences: i64,
    pub high_value_experiences: i64,
    pub avg_q_value: f64,
    pub avg_reward: f64,
    pub max_q_value: f64,
    pub min_q_value: f64,
    pub learned_patterns: i64,
    pub active_strategies: i64,
    pub best_experiences: Vec<BestExperience>,
    pub sync_timestamp: DateTime<Utc>,
}

/// Which agents an insight applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ApplicabilityRepr", into = "ApplicabilityRepr")]
pub enum Applicability {
    All,
    Capabilities(Vec<String>),
}

/// Wire form: the string `"all"` or a capability array
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ApplicabilityRepr {
    Capabilities(Vec<String>),
    Tag(String),
}

impl From<ApplicabilityRepr> for Applicability {
    fn from(repr: ApplicabilityRepr) -> Self {
        match repr {
            ApplicabilityRepr::Tag(s) if s == "all" => Applicability::All,
            ApplicabilityRepr::Tag(s) => Applicability::Capabilities(vec![s]),
            ApplicabilityRepr::Capabilities(caps) => Applicability::Capabilities(caps),
        }
    }
}

impl From<Applicability> for ApplicabilityRepr {
    fn from(value: Applicability) -> Self {
        match value {
            Applicability::All => ApplicabilityRepr::Tag("all".to_string()),
            Applicability::Capabilities(caps) => ApplicabilityRepr::Capabilities(caps),
        }
    }
}

/// A mined insight shared across agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalInsight {
    pub insight_type: String,
    pub action_type: String,
    pub average_reward: f64,
    pub std_deviation: f64,
    pub sample_size: i64,
    pub confidence: f64,
    pub optimal_hour: Option<i32>,
    pub contributing_agent: String,
    pub applicable_agents: Applicability,
    pub last_updated: DateTime<Utc>,
}

/// Collective strategy shared across agents
#[derive(Debug, Clone, Serialize)]
pub struct CollectiveStrategy {
    pub name: String,
    pub description: String,
    pub success_rate: f64,
    pub avg_reward: f64,
    pub adopted_by: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Insights and strategies relevant to one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentInsights {
    pub insights: Vec<GlobalInsight>,
    pub strategies: Vec<CollectiveStrategy>,
    pub sync_timestamp: DateTime<Utc>,
    pub total_insights_available: i64,
}

impl AgentInsights {
    fn empty() -> Self {
        Self {
            insights: Vec::new(),
            strategies: Vec::new(),
            sync_timestamp: Utc::now(),
            total_insights_available: 0,
        }
    }
}

/// A behavior pattern supported by several agents
#[derive(Debug, Clone, Serialize)]
pub struct CrossAgentPattern {
    pub pattern_type: String,
    pub action_type: String,
    pub supporting_agents: Vec<String>,
    pub pattern_strength: f64,
    pub avg_reward: f64,
    pub avg_q_value: f64,
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
}

/// One leaderboard row
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub agent_id: String,
    pub agent_type: String,
    pub overall_score: f64,
    pub total_experiences: i64,
    pub avg_q_value: f64,
    pub avg_reward: f64,
    pub high_value_experiences: i64,
    pub rank: i32,
    pub last_updated: DateTime<Utc>,
}

/// Activity counters and headline figures for the whole collective
#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct GlobalStats {
    pub active_agents: i64,
    pub total_insights: i64,
    pub total_syncs: i64,
    pub syncs_last_24h: i64,
    pub cross_agent_patterns: i64,
    pub collective_strategies: i64,
    /// Mean leaderboard score across all ranked agents
    pub avg_agent_performance: f64,
    /// Three most confident regular insights
    #[sqlx(skip)]
    pub top_insights: Vec<GlobalInsight>,
}

#[derive(Debug, FromRow)]
struct InsightRow {
    insight_type: String,
    action_type: String,
    average_reward: f64,
    std_deviation: f64,
    sample_size: i64,
    confidence: f64,
    optimal_hour: Option<i32>,
    contributing_agent: String,
    applicable_agents: serde_json::Value,
    last_updated: DateTime<Utc>,
}

impl InsightRow {
    fn into_insight(self) -> GlobalInsight {
        let applicable_agents =
            serde_json::from_value(self.applicable_agents).unwrap_or(Applicability::All);
        GlobalInsight {
            insight_type: self.insight_type,
            action_type: self.action_type,
            average_reward: self.average_reward,
            std_deviation: self.std_deviation,
            sample_size: self.sample_size,
            confidence: self.confidence,
            optimal_hour: self.optimal_hour,
            contributing_agent: self.contributing_agent,
            applicable_agents,
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug, FromRow)]
struct StrategyRow {
    name: String,
    description: String,
    success_rate: f64,
    avg_reward: f64,
    adopted_by: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl StrategyRow {
    fn into_strategy(self) -> CollectiveStrategy {
        CollectiveStrategy {
            name: self.name,
            description: self.description,
            success_rate: self.success_rate,
            avg_reward: self.avg_reward,
            adopted_by: serde_json::from_value(self.adopted_by).unwrap_or_default(),
            updated_at: self.updated_at,
        }
    }
}

/// Shared central memory on PostgreSQL.
///
/// Cloneable handle; all clones share the same pool.
#[derive(Clone)]
pub struct CentralMemory {
    db: Option<Arc<Database>>,
}

impl CentralMemory {
    pub fn new(db: Option<Arc<Database>>) -> Self {
        if db.is_none() {
            warn!("central memory running without PostgreSQL");
        }
        Self { db }
    }

    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    /// Create the central memory tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        for statement in [
            r"
            CREATE TABLE IF NOT EXISTS active_agents (
                agent_id      TEXT PRIMARY KEY,
                agent_type    TEXT NOT NULL,
                capabilities  JSONB NOT NULL DEFAULT '[]',
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_sync     TIMESTAMPTZ
            )
            ",
            r#"
            CREATE TABLE IF NOT EXISTS global_insights (
                id                 BIGSERIAL PRIMARY KEY,
                insight_type       TEXT NOT NULL,
                action_type        TEXT NOT NULL,
                average_reward     DOUBLE PRECISION NOT NULL,
                std_deviation      DOUBLE PRECISION NOT NULL DEFAULT 0,
                sample_size        BIGINT NOT NULL,
                confidence         DOUBLE PRECISION NOT NULL,
                optimal_hour       INT,
                contributing_agent TEXT NOT NULL,
                applicable_agents  JSONB NOT NULL DEFAULT '"all"',
                priority           TEXT,
                acknowledged_by    JSONB NOT NULL DEFAULT '[]',
                last_updated       TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            // Regular insights are unique per type and action; urgent
            // broadcasts (priority set) may repeat freely
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS global_insights_type_action
            ON global_insights (insight_type, action_type)
            WHERE priority IS NULL
            ",
            r"
            CREATE TABLE IF NOT EXISTS agent_synchronization (
                id             BIGSERIAL PRIMARY KEY,
                agent_id       TEXT NOT NULL,
                sync_data      JSONB NOT NULL,
                sync_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS collective_strategies (
                id           BIGSERIAL PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                description  TEXT NOT NULL DEFAULT '',
                success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                avg_reward   DOUBLE PRECISION NOT NULL DEFAULT 0,
                adopted_by   JSONB NOT NULL DEFAULT '[]',
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS cross_agent_patterns (
                id                BIGSERIAL PRIMARY KEY,
                pattern_type      TEXT NOT NULL,
                action_type       TEXT NOT NULL,
                supporting_agents JSONB NOT NULL,
                pattern_strength  DOUBLE PRECISION NOT NULL,
                avg_reward        DOUBLE PRECISION NOT NULL,
                avg_q_value       DOUBLE PRECISION NOT NULL,
                confidence        DOUBLE PRECISION NOT NULL,
                discovered_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS performance_leaderboard (
                agent_id               TEXT PRIMARY KEY,
                agent_type             TEXT NOT NULL,
                overall_score          DOUBLE PRECISION NOT NULL,
                total_experiences      BIGINT NOT NULL,
                avg_q_value            DOUBLE PRECISION NOT NULL,
                avg_reward             DOUBLE PRECISION NOT NULL,
                high_value_experiences BIGINT NOT NULL,
                rank                   INT NOT NULL,
                last_updated           TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ] {
            sqlx::query(statement)
                .execute(db.pool())
                .await
                .context("Failed to create central memory schema")?;
        }

        Ok(())
    }

    /// Register an agent in the collective (idempotent upsert).
    ///
    /// Returns false when the backend is unavailable or failing.
    pub async fn register_agent(&self, profile: &AgentProfile) -> Result<bool> {
        let Some(db) = &self.db else {
            return Ok(false);
        };

        match self.upsert_agent(db, profile).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(agent_id = %profile.agent_id, "register_agent failed: {e:#}");
                Ok(false)
            }
        }
    }

    async fn upsert_agent(&self, db: &Database, profile: &AgentProfile) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO active_agents (agent_id, agent_type, capabilities)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_id) DO UPDATE SET
                agent_type   = EXCLUDED.agent_type,
                capabilities = EXCLUDED.capabilities
            ",
        )
        .bind(profile.agent_id.as_str())
        .bind(&profile.agent_type)
        .bind(serde_json::to_value(&profile.capabilities)?)
        .execute(db.pool())
        .await
        .context("Failed to register agent")?;

        info!(agent_id = %profile.agent_id, agent_type = %profile.agent_type, "agent registered in central memory");
        Ok(())
    }

    /// Record an agent's sync summary and mine it into global insights.
    ///
    /// Returns the number of insights stored or refreshed, 0 when the
    /// backend is unavailable or failing.
    pub async fn synchronize_agent_knowledge(
        &self,
        agent_id: &AgentId,
        summary: &LtmSummary,
    ) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        match self.record_sync(db, agent_id, summary).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!(agent_id = %agent_id, "synchronize_agent_knowledge failed: {e:#}");
                Ok(0)
            }
        }
    }

    async fn record_sync(
        &self,
        db: &Database,
        agent_id: &AgentId,
        summary: &LtmSummary,
    ) -> Result<usize> {
        sqlx::query("INSERT INTO agent_synchronization (agent_id, sync_data) VALUES ($1, $2)")
            .bind(agent_id.as_str())
            .bind(serde_json::to_value(summary)?)
            .execute(db.pool())
            .await
            .context("Failed to record synchronization")?;

        let mut insights = mine_action_insights(agent_id.as_str(), &summary.best_experiences);
        insights.extend(mine_timing_insights(agent_id.as_str(), &summary.best_experiences));

        for insight in &insights {
            self.upsert_insight(insight).await?;
        }

        sqlx::query("UPDATE active_agents SET last_sync = NOW() WHERE agent_id = $1")
            .bind(agent_id.as_str())
            .execute(db.pool())
            .await
            .context("Failed to update last sync")?;

        debug!(agent_id = %agent_id, insights = insights.len(), "agent knowledge synchronized");
        Ok(insights.len())
    }

    /// Upsert a single insight. Last writer wins per (insight_type,
    /// action_type): the latest contributing agent's computation replaces
    /// the stored row outright, with no merging.
    async fn upsert_insight(&self, insight: &GlobalInsight) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        sqlx::query(
            r"
            INSERT INTO global_insights
                (insight_type, action_type, average_reward, std_deviation, sample_size,
                 confidence, optimal_hour, contributing_agent, applicable_agents, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (insight_type, action_type) WHERE priority IS NULL DO UPDATE SET
                average_reward     = EXCLUDED.average_reward,
                std_deviation      = EXCLUDED.std_deviation,
                sample_size        = EXCLUDED.sample_size,
                confidence         = EXCLUDED.confidence,
                optimal_hour       = EXCLUDED.optimal_hour,
                contributing_agent = EXCLUDED.contributing_agent,
                applicable_agents  = EXCLUDED.applicable_agents,
                last_updated       = NOW()
            ",
        )
        .bind(&insight.insight_type)
        .bind(&insight.action_type)
        .bind(insight.average_reward)
        .bind(insight.std_deviation)
        .bind(insight.sample_size)
        .bind(insight.confidence)
        .bind(insight.optimal_hour)
        .bind(&insight.contributing_agent)
        .bind(serde_json::to_value(&insight.applicable_agents)?)
        .execute(db.pool())
        .await
        .context("Failed to upsert insight")?;

        Ok(())
    }

    /// Insights and strategies relevant to the given agent.
    ///
    /// Relevance means confidence at or above the floor, applicable to all
    /// agents or intersecting the agent's capabilities.
    pub async fn get_insights_for_agent(&self, profile: &AgentProfile) -> Result<AgentInsights> {
        let Some(db) = &self.db else {
            return Ok(AgentInsights::empty());
        };

        match self.fetch_insights(db, profile).await {
            Ok(insights) => Ok(insights),
            Err(e) => {
                warn!(agent_id = %profile.agent_id, "get_insights_for_agent failed: {e:#}");
                Ok(AgentInsights::empty())
            }
        }
    }

    async fn fetch_insights(&self, db: &Database, profile: &AgentProfile) -> Result<AgentInsights> {
        let rows = sqlx::query_as::<_, InsightRow>(
            r#"
            SELECT insight_type, action_type, average_reward, std_deviation, sample_size,
                   confidence, optimal_hour, contributing_agent, applicable_agents, last_updated
            FROM global_insights
            WHERE priority IS NULL
              AND confidence >= $2
              AND (applicable_agents = '"all"'::jsonb OR jsonb_exists_any(applicable_agents, $1))
            ORDER BY confidence DESC
            "#,
        )
        .bind(&profile.capabilities)
        .bind(INSIGHT_RELEVANCE_FLOOR)
        .fetch_all(db.pool())
        .await
        .context("Failed to get insights")?;

        let strategies = sqlx::query_as::<_, StrategyRow>(
            r"
            SELECT name, description, success_rate, avg_reward, adopted_by, updated_at
            FROM collective_strategies
            ORDER BY success_rate DESC
            LIMIT 20
            ",
        )
        .fetch_all(db.pool())
        .await
        .context("Failed to get collective strategies")?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM global_insights WHERE priority IS NULL")
                .fetch_one(db.pool())
                .await
                .context("Failed to count insights")?;

        Ok(AgentInsights {
            insights: rows.into_iter().map(InsightRow::into_insight).collect(),
            strategies: strategies.into_iter().map(StrategyRow::into_strategy).collect(),
            sync_timestamp: Utc::now(),
            total_insights_available: total,
        })
    }

    /// Broadcast an urgent insight to every other agent.
    ///
    /// Urgent rows bypass the uniqueness of regular insights and carry an
    /// acknowledgment list so each agent sees them exactly once.
    pub async fn broadcast_urgent_insight(
        &self,
        from: &AgentId,
        action: ActionKind,
        reward: f64,
    ) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        if let Err(e) = self.insert_urgent(db, from, action, reward).await {
            warn!(from = %from, "broadcast_urgent_insight failed: {e:#}");
        }
        Ok(())
    }

    async fn insert_urgent(
        &self,
        db: &Database,
        from: &AgentId,
        action: ActionKind,
        reward: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_insights
                (insight_type, action_type, average_reward, std_deviation, sample_size,
                 confidence, contributing_agent, applicable_agents, priority, acknowledged_by)
            VALUES ('urgent_success', $1, $2, 0, 1, 1.0, $3, '"all"'::jsonb, 'urgent', '[]'::jsonb)
            "#,
        )
        .bind(action.as_str())
        .bind(reward)
        .bind(from.as_str())
        .execute(db.pool())
        .await
        .context("Failed to broadcast urgent insight")?;

        info!(from = %from, action = %action, reward, "urgent insight broadcast");
        Ok(())
    }

    /// Broadcast a leaderboard standout as an urgent insight.
    ///
    /// Emitted by the orchestrator after a leaderboard refresh; the action
    /// type `overall` marks it as agent-level rather than action-level.
    pub async fn broadcast_top_performer(&self, agent_id: &AgentId, avg_reward: f64) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        if let Err(e) = self.insert_top_performer(db, agent_id, avg_reward).await {
            warn!(agent_id = %agent_id, "broadcast_top_performer failed: {e:#}");
        }
        Ok(())
    }

    async fn insert_top_performer(
        &self,
        db: &Database,
        agent_id: &AgentId,
        avg_reward: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_insights
                (insight_type, action_type, average_reward, std_deviation, sample_size,
                 confidence, contributing_agent, applicable_agents, priority, acknowledged_by)
            VALUES ('top_performer', 'overall', $1, 0, 1, 1.0, $2, '"all"'::jsonb, 'urgent', '[]'::jsonb)
            "#,
        )
        .bind(avg_reward)
        .bind(agent_id.as_str())
        .execute(db.pool())
        .await
        .context("Failed to broadcast top performer")?;

        info!(agent_id = %agent_id, avg_reward, "top performer broadcast");
        Ok(())
    }

    /// Urgent insights this agent has not acknowledged yet, excluding its
    /// own broadcasts. Fetched insights are acknowledged immediately.
    pub async fn get_urgent_insights(&self, agent_id: &AgentId) -> Result<Vec<GlobalInsight>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.fetch_urgent(db, agent_id).await {
            Ok(insights) => Ok(insights),
            Err(e) => {
                warn!(agent_id = %agent_id, "get_urgent_insights failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_urgent(&self, db: &Database, agent_id: &AgentId) -> Result<Vec<GlobalInsight>> {
        let rows = sqlx::query_as::<_, InsightRow>(
            r"
            SELECT insight_type, action_type, average_reward, std_deviation, sample_size,
                   confidence, optimal_hour, contributing_agent, applicable_agents, last_updated
            FROM global_insights
            WHERE priority = 'urgent'
              AND contributing_agent <> $1
              AND NOT acknowledged_by @> to_jsonb($1::text)
            ORDER BY last_updated DESC
            ",
        )
        .bind(agent_id.as_str())
        .fetch_all(db.pool())
        .await
        .context("Failed to get urgent insights")?;

        if !rows.is_empty() {
            sqlx::query(
                r"
                UPDATE global_insights
                SET acknowledged_by = acknowledged_by || to_jsonb($1::text)
                WHERE priority = 'urgent'
                  AND contributing_agent <> $1
                  AND NOT acknowledged_by @> to_jsonb($1::text)
                ",
            )
            .bind(agent_id.as_str())
            .execute(db.pool())
            .await
            .context("Failed to acknowledge urgent insights")?;
        }

        Ok(rows.into_iter().map(InsightRow::into_insight).collect())
    }

    /// Upsert a collective strategy and record the contributing agent
    pub async fn update_collective_strategy(
        &self,
        agent_id: &AgentId,
        name: &str,
        description: &str,
        success_rate: f64,
        avg_reward: f64,
    ) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        if let Err(e) = self
            .upsert_strategy(db, agent_id, name, description, success_rate, avg_reward)
            .await
        {
            warn!(agent_id = %agent_id, name, "update_collective_strategy failed: {e:#}");
        }
        Ok(())
    }

    async fn upsert_strategy(
        &self,
        db: &Database,
        agent_id: &AgentId,
        name: &str,
        description: &str,
        success_rate: f64,
        avg_reward: f64,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO collective_strategies (name, description, success_rate, avg_reward, adopted_by)
            VALUES ($1, $2, $3, $4, to_jsonb(ARRAY[$5::text]))
            ON CONFLICT (name) DO UPDATE SET
                description  = EXCLUDED.description,
                success_rate = EXCLUDED.success_rate,
                avg_reward   = EXCLUDED.avg_reward,
                adopted_by   = CASE
                    WHEN collective_strategies.adopted_by @> to_jsonb($5::text)
                    THEN collective_strategies.adopted_by
                    ELSE collective_strategies.adopted_by || to_jsonb($5::text)
                END,
                updated_at   = NOW()
            ",
        )
        .bind(name)
        .bind(description)
        .bind(success_rate)
        .bind(avg_reward)
        .bind(agent_id.as_str())
        .execute(db.pool())
        .await
        .context("Failed to update collective strategy")?;

        Ok(())
    }

    /// Detect actions that several agents learned to value highly within
    /// the recent sync window, and persist them as patterns.
    pub async fn detect_cross_agent_patterns(&self) -> Result<Vec<CrossAgentPattern>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.mine_patterns(db).await {
            Ok(patterns) => Ok(patterns),
            Err(e) => {
                warn!("detect_cross_agent_patterns failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn mine_patterns(&self, db: &Database) -> Result<Vec<CrossAgentPattern>> {
        let since = Utc::now() - Duration::hours(PATTERN_WINDOW_HOURS);
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r"
            SELECT agent_id, sync_data
            FROM agent_synchronization
            WHERE sync_timestamp >= $1
            ",
        )
        .bind(since)
        .fetch_all(db.pool())
        .await
        .context("Failed to read recent syncs")?;

        let syncs: Vec<(String, LtmSummary)> = rows
            .into_iter()
            .filter_map(|(agent_id, data)| {
                serde_json::from_value(data).ok().map(|s| (agent_id, s))
            })
            .collect();

        // A single sync cannot support a cross-agent pattern
        if syncs.len() < 2 {
            return Ok(Vec::new());
        }

        let patterns = detect_patterns(&syncs);

        for pattern in &patterns {
            sqlx::query(
                r"
                INSERT INTO cross_agent_patterns
                    (pattern_type, action_type, supporting_agents, pattern_strength,
                     avg_reward, avg_q_value, confidence)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(&pattern.pattern_type)
            .bind(&pattern.action_type)
            .bind(serde_json::to_value(&pattern.supporting_agents)?)
            .bind(pattern.pattern_strength)
            .bind(pattern.avg_reward)
            .bind(pattern.avg_q_value)
            .bind(pattern.confidence)
            .execute(db.pool())
            .await
            .context("Failed to store cross-agent pattern")?;
        }

        if !patterns.is_empty() {
            info!(count = patterns.len(), "cross-agent patterns detected");
        }
        Ok(patterns)
    }

    /// Recompute the performance leaderboard from each agent's latest sync
    pub async fn update_performance_leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.rebuild_leaderboard(db).await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!("update_performance_leaderboard failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn rebuild_leaderboard(&self, db: &Database) -> Result<Vec<LeaderboardEntry>> {
        let rows: Vec<(String, String, serde_json::Value)> = sqlx::query_as(
            r"
            SELECT DISTINCT ON (s.agent_id) s.agent_id,
                   COALESCE(a.agent_type, 'unknown'),
                   s.sync_data
            FROM agent_synchronization s
            LEFT JOIN active_agents a ON a.agent_id = s.agent_id
            ORDER BY s.agent_id, s.sync_timestamp DESC
            ",
        )
        .fetch_all(db.pool())
        .await
        .context("Failed to read latest syncs")?;

        let mut entries: Vec<LeaderboardEntry> = rows
            .into_iter()
            .filter_map(|(agent_id, agent_type, data)| {
                let summary: LtmSummary = serde_json::from_value(data).ok()?;
                Some(LeaderboardEntry {
                    agent_id,
                    agent_type,
                    overall_score: compute_overall_score(&summary),
                    total_experiences: summary.total_experiences,
                    avg_q_value: summary.avg_q_value,
                    avg_reward: summary.avg_reward,
                    high_value_experiences: summary.high_value_experiences,
                    rank: 0,
                    last_updated: Utc::now(),
                })
            })
            .collect();

        entries.sort_by(|a, b| b.overall_score.total_cmp(&a.overall_score));
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = i as i32 + 1;
        }

        for entry in &entries {
            sqlx::query(
                r"
                INSERT INTO performance_leaderboard
                    (agent_id, agent_type, overall_score, total_experiences, avg_q_value,
                     avg_reward, high_value_experiences, rank, last_updated)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                ON CONFLICT (agent_id) DO UPDATE SET
                    agent_type             = EXCLUDED.agent_type,
                    overall_score          = EXCLUDED.overall_score,
                    total_experiences      = EXCLUDED.total_experiences,
                    avg_q_value            = EXCLUDED.avg_q_value,
                    avg_reward             = EXCLUDED.avg_reward,
                    high_value_experiences = EXCLUDED.high_value_experiences,
                    rank                   = EXCLUDED.rank,
                    last_updated           = NOW()
                ",
            )
            .bind(&entry.agent_id)
            .bind(&entry.agent_type)
            .bind(entry.overall_score)
            .bind(entry.total_experiences)
            .bind(entry.avg_q_value)
            .bind(entry.avg_reward)
            .bind(entry.high_value_experiences)
            .bind(entry.rank)
            .execute(db.pool())
            .await
            .context("Failed to update leaderboard")?;
        }

        Ok(entries)
    }

    /// Activity counters and headline figures for the whole collective
    /// (zeros when the backend is unavailable or failing)
    pub async fn get_global_statistics(&self) -> Result<GlobalStats> {
        let Some(db) = &self.db else {
            return Ok(GlobalStats::default());
        };

        match self.fetch_global_statistics(db).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                warn!("get_global_statistics failed: {e:#}");
                Ok(GlobalStats::default())
            }
        }
    }

    async fn fetch_global_statistics(&self, db: &Database) -> Result<GlobalStats> {
        let mut stats = sqlx::query_as::<_, GlobalStats>(
            r"
            SELECT
                (SELECT COUNT(*) FROM active_agents) as active_agents,
                (SELECT COUNT(*) FROM global_insights) as total_insights,
                (SELECT COUNT(*) FROM agent_synchronization) as total_syncs,
                (SELECT COUNT(*) FROM agent_synchronization
                 WHERE sync_timestamp >= NOW() - INTERVAL '24 hours') as syncs_last_24h,
                (SELECT COUNT(*) FROM cross_agent_patterns) as cross_agent_patterns,
                (SELECT COUNT(*) FROM collective_strategies) as collective_strategies,
                (SELECT COALESCE(AVG(overall_score), 0)
                 FROM performance_leaderboard) as avg_agent_performance
            ",
        )
        .fetch_one(db.pool())
        .await
        .context("Failed to get global statistics")?;

        let top = sqlx::query_as::<_, InsightRow>(
            r"
            SELECT insight_type, action_type, average_reward, std_deviation, sample_size,
                   confidence, optimal_hour, contributing_agent, applicable_agents, last_updated
            FROM global_insights
            WHERE priority IS NULL
            ORDER BY confidence DESC
            LIMIT 3
            ",
        )
        .fetch_all(db.pool())
        .await
        .context("Failed to get top insights")?;

        stats.top_insights = top.into_iter().map(InsightRow::into_insight).collect();
        Ok(stats)
    }
}

/// Mine per-action performance insights from a batch of high-value
/// experiences. Requires at least `MIN_PERFORMANCE_SAMPLES` per action.
fn mine_action_insights(agent_id: &str, best: &[BestExperience]) -> Vec<GlobalInsight> {
    let mut by_action: HashMap<ActionKind, Vec<f64>> = HashMap::new();
    for exp in best {
        by_action.entry(exp.action).or_default().push(exp.reward);
    }

    let mut insights = Vec::new();
    for (action, rewards) in by_action {
        if rewards.len() < MIN_PERFORMANCE_SAMPLES {
            continue;
        }
        let n = rewards.len() as f64;
        let mean = rewards.iter().sum::<f64>() / n;
        // Sample variance (n - 1 denominator); n >= MIN_PERFORMANCE_SAMPLES
        let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

        insights.push(GlobalInsight {
            insight_type: "action_performance".to_string(),
            action_type: action.as_str().to_string(),
            average_reward: mean,
            std_deviation: variance.sqrt(),
            sample_size: rewards.len() as i64,
            confidence: (n / 10.0).min(1.0),
            optimal_hour: None,
            contributing_agent: agent_id.to_string(),
            applicable_agents: Applicability::All,
            last_updated: Utc::now(),
        });
    }
    insights
}

/// Mine per-action timing insights: the hour at which an action performed
/// best. The optimal hour is the mode of observed hours, falling back to
/// the median when every hour is distinct.
fn mine_timing_insights(agent_id: &str, best: &[BestExperience]) -> Vec<GlobalInsight> {
    let mut by_action: HashMap<ActionKind, Vec<(i64, f64)>> = HashMap::new();
    for exp in best {
        let Some(hour) = exp.state.pointer("/temporal_context/hour").and_then(serde_json::Value::as_i64)
        else {
            continue;
        };
        by_action.entry(exp.action).or_default().push((hour, exp.reward));
    }

    let mut insights = Vec::new();
    for (action, samples) in by_action {
        if samples.len() < MIN_TIMING_SAMPLES {
            continue;
        }

        let mut hour_counts: HashMap<i64, usize> = HashMap::new();
        for (hour, _) in &samples {
            *hour_counts.entry(*hour).or_insert(0) += 1;
        }
        let (mode_hour, mode_count) = hour_counts
            .iter()
            .max_by_key(|(hour, count)| (**count, std::cmp::Reverse(**hour)))
            .map(|(h, c)| (*h, *c))
            .unwrap_or((12, 0));

        let optimal_hour = if mode_count > 1 {
            mode_hour
        } else {
            let mut hours: Vec<i64> = samples.iter().map(|(h, _)| *h).collect();
            hours.sort_unstable();
            let mid = hours.len() / 2;
            if hours.len() % 2 == 0 {
                // Even count: midpoint of the middle pair, half hours floored
                (hours[mid - 1] + hours[mid]) / 2
            } else {
                hours[mid]
            }
        };

        let n = samples.len() as f64;
        let mean_reward = samples.iter().map(|(_, r)| r).sum::<f64>() / n;

        insights.push(GlobalInsight {
            insight_type: "optimal_timing".to_string(),
            action_type: action.as_str().to_string(),
            average_reward: mean_reward,
            std_deviation: 0.0,
            sample_size: samples.len() as i64,
            confidence: (n / 20.0).min(1.0),
            optimal_hour: Some(optimal_hour as i32),
            contributing_agent: agent_id.to_string(),
            applicable_agents: Applicability::All,
            last_updated: Utc::now(),
        });
    }
    insights
}

/// Find actions that several distinct agents learned to value highly
fn detect_patterns(syncs: &[(String, LtmSummary)]) -> Vec<CrossAgentPattern> {
    let mut by_action: HashMap<ActionKind, (Vec<String>, Vec<f64>, Vec<f64>)> = HashMap::new();
    let total_agents = {
        let mut agents: Vec<&String> = syncs.iter().map(|(a, _)| a).collect();
        agents.sort();
        agents.dedup();
        agents.len()
    };

    for (agent_id, summary) in syncs {
        for exp in &summary.best_experiences {
            if exp.q_value < PATTERN_HIGH_Q {
                continue;
            }
            let entry = by_action.entry(exp.action).or_default();
            if !entry.0.contains(agent_id) {
                entry.0.push(agent_id.clone());
            }
            entry.1.push(exp.reward);
            entry.2.push(exp.q_value);
        }
    }

    let mut patterns = Vec::new();
    for (action, (mut agents, rewards, q_values)) in by_action {
        if agents.len() < PATTERN_MIN_AGENTS {
            continue;
        }
        agents.sort();
        let n = rewards.len() as f64;

        patterns.push(CrossAgentPattern {
            pattern_type: "successful_action_pattern".to_string(),
            action_type: action.as_str().to_string(),
            pattern_strength: (agents.len() as f64 / total_agents.max(1) as f64).min(1.0),
            avg_reward: rewards.iter().sum::<f64>() / n,
            avg_q_value: q_values.iter().sum::<f64>() / n,
            confidence: (agents.len() as f64 / 5.0).min(1.0),
            supporting_agents: agents,
            discovered_at: Utc::now(),
        });
    }

    patterns.sort_by(|a, b| b.pattern_strength.total_cmp(&a.pattern_strength));
    patterns
}

/// Composite score behind the leaderboard: experience volume (30%),
/// learning quality (50%) and high-value share (20%)
pub fn compute_overall_score(summary: &LtmSummary) -> f64 {
    let volume = (summary.total_experiences as f64 / 1000.0).min(1.0);
    let quality = (summary.avg_q_value + summary.avg_reward) / 2.0;
    let high_value_share = (summary.high_value_experiences as f64
        / summary.total_experiences.max(1) as f64)
        .min(1.0);

    0.3 * volume + 0.5 * quality + 0.2 * high_value_share
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experience(action: ActionKind, reward: f64, q: f64, hour: Option<i64>) -> BestExperience {
        let state = match hour {
            Some(h) => serde_json::json!({ "temporal_context": { "hour": h } }),
            None => serde_json::Value::Null,
        };
        BestExperience {
            action,
            reward,
            q_value: q,
            state,
        }
    }

    fn summary(best: Vec<BestExperience>) -> LtmSummary {
        LtmSummary {
            total_experiences: 100,
            high_value_experiences: best.len() as i64,
            avg_q_value: 0.6,
            avg_reward: 0.4,
            max_q_value: 0.95,
            min_q_value: -0.2,
            learned_patterns: 2,
            active_strategies: 1,
            best_experiences: best,
            sync_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_applicability_wire_format() {
        let all = serde_json::to_value(Applicability::All).unwrap();
        assert_eq!(all, serde_json::json!("all"));

        let caps = serde_json::to_value(Applicability::Capabilities(vec![
            "seo".to_string(),
            "timing".to_string(),
        ]))
        .unwrap();
        assert_eq!(caps, serde_json::json!(["seo", "timing"]));

        let parsed: Applicability = serde_json::from_value(serde_json::json!("all")).unwrap();
        assert_eq!(parsed, Applicability::All);
        let parsed: Applicability = serde_json::from_value(serde_json::json!(["seo"])).unwrap();
        assert_eq!(parsed, Applicability::Capabilities(vec!["seo".to_string()]));
    }

    #[test]
    fn test_action_insights_need_three_samples() {
        let two = vec![
            experience(ActionKind::TitleOptimization, 0.8, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.6, 0.85, None),
        ];
        assert!(mine_action_insights("writer", &two).is_empty());

        let three = vec![
            experience(ActionKind::TitleOptimization, 0.8, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.6, 0.85, None),
            experience(ActionKind::TitleOptimization, 0.7, 0.88, None),
        ];
        let insights = mine_action_insights("writer", &three);
        assert_eq!(insights.len(), 1);

        let insight = &insights[0];
        assert_eq!(insight.insight_type, "action_performance");
        assert_eq!(insight.action_type, "title_optimization");
        assert_eq!(insight.sample_size, 3);
        assert!((insight.average_reward - 0.7).abs() < 1e-12);
        assert!((insight.confidence - 0.3).abs() < 1e-12);
        // Sample stdev of [0.8, 0.6, 0.7]: sqrt((0.01 + 0.01 + 0) / 2) = 0.1
        assert!((insight.std_deviation - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_timing_insight_prefers_mode_over_median() {
        let samples = vec![
            experience(ActionKind::UploadTimeOptimization, 0.8, 0.9, Some(20)),
            experience(ActionKind::UploadTimeOptimization, 0.7, 0.9, Some(20)),
            experience(ActionKind::UploadTimeOptimization, 0.6, 0.9, Some(8)),
            experience(ActionKind::UploadTimeOptimization, 0.5, 0.9, Some(12)),
            experience(ActionKind::UploadTimeOptimization, 0.9, 0.9, Some(16)),
        ];

        let insights = mine_timing_insights("scheduler", &samples);
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].optimal_hour, Some(20));
        assert!((insights[0].confidence - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_timing_insight_falls_back_to_median() {
        let samples = vec![
            experience(ActionKind::UploadTimeOptimization, 0.8, 0.9, Some(6)),
            experience(ActionKind::UploadTimeOptimization, 0.7, 0.9, Some(9)),
            experience(ActionKind::UploadTimeOptimization, 0.6, 0.9, Some(12)),
            experience(ActionKind::UploadTimeOptimization, 0.5, 0.9, Some(15)),
            experience(ActionKind::UploadTimeOptimization, 0.9, 0.9, Some(22)),
        ];

        let insights = mine_timing_insights("scheduler", &samples);
        assert_eq!(insights.len(), 1);
        // all hours distinct: median of [6, 9, 12, 15, 22]
        assert_eq!(insights[0].optimal_hour, Some(12));
    }

    #[test]
    fn test_timing_median_averages_middle_pair_for_even_counts() {
        let samples = vec![
            experience(ActionKind::UploadTimeOptimization, 0.8, 0.9, Some(6)),
            experience(ActionKind::UploadTimeOptimization, 0.7, 0.9, Some(8)),
            experience(ActionKind::UploadTimeOptimization, 0.6, 0.9, Some(10)),
            experience(ActionKind::UploadTimeOptimization, 0.5, 0.9, Some(14)),
            experience(ActionKind::UploadTimeOptimization, 0.9, 0.9, Some(18)),
            experience(ActionKind::UploadTimeOptimization, 0.4, 0.9, Some(22)),
        ];

        let insights = mine_timing_insights("scheduler", &samples);
        assert_eq!(insights.len(), 1);
        // middle pair of [6, 8, 10, 14, 18, 22] is (10, 14)
        assert_eq!(insights[0].optimal_hour, Some(12));
    }

    #[test]
    fn test_timing_insights_skip_states_without_hour() {
        let samples = vec![
            experience(ActionKind::TitleOptimization, 0.8, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.7, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.6, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.5, 0.9, None),
            experience(ActionKind::TitleOptimization, 0.9, 0.9, None),
        ];
        assert!(mine_timing_insights("writer", &samples).is_empty());
    }

    #[test]
    fn test_pattern_requires_three_distinct_agents() {
        let exp = |q| experience(ActionKind::ContentStrategy, 0.8, q, None);

        let two_agents = vec![
            ("a".to_string(), summary(vec![exp(0.9)])),
            ("b".to_string(), summary(vec![exp(0.85)])),
        ];
        assert!(detect_patterns(&two_agents).is_empty());

        let three_agents = vec![
            ("a".to_string(), summary(vec![exp(0.9)])),
            ("b".to_string(), summary(vec![exp(0.85)])),
            ("c".to_string(), summary(vec![exp(0.92)])),
        ];
        let patterns = detect_patterns(&three_agents);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].supporting_agents.len(), 3);
        assert!((patterns[0].pattern_strength - 1.0).abs() < 1e-12);
        assert!((patterns[0].confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_pattern_ignores_low_q_experiences() {
        let syncs = vec![
            ("a".to_string(), summary(vec![experience(ActionKind::ContentStrategy, 0.8, 0.7, None)])),
            ("b".to_string(), summary(vec![experience(ActionKind::ContentStrategy, 0.8, 0.75, None)])),
            ("c".to_string(), summary(vec![experience(ActionKind::ContentStrategy, 0.8, 0.79, None)])),
        ];
        assert!(detect_patterns(&syncs).is_empty());
    }

    #[test]
    fn test_overall_score_weights() {
        let s = LtmSummary {
            total_experiences: 500,
            high_value_experiences: 100,
            avg_q_value: 0.6,
            avg_reward: 0.4,
            max_q_value: 1.0,
            min_q_value: 0.0,
            learned_patterns: 0,
            active_strategies: 0,
            best_experiences: Vec::new(),
            sync_timestamp: Utc::now(),
        };

        // 0.3 * 0.5 + 0.5 * 0.5 + 0.2 * 0.2
        let expected = 0.3 * 0.5 + 0.5 * 0.5 + 0.2 * 0.2;
        assert!((compute_overall_score(&s) - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_backend_failure_mid_session_is_neutral() {
        let db = Database::connect_lazy("postgres://nobody@127.0.0.1:1/none").unwrap();
        let central = CentralMemory::new(Some(Arc::new(db)));
        assert!(central.is_available());

        let profile = AgentProfile {
            agent_id: AgentId::from("scout"),
            agent_type: "seo".to_string(),
            capabilities: vec!["seo".to_string()],
        };

        assert!(!central.register_agent(&profile).await.unwrap());
        assert_eq!(
            central
                .synchronize_agent_knowledge(&profile.agent_id, &summary(Vec::new()))
                .await
                .unwrap(),
            0
        );

        let insights = central.get_insights_for_agent(&profile).await.unwrap();
        assert!(insights.insights.is_empty());
        assert_eq!(insights.total_insights_available, 0);

        central
            .broadcast_urgent_insight(&profile.agent_id, ActionKind::TitleOptimization, 0.95)
            .await
            .unwrap();
        central.broadcast_top_performer(&profile.agent_id, 0.9).await.unwrap();
        assert!(central.get_urgent_insights(&profile.agent_id).await.unwrap().is_empty());

        central
            .update_collective_strategy(&profile.agent_id, "steady", "", 0.7, 0.5)
            .await
            .unwrap();
        assert!(central.detect_cross_agent_patterns().await.unwrap().is_empty());
        assert!(central.update_performance_leaderboard().await.unwrap().is_empty());

        let stats = central.get_global_statistics().await.unwrap();
        assert_eq!(stats.total_syncs, 0);
        assert!(stats.top_insights.is_empty());
    }

    #[test]
    fn test_overall_score_caps_volume_and_share() {
        let s = LtmSummary {
            total_experiences: 50_000,
            high_value_experiences: 50_000,
            avg_q_value: 1.0,
            avg_reward: 1.0,
            max_q_value: 1.0,
            min_q_value: 1.0,
            learned_patterns: 0,
            active_strategies: 0,
            best_experiences: Vec::new(),
            sync_timestamp: Utc::now(),
        };
        assert!((compute_overall_score(&s) - 1.0).abs() < 1e-12);
    }
}
