//! Long-term memory: promoted experiences, patterns and strategies in
//! PostgreSQL, partitioned per agent by an `agent_id` column.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, warn};

use hive_core::AgentId;
use hive_rl::{ActionKind, Experience};

use crate::central::{BestExperience, LtmSummary};
use crate::config::PostgresConfig;

/// Q-value at or above which an experience counts as high value
const HIGH_VALUE_Q: f64 = 0.8;

/// Q-value below which stale experiences are eligible for cleanup
const CLEANUP_Q_CEILING: f64 = 0.3;

/// Minimum Q-value for similarity search results
const SIMILARITY_Q_FLOOR: f64 = 0.5;

/// PostgreSQL database connection pool, shared by the long-term and
/// central tiers
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL at {}", config.url);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        // Test connection
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("Failed to execute test query")?;

        info!(
            "PostgreSQL connection established (max connections: {})",
            config.max_connections
        );

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pool that defers connecting until first use, for exercising the
    /// mid-session failure paths
    #[cfg(test)]
    pub(crate) fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy(url)
            .context("Failed to build lazy pool")?;
        Ok(Self { pool })
    }

    /// Create the long-term memory tables if they do not exist
    pub async fn ensure_ltm_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ltm_experiences (
                id          BIGSERIAL PRIMARY KEY,
                agent_id    TEXT NOT NULL,
                stm_id      TEXT NOT NULL DEFAULT '',
                action      TEXT NOT NULL,
                q_value     DOUBLE PRECISION NOT NULL,
                reward      DOUBLE PRECISION NOT NULL,
                state       JSONB NOT NULL,
                experience  JSONB NOT NULL,
                promoted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create ltm_experiences")?;

        // One row per promoted STM record; re-promotion is a no-op
        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS ltm_experiences_agent_stm
            ON ltm_experiences (agent_id, stm_id)
            WHERE stm_id <> ''
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create promotion index")?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ltm_patterns (
                id           BIGSERIAL PRIMARY KEY,
                agent_id     TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                description  TEXT NOT NULL,
                confidence   DOUBLE PRECISION NOT NULL,
                occurrences  INT NOT NULL DEFAULT 1,
                data         JSONB NOT NULL DEFAULT '{}',
                created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create ltm_patterns")?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS ltm_strategies (
                id           BIGSERIAL PRIMARY KEY,
                agent_id     TEXT NOT NULL,
                name         TEXT NOT NULL,
                description  TEXT NOT NULL DEFAULT '',
                avg_reward   DOUBLE PRECISION NOT NULL DEFAULT 0,
                times_used   INT NOT NULL DEFAULT 0,
                success_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                data         JSONB NOT NULL DEFAULT '{}',
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (agent_id, name)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create ltm_strategies")?;

        Ok(())
    }
}

/// Promoted experience record
#[derive(Debug, Clone, FromRow)]
pub struct LtmExperienceRecord {
    pub id: i64,
    pub agent_id: String,
    pub stm_id: String,
    pub action: String,
    pub q_value: f64,
    pub reward: f64,
    pub state: serde_json::Value,
    pub experience: serde_json::Value,
    pub promoted_at: DateTime<Utc>,
}

/// Learned pattern record
#[derive(Debug, Clone, FromRow)]
pub struct LtmPatternRecord {
    pub id: i64,
    pub agent_id: String,
    pub pattern_type: String,
    pub description: String,
    pub confidence: f64,
    pub occurrences: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Strategy record with running success statistics
#[derive(Debug, Clone, FromRow)]
pub struct LtmStrategyRecord {
    pub id: i64,
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub avg_reward: f64,
    pub times_used: i32,
    pub success_rate: f64,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated learning statistics for one agent
#[derive(Debug, Clone, Default, FromRow, serde::Serialize)]
pub struct LtmStats {
    pub total_experiences: i64,
    pub high_value_experiences: i64,
    pub avg_q_value: f64,
    pub avg_reward: f64,
    pub max_q_value: f64,
    pub min_q_value: f64,
    pub learned_patterns: i64,
    pub active_strategies: i64,
}

/// Per-agent long-term memory on PostgreSQL
pub struct Ltm {
    db: Option<Arc<Database>>,
    agent_id: AgentId,
}

impl Ltm {
    pub fn new(db: Option<Arc<Database>>, agent_id: AgentId) -> Self {
        if db.is_none() {
            warn!(agent_id = %agent_id, "long-term memory running without PostgreSQL");
        }
        Self { db, agent_id }
    }

    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    /// Promote an experience from short-term memory.
    ///
    /// Idempotent per `(agent_id, stm_id)`: promoting the same STM record
    /// twice returns the existing row id instead of inserting a duplicate.
    /// Returns `None` when Postgres is unavailable or the write fails.
    pub async fn store_high_value_experience(
        &self,
        stm_id: &str,
        experience: &Experience,
    ) -> Result<Option<i64>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        match self.promote(db, stm_id, experience).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(agent_id = %self.agent_id, stm_id, "store_high_value_experience failed: {e:#}");
                Ok(None)
            }
        }
    }

    async fn promote(
        &self,
        db: &Database,
        stm_id: &str,
        experience: &Experience,
    ) -> Result<Option<i64>> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO ltm_experiences (agent_id, stm_id, action, q_value, reward, state, experience)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (agent_id, stm_id) WHERE stm_id <> '' DO NOTHING
            RETURNING id
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(stm_id)
        .bind(experience.action.as_str())
        .bind(experience.q_value)
        .bind(experience.reward)
        .bind(&experience.state)
        .bind(serde_json::to_value(experience)?)
        .fetch_optional(db.pool())
        .await
        .context("Failed to promote experience")?;

        if let Some((id,)) = inserted {
            debug!(agent_id = %self.agent_id, stm_id, id, "experience promoted to long-term memory");
            return Ok(Some(id));
        }

        // Already promoted: hand back the existing row
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM ltm_experiences WHERE agent_id = $1 AND stm_id = $2",
        )
        .bind(self.agent_id.as_str())
        .bind(stm_id)
        .fetch_optional(db.pool())
        .await
        .context("Failed to look up promoted experience")?;

        Ok(existing.map(|(id,)| id))
    }

    /// Best promoted experiences, highest Q first (empty on a failing backend)
    pub async fn get_best_experiences(&self, limit: i64) -> Result<Vec<LtmExperienceRecord>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.fetch_best(db, limit).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "get_best_experiences failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_best(&self, db: &Database, limit: i64) -> Result<Vec<LtmExperienceRecord>> {
        let records = sqlx::query_as::<_, LtmExperienceRecord>(
            r"
            SELECT id, agent_id, stm_id, action, q_value, reward, state, experience, promoted_at
            FROM ltm_experiences
            WHERE agent_id = $1 AND q_value >= $2
            ORDER BY q_value DESC
            LIMIT $3
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(HIGH_VALUE_Q)
        .bind(limit)
        .fetch_all(db.pool())
        .await
        .context("Failed to get best experiences")?;

        Ok(records)
    }

    /// Experiences similar to the given state context.
    ///
    /// Similarity is coarse: matching video category when the query carries
    /// one, matching action kind when requested, and a Q-value floor.
    pub async fn find_similar_experiences(
        &self,
        state: &serde_json::Value,
        action: Option<ActionKind>,
        limit: i64,
    ) -> Result<Vec<LtmExperienceRecord>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.fetch_similar(db, state, action, limit).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "find_similar_experiences failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_similar(
        &self,
        db: &Database,
        state: &serde_json::Value,
        action: Option<ActionKind>,
        limit: i64,
    ) -> Result<Vec<LtmExperienceRecord>> {
        let category = state
            .pointer("/content_context/video_category")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let records = sqlx::query_as::<_, LtmExperienceRecord>(
            r"
            SELECT id, agent_id, stm_id, action, q_value, reward, state, experience, promoted_at
            FROM ltm_experiences
            WHERE agent_id = $1
              AND q_value >= $2
              AND ($3::text IS NULL OR state->'content_context'->>'video_category' = $3)
              AND ($4::text IS NULL OR action = $4)
            ORDER BY q_value DESC
            LIMIT $5
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(SIMILARITY_Q_FLOOR)
        .bind(category)
        .bind(action.map(ActionKind::as_str))
        .bind(limit)
        .fetch_all(db.pool())
        .await
        .context("Failed to find similar experiences")?;

        Ok(records)
    }

    /// Record a learned pattern, returning `None` when Postgres is
    /// unavailable or the write fails
    pub async fn learn_pattern(
        &self,
        pattern_type: &str,
        description: &str,
        confidence: f64,
        data: serde_json::Value,
    ) -> Result<Option<i64>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };

        match self
            .insert_pattern(db, pattern_type, description, confidence, data)
            .await
        {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                warn!(agent_id = %self.agent_id, pattern_type, "learn_pattern failed: {e:#}");
                Ok(None)
            }
        }
    }

    async fn insert_pattern(
        &self,
        db: &Database,
        pattern_type: &str,
        description: &str,
        confidence: f64,
        data: serde_json::Value,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO ltm_patterns (agent_id, pattern_type, description, confidence, data)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(pattern_type)
        .bind(description)
        .bind(confidence)
        .bind(&data)
        .fetch_one(db.pool())
        .await
        .context("Failed to learn pattern")?;

        debug!(agent_id = %self.agent_id, pattern_type, id, "pattern learned");
        Ok(id)
    }

    /// Patterns above the confidence floor, most confident first
    pub async fn get_relevant_patterns(
        &self,
        min_confidence: f64,
        limit: i64,
    ) -> Result<Vec<LtmPatternRecord>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.fetch_patterns(db, min_confidence, limit).await {
            Ok(patterns) => Ok(patterns),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "get_relevant_patterns failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_patterns(
        &self,
        db: &Database,
        min_confidence: f64,
        limit: i64,
    ) -> Result<Vec<LtmPatternRecord>> {
        let patterns = sqlx::query_as::<_, LtmPatternRecord>(
            r"
            SELECT id, agent_id, pattern_type, description, confidence, occurrences, data,
                   created_at, updated_at
            FROM ltm_patterns
            WHERE agent_id = $1 AND confidence >= $2
            ORDER BY confidence DESC, updated_at DESC
            LIMIT $3
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(min_confidence)
        .bind(limit)
        .fetch_all(db.pool())
        .await
        .context("Failed to get relevant patterns")?;

        Ok(patterns)
    }

    /// Upsert a strategy, folding the new outcome into its running averages.
    /// A failing backend drops the update with a warning.
    pub async fn update_strategy(
        &self,
        name: &str,
        description: &str,
        reward: f64,
        success: bool,
        data: serde_json::Value,
    ) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        if let Err(e) = self
            .upsert_strategy(db, name, description, reward, success, data)
            .await
        {
            warn!(agent_id = %self.agent_id, name, "update_strategy failed: {e:#}");
        }
        Ok(())
    }

    async fn upsert_strategy(
        &self,
        db: &Database,
        name: &str,
        description: &str,
        reward: f64,
        success: bool,
        data: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO ltm_strategies (agent_id, name, description, avg_reward, times_used, success_rate, data)
            VALUES ($1, $2, $3, $4, 1, $5, $6)
            ON CONFLICT (agent_id, name) DO UPDATE SET
                description  = EXCLUDED.description,
                avg_reward   = (ltm_strategies.avg_reward * ltm_strategies.times_used + EXCLUDED.avg_reward)
                               / (ltm_strategies.times_used + 1),
                success_rate = (ltm_strategies.success_rate * ltm_strategies.times_used + EXCLUDED.success_rate)
                               / (ltm_strategies.times_used + 1),
                times_used   = ltm_strategies.times_used + 1,
                data         = EXCLUDED.data,
                updated_at   = NOW()
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(name)
        .bind(description)
        .bind(reward)
        .bind(if success { 1.0 } else { 0.0 })
        .bind(&data)
        .execute(db.pool())
        .await
        .context("Failed to update strategy")?;

        Ok(())
    }

    /// Strategies with the best average reward (empty on a failing backend)
    pub async fn get_best_strategies(&self, limit: i64) -> Result<Vec<LtmStrategyRecord>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        match self.fetch_strategies(db, limit).await {
            Ok(strategies) => Ok(strategies),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "get_best_strategies failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_strategies(&self, db: &Database, limit: i64) -> Result<Vec<LtmStrategyRecord>> {
        let strategies = sqlx::query_as::<_, LtmStrategyRecord>(
            r"
            SELECT id, agent_id, name, description, avg_reward, times_used, success_rate, data,
                   updated_at
            FROM ltm_strategies
            WHERE agent_id = $1
            ORDER BY avg_reward DESC
            LIMIT $2
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(limit)
        .fetch_all(db.pool())
        .await
        .context("Failed to get best strategies")?;

        Ok(strategies)
    }

    /// Aggregated learning statistics (zeros when Postgres is unavailable
    /// or failing)
    pub async fn get_agent_learning_stats(&self) -> Result<LtmStats> {
        let Some(db) = &self.db else {
            return Ok(LtmStats::default());
        };

        match self.fetch_stats(db).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "get_agent_learning_stats failed: {e:#}");
                Ok(LtmStats::default())
            }
        }
    }

    async fn fetch_stats(&self, db: &Database) -> Result<LtmStats> {
        let mut stats = sqlx::query_as::<_, LtmStats>(
            r"
            SELECT
                COUNT(*) as total_experiences,
                COUNT(*) FILTER (WHERE q_value >= $2) as high_value_experiences,
                COALESCE(AVG(q_value), 0) as avg_q_value,
                COALESCE(AVG(reward), 0) as avg_reward,
                COALESCE(MAX(q_value), 0) as max_q_value,
                COALESCE(MIN(q_value), 0) as min_q_value,
                0::bigint as learned_patterns,
                0::bigint as active_strategies
            FROM ltm_experiences
            WHERE agent_id = $1
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(HIGH_VALUE_Q)
        .fetch_one(db.pool())
        .await
        .context("Failed to get learning stats")?;

        let (patterns,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ltm_patterns WHERE agent_id = $1")
                .bind(self.agent_id.as_str())
                .fetch_one(db.pool())
                .await
                .context("Failed to count patterns")?;
        let (strategies,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ltm_strategies WHERE agent_id = $1")
                .bind(self.agent_id.as_str())
                .fetch_one(db.pool())
                .await
                .context("Failed to count strategies")?;

        stats.learned_patterns = patterns;
        stats.active_strategies = strategies;
        Ok(stats)
    }

    /// Build the summary handed to central memory on synchronization
    pub async fn sync_summary(&self, best_limit: i64) -> Result<LtmSummary> {
        let stats = self.get_agent_learning_stats().await?;
        let best = self.get_best_experiences(best_limit).await?;

        let best_experiences = best
            .into_iter()
            .filter_map(|r| {
                ActionKind::from_str(&r.action).map(|action| BestExperience {
                    action,
                    reward: r.reward,
                    q_value: r.q_value,
                    state: r.state,
                })
            })
            .collect();

        Ok(LtmSummary {
            total_experiences: stats.total_experiences,
            high_value_experiences: stats.high_value_experiences,
            avg_q_value: stats.avg_q_value,
            avg_reward: stats.avg_reward,
            max_q_value: stats.max_q_value,
            min_q_value: stats.min_q_value,
            learned_patterns: stats.learned_patterns,
            active_strategies: stats.active_strategies,
            best_experiences,
            sync_timestamp: Utc::now(),
        })
    }

    /// Delete stale low-value experiences: older than `days` AND below the
    /// cleanup Q-value ceiling. Returns the number of rows removed, 0 when
    /// the backend is unavailable or failing.
    pub async fn cleanup_old_data(&self, days: i32) -> Result<u64> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        match self.delete_stale(db, days).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "cleanup_old_data failed: {e:#}");
                Ok(0)
            }
        }
    }

    async fn delete_stale(&self, db: &Database, days: i32) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM ltm_experiences
            WHERE agent_id = $1
              AND promoted_at < NOW() - make_interval(days => $2)
              AND q_value < $3
            ",
        )
        .bind(self.agent_id.as_str())
        .bind(days)
        .bind(CLEANUP_Q_CEILING)
        .execute(db.pool())
        .await
        .context("Failed to clean up old experiences")?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(agent_id = %self.agent_id, removed, "stale low-value experiences cleaned up");
        }
        Ok(removed)
    }
}
