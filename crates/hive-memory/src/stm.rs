//! Short-term memory: recent experiences in Redis with a TTL.
//!
//! Every public operation degrades to a neutral result when Redis is
//! unreachable; the learning loop keeps running without recall.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hive_core::AgentId;
use hive_rl::{ActionKind, Experience};

use crate::config::RedisConfig;

/// Sentinel id returned by writes when Redis is down
pub const CONNECTION_FAILED: &str = "connection_failed";

/// TTL floor applied when an entry's Q-value is refreshed
const UPDATE_TTL_FLOOR_SECONDS: i64 = 3600;

/// Q-value at which an entry counts as high-value in the stats sample
const HIGH_Q_STAT_THRESHOLD: f64 = 0.7;

/// Redis client with connection pool
pub struct RedisClient {
    pool: Pool,
    config: RedisConfig,
}

impl RedisClient {
    /// Create a new Redis client with connection pool
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| anyhow::anyhow!("Failed to create pool builder: {e}"))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .context("Failed to create Redis connection pool")?;

        // Test connection
        let mut conn = pool.get().await.context("Failed to get Redis connection")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;

        info!("Redis connection established (pool size: {})", config.pool_size);

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    /// Get a connection from the pool
    pub async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .context("Failed to get Redis connection from pool")
    }

    /// Default TTL for short-term memory entries
    pub fn stm_ttl_seconds(&self) -> u64 {
        self.config.stm_ttl_seconds
    }
}

/// A short-term memory entry wrapping one experience
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmRecord {
    pub id: String,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub q_value: f64,
    pub reward: f64,
    pub action: ActionKind,
    pub experience: Experience,
}

/// Short-term memory statistics
#[derive(Debug, Clone, Serialize)]
pub struct StmStats {
    pub agent_id: AgentId,
    pub total_experiences: u64,
    pub avg_q_value: f64,
    pub avg_reward: f64,
    pub max_q_value: f64,
    pub high_q_experiences: u64,
    pub last_action_at: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
    pub available: bool,
}

impl StmStats {
    fn unavailable(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            total_experiences: 0,
            avg_q_value: 0.0,
            avg_reward: 0.0,
            max_q_value: 0.0,
            high_q_experiences: 0,
            last_action_at: None,
            ttl_seconds: 0,
            available: false,
        }
    }
}

/// Per-agent short-term memory on Redis.
///
/// Entries live under `hive:agent:{id}:stm:exp:{record_id}` with a recency
/// list at `hive:agent:{id}:stm:list`. Expired entries fall out of Redis on
/// their own; the list may briefly reference them, so readers skip misses.
pub struct AgentStm {
    client: Option<Arc<RedisClient>>,
    agent_id: AgentId,
    max_entries: usize,
}

impl AgentStm {
    pub fn new(client: Option<Arc<RedisClient>>, agent_id: AgentId, max_entries: usize) -> Self {
        if client.is_none() {
            warn!(agent_id = %agent_id, "short-term memory running without Redis");
        }
        Self {
            client,
            agent_id,
            max_entries,
        }
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    fn exp_key(&self, record_id: &str) -> String {
        format!("hive:agent:{}:stm:exp:{}", self.agent_id, record_id)
    }

    fn list_key(&self) -> String {
        format!("hive:agent:{}:stm:list", self.agent_id)
    }

    fn new_record_id(experience: &Experience) -> String {
        let mut hasher = DefaultHasher::new();
        experience.state_hash.hash(&mut hasher);
        experience.timestamp.timestamp_nanos_opt().hash(&mut hasher);
        format!("{}_{}", Utc::now().timestamp_millis(), hasher.finish() % 10_000)
    }

    /// Store an experience, returning its record id.
    ///
    /// Returns the sentinel `connection_failed` when Redis is unavailable
    /// or the write fails mid-session.
    pub async fn store_experience(&self, experience: &Experience) -> Result<String> {
        let Some(client) = &self.client else {
            warn!(agent_id = %self.agent_id, "store_experience skipped, Redis unavailable");
            return Ok(CONNECTION_FAILED.to_string());
        };

        match self.write_experience(client, experience).await {
            Ok(record_id) => Ok(record_id),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "store_experience failed: {e:#}");
                Ok(CONNECTION_FAILED.to_string())
            }
        }
    }

    async fn write_experience(
        &self,
        client: &RedisClient,
        experience: &Experience,
    ) -> Result<String> {
        let record_id = Self::new_record_id(experience);
        let record = StmRecord {
            id: record_id.clone(),
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            updated_at: None,
            q_value: experience.q_value,
            reward: experience.reward,
            action: experience.action,
            experience: experience.clone(),
        };

        let json = serde_json::to_string(&record)?;
        let ttl = client.stm_ttl_seconds();
        let mut conn = client.get_conn().await?;

        conn.set_ex::<_, _, ()>(self.exp_key(&record_id), &json, ttl)
            .await
            .context("Failed to store experience")?;
        conn.lpush::<_, _, ()>(self.list_key(), &record_id)
            .await
            .context("Failed to index experience")?;
        conn.ltrim::<_, ()>(self.list_key(), 0, self.max_entries as isize - 1)
            .await?;
        conn.expire::<_, ()>(self.list_key(), ttl as i64).await?;

        debug!(
            agent_id = %self.agent_id,
            record_id = %record_id,
            q_value = record.q_value,
            "experience stored in short-term memory"
        );
        Ok(record_id)
    }

    /// Most recent experiences, newest first.
    ///
    /// Entries that expired or fail to parse are skipped; a failing backend
    /// yields an empty result.
    pub async fn get_recent_experiences(&self, limit: usize) -> Result<Vec<StmRecord>> {
        let Some(client) = &self.client else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        match self.read_recent(client, limit).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "get_recent_experiences failed: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    async fn read_recent(&self, client: &RedisClient, limit: usize) -> Result<Vec<StmRecord>> {
        let mut conn = client.get_conn().await?;
        let ids: Vec<String> = conn
            .lrange(self.list_key(), 0, limit as isize - 1)
            .await
            .context("Failed to read experience index")?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let json: Option<String> = conn.get(self.exp_key(&id)).await?;
            let Some(json) = json else {
                // Expired between the index read and the fetch
                continue;
            };
            match serde_json::from_str::<StmRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(agent_id = %self.agent_id, record_id = %id, "skipping unparsable record: {e}");
                }
            }
        }

        Ok(records)
    }

    /// Experiences with a Q-value at or above `min_q`, best first.
    ///
    /// Scans a window of `2 * limit` recent entries so a run of low-value
    /// records does not hide older high-value ones entirely.
    pub async fn get_high_q_experiences(&self, min_q: f64, limit: usize) -> Result<Vec<StmRecord>> {
        let recent = self.get_recent_experiences(limit * 2).await?;
        Ok(filter_high_q(recent, min_q, limit))
    }

    /// Update the Q-value of a stored record in place.
    ///
    /// Returns false when the record no longer exists or the backend fails.
    /// The remaining TTL is preserved but floored at one hour so an imminent
    /// expiry does not swallow a fresh update.
    pub async fn update_q_value(&self, record_id: &str, q_value: f64) -> Result<bool> {
        let Some(client) = &self.client else {
            return Ok(false);
        };

        match self.rewrite_q_value(client, record_id, q_value).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                warn!(agent_id = %self.agent_id, record_id, "update_q_value failed: {e:#}");
                Ok(false)
            }
        }
    }

    async fn rewrite_q_value(
        &self,
        client: &RedisClient,
        record_id: &str,
        q_value: f64,
    ) -> Result<bool> {
        let key = self.exp_key(record_id);
        let mut conn = client.get_conn().await?;

        let json: Option<String> = conn.get(&key).await?;
        let Some(json) = json else {
            return Ok(false);
        };

        let mut record: StmRecord = serde_json::from_str(&json)?;
        record.q_value = q_value;
        record.experience.q_value = q_value;
        record.updated_at = Some(Utc::now());

        let remaining: i64 = conn.ttl(&key).await?;
        let ttl = remaining.max(UPDATE_TTL_FLOOR_SECONDS);

        let updated = serde_json::to_string(&record)?;
        conn.set_ex::<_, _, ()>(&key, &updated, ttl as u64)
            .await
            .context("Failed to update experience")?;

        debug!(agent_id = %self.agent_id, record_id, q_value, "Q-value updated in short-term memory");
        Ok(true)
    }

    /// Short-term memory statistics, sampled from up to 100 recent entries.
    ///
    /// `available` is false when Redis is missing or failing; the remaining
    /// fields are then neutral.
    pub async fn stats(&self) -> Result<StmStats> {
        let Some(client) = &self.client else {
            return Ok(StmStats::unavailable(self.agent_id.clone()));
        };

        match self.sample_stats(client).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "stats failed: {e:#}");
                Ok(StmStats::unavailable(self.agent_id.clone()))
            }
        }
    }

    async fn sample_stats(&self, client: &RedisClient) -> Result<StmStats> {
        let mut conn = client.get_conn().await?;
        let total: i64 = conn.llen(self.list_key()).await?;
        drop(conn);

        let recent = self.get_recent_experiences(100).await?;
        let (avg_q, max_q, avg_reward, high_q, last_action_at) = if recent.is_empty() {
            (0.0, 0.0, 0.0, 0, None)
        } else {
            let n = recent.len() as f64;
            let sum_q: f64 = recent.iter().map(|r| r.q_value).sum();
            let sum_r: f64 = recent.iter().map(|r| r.reward).sum();
            let max = recent.iter().map(|r| r.q_value).fold(f64::MIN, f64::max);
            let high_q = recent.iter().filter(|r| r.q_value >= HIGH_Q_STAT_THRESHOLD).count();
            // Records come back newest first
            (sum_q / n, max, sum_r / n, high_q as u64, Some(recent[0].timestamp))
        };

        Ok(StmStats {
            agent_id: self.agent_id.clone(),
            total_experiences: total.max(0) as u64,
            avg_q_value: avg_q,
            avg_reward,
            max_q_value: max_q,
            high_q_experiences: high_q,
            last_action_at,
            ttl_seconds: client.stm_ttl_seconds(),
            available: true,
        })
    }

    /// Delete all short-term memory for this agent, returning the number of
    /// keys removed (0 when the backend is missing or failing)
    pub async fn clear(&self) -> Result<u64> {
        let Some(client) = &self.client else {
            return Ok(0);
        };

        match self.delete_all(client).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                warn!(agent_id = %self.agent_id, "clear failed: {e:#}");
                Ok(0)
            }
        }
    }

    async fn delete_all(&self, client: &RedisClient) -> Result<u64> {
        let pattern = format!("hive:agent:{}:stm:*", self.agent_id);
        let mut conn = client.get_conn().await?;

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await?;

        if keys.is_empty() {
            return Ok(0);
        }

        let removed: i64 = conn.del(&keys).await?;
        info!(agent_id = %self.agent_id, removed, "short-term memory cleared");
        Ok(removed.max(0) as u64)
    }
}

/// Filter a batch of records down to those at or above `min_q`, ordered
/// best first and truncated to `limit`
fn filter_high_q(mut records: Vec<StmRecord>, min_q: f64, limit: usize) -> Vec<StmRecord> {
    records.retain(|r| r.q_value >= min_q);
    records.sort_by(|a, b| b.q_value.total_cmp(&a.q_value));
    records.truncate(limit);
    records
}
