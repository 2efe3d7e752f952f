//! Tabular Q-learning over a discretized state space

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use hive_core::{AgentId, HiveError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::experience::Experience;
use crate::state::{Action, ActionKind, ActionParams, State};

/// Window for the rolling average reward
const REWARD_WINDOW: usize = 100;

/// Maps a continuous feature vector to discrete bins for Q-table hashing.
///
/// Discretization is lossy by design: nearby continuous states collapse to
/// the same bucket, which is what makes tabular learning tractable here.
pub trait StateDiscretizer: Send + Sync {
    fn discretize(&self, features: &[f64]) -> Vec<i64>;
}

/// Default discretizer: `bins` equal-width buckets per unit-normalized feature
#[derive(Debug, Clone, Copy)]
pub struct BinDiscretizer {
    pub bins: u32,
}

impl Default for BinDiscretizer {
    fn default() -> Self {
        Self { bins: 10 }
    }
}

impl StateDiscretizer for BinDiscretizer {
    fn discretize(&self, features: &[f64]) -> Vec<i64> {
        features
            .iter()
            .map(|f| (f * f64::from(self.bins)) as i64)
            .collect()
    }
}

/// Running learning statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningStats {
    pub total_actions: u64,
    pub successful_actions: u64,
    pub exploration_actions: u64,
    pub avg_reward: f64,
}

/// Learning progress report
#[derive(Debug, Clone, Serialize)]
pub struct LearningProgress {
    pub agent_id: AgentId,
    pub total_actions: u64,
    pub success_rate: f64,
    pub avg_reward: f64,
    pub exploration_rate: f64,
    pub q_table_size: usize,
    pub epsilon: f64,
    pub recent_episodes: usize,
}

/// Serializable model state for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub agent_id: AgentId,
    pub q_table: HashMap<String, HashMap<ActionKind, f64>>,
    pub stats: LearningStats,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub epsilon: f64,
    pub timestamp: DateTime<Utc>,
}

/// Tabular Q-learning agent.
///
/// The Q-table is exclusively owned by one agent instance; cross-agent
/// knowledge exchange happens only via Central Memory, never by sharing
/// the table.
pub struct QLearningAgent {
    agent_id: AgentId,
    learning_rate: f64,
    discount_factor: f64,
    epsilon: f64,
    q_table: HashMap<String, HashMap<ActionKind, f64>>,
    discretizer: Box<dyn StateDiscretizer>,
    episode_rewards: VecDeque<f64>,
    total_episodes: u64,
    stats: LearningStats,
}

impl QLearningAgent {
    pub fn new(
        agent_id: impl Into<AgentId>,
        learning_rate: f64,
        discount_factor: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            learning_rate,
            discount_factor,
            epsilon,
            q_table: HashMap::new(),
            discretizer: Box::new(BinDiscretizer::default()),
            episode_rewards: VecDeque::with_capacity(REWARD_WINDOW),
            total_episodes: 0,
            stats: LearningStats::default(),
        }
    }

    /// Create an agent with the standard hyperparameters
    /// (lr 0.1, discount 0.95, epsilon 0.1)
    pub fn with_defaults(agent_id: impl Into<AgentId>) -> Self {
        Self::new(agent_id, 0.1, 0.95, 0.1)
    }

    /// Replace the state discretizer (bucket width is configuration,
    /// not a hard-wired constant)
    pub fn with_discretizer(mut self, discretizer: Box<dyn StateDiscretizer>) -> Self {
        self.discretizer = discretizer;
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn q_table_size(&self) -> usize {
        self.q_table.len()
    }

    /// Hash a state into its discretized Q-table key.
    ///
    /// Deterministic and a pure function of the feature vector: states whose
    /// features fall in the same bins always collapse to the same hash.
    pub fn get_state_hash(&self, state: &State) -> String {
        let bins = self.discretizer.discretize(&state.to_features());
        let mut hasher = DefaultHasher::new();
        bins.hash(&mut hasher);
        hasher.finish().to_string()
    }

    /// Q-value for a state/action pair (0.0 for unvisited entries)
    pub fn get_q_value(&self, state_hash: &str, kind: ActionKind) -> f64 {
        self.q_table
            .get(state_hash)
            .and_then(|actions| actions.get(&kind))
            .copied()
            .unwrap_or(0.0)
    }

    /// Initialize all action kinds to 0.0 for a visited state hash, so
    /// action selection never encounters a missing key.
    fn ensure_state_entry(&mut self, state_hash: &str) {
        if !self.q_table.contains_key(state_hash) {
            self.q_table.insert(
                state_hash.to_string(),
                ActionKind::ALL.iter().map(|k| (*k, 0.0)).collect(),
            );
        }
    }

    /// Choose an action with an epsilon-greedy policy.
    ///
    /// Exploitation iterates kinds in `ActionKind::ALL` order and keeps the
    /// first maximum, so ties break deterministically toward earlier kinds.
    pub fn choose_action(&mut self, state: &State, force_exploration: bool) -> Action {
        let state_hash = self.get_state_hash(state);
        self.ensure_state_entry(&state_hash);

        let mut rng = rand::thread_rng();

        let kind = if force_exploration || rng.gen::<f64>() < self.epsilon {
            self.stats.exploration_actions += 1;
            *ActionKind::ALL
                .choose(&mut rng)
                .unwrap_or(&ActionKind::ContentStrategy)
        } else {
            let mut best = ActionKind::ALL[0];
            let mut best_q = self.get_q_value(&state_hash, best);
            for kind in &ActionKind::ALL[1..] {
                let q = self.get_q_value(&state_hash, *kind);
                if q > best_q {
                    best = *kind;
                    best_q = q;
                }
            }
            best
        };

        let confidence = self.get_q_value(&state_hash, kind).abs().min(1.0);
        let params = ActionParams::sample(kind, &mut rng);

        Action {
            kind,
            params,
            confidence,
        }
    }

    /// One-step Q-learning update:
    /// `Q += lr * (reward + discount * max(Q[next]) - Q)`.
    ///
    /// An empty or unknown `next_state_hash` treats `max_next_q` as 0. For a
    /// known next state the true maximum is used, which is negative once
    /// every action there has been penalized.
    pub fn update_q_value(
        &mut self,
        state_hash: &str,
        kind: ActionKind,
        reward: f64,
        next_state_hash: &str,
    ) {
        self.ensure_state_entry(state_hash);

        let max_next_q = self
            .q_table
            .get(next_state_hash)
            .and_then(|actions| actions.values().copied().reduce(f64::max))
            .unwrap_or(0.0);

        let current_q = self.get_q_value(state_hash, kind);
        let new_q = current_q
            + self.learning_rate * (reward + self.discount_factor * max_next_q - current_q);

        if let Some(actions) = self.q_table.get_mut(state_hash) {
            actions.insert(kind, new_q);
        }
    }

    /// Apply the TD update from a completed experience and return the
    /// post-update Q-value.
    pub fn learn_from_experience(&mut self, experience: &Experience) -> Result<f64> {
        if experience.state_hash.is_empty() {
            return Err(HiveError::Validation(
                "experience has an empty state_hash".to_string(),
            ));
        }
        if !experience.reward.is_finite() {
            return Err(HiveError::Validation(format!(
                "experience reward is not finite: {}",
                experience.reward
            )));
        }

        self.update_q_value(
            &experience.state_hash,
            experience.action,
            experience.reward,
            &experience.next_state_hash,
        );

        self.stats.total_actions += 1;
        if experience.reward > 0.0 {
            self.stats.successful_actions += 1;
        }

        if self.episode_rewards.len() == REWARD_WINDOW {
            self.episode_rewards.pop_front();
        }
        self.episode_rewards.push_back(experience.reward);
        self.total_episodes += 1;
        self.stats.avg_reward =
            self.episode_rewards.iter().sum::<f64>() / self.episode_rewards.len() as f64;

        Ok(self.get_q_value(&experience.state_hash, experience.action))
    }

    /// Current learning progress and statistics
    pub fn learning_progress(&self) -> LearningProgress {
        let total = self.stats.total_actions;
        let success_rate = if total > 0 {
            self.stats.successful_actions as f64 / total as f64
        } else {
            0.0
        };
        let exploration_rate = if total > 0 {
            self.stats.exploration_actions as f64 / total as f64
        } else {
            0.0
        };

        LearningProgress {
            agent_id: self.agent_id.clone(),
            total_actions: total,
            success_rate,
            avg_reward: self.stats.avg_reward,
            exploration_rate,
            q_table_size: self.q_table.len(),
            epsilon: self.epsilon,
            recent_episodes: self.episode_rewards.len(),
        }
    }

    /// Snapshot the model state for persistence
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            agent_id: self.agent_id.clone(),
            q_table: self.q_table.clone(),
            stats: self.stats.clone(),
            learning_rate: self.learning_rate,
            discount_factor: self.discount_factor,
            epsilon: self.epsilon,
            timestamp: Utc::now(),
        }
    }

    /// Restore a previously saved model state
    pub fn restore(&mut self, snapshot: ModelSnapshot) {
        self.q_table = snapshot.q_table;
        self.stats = snapshot.stats;
        self.learning_rate = snapshot.learning_rate;
        self.discount_factor = snapshot.discount_factor;
        self.epsilon = snapshot.epsilon;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChannelMetrics, TemporalContext, VideoMetrics};

    fn test_state(views: f64, hour: u32) -> State {
        State {
            video_metrics: VideoMetrics {
                views,
                likes: views / 50.0,
                comments: views / 500.0,
                watch_time_seconds: 1200.0,
                ctr: 0.05,
                engagement_rate: 0.02,
            },
            channel_metrics: ChannelMetrics {
                subscribers: 50_000.0,
                total_views: 2_000_000.0,
                avg_engagement_rate: 0.02,
            },
            temporal_context: TemporalContext {
                hour,
                day_of_week: 2,
                month: 6,
            },
            ..State::default()
        }
    }

    fn test_experience(state_hash: &str, action: ActionKind, reward: f64) -> Experience {
        Experience {
            state_hash: state_hash.to_string(),
            next_state_hash: String::new(),
            action,
            parameters: ActionParams::Generic,
            reward,
            q_value: 0.0,
            state: serde_json::Value::Null,
            metrics_before: Default::default(),
            metrics_after: Default::default(),
            time_elapsed_hours: 24.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_state_hash_deterministic() {
        let agent = QLearningAgent::with_defaults("auditor");
        let state = test_state(100_000.0, 14);
        assert_eq!(agent.get_state_hash(&state), agent.get_state_hash(&state));
    }

    #[test]
    fn test_state_hash_bucketing() {
        let agent = QLearningAgent::with_defaults("auditor");
        // 100_000 and 105_000 views both land in bin 1 of views/1M * 10
        let a = test_state(100_000.0, 14);
        let mut b = test_state(100_000.0, 14);
        b.video_metrics.views = 105_000.0;
        b.video_metrics.likes = a.video_metrics.likes;
        b.video_metrics.comments = a.video_metrics.comments;
        assert_eq!(agent.get_state_hash(&a), agent.get_state_hash(&b));

        // Crossing a bin boundary changes the hash
        let mut c = test_state(100_000.0, 14);
        c.video_metrics.views = 950_000.0;
        c.video_metrics.likes = a.video_metrics.likes;
        c.video_metrics.comments = a.video_metrics.comments;
        assert_ne!(agent.get_state_hash(&a), agent.get_state_hash(&c));
    }

    #[test]
    fn test_bin_discretizer_width() {
        let d = BinDiscretizer { bins: 10 };
        assert_eq!(d.discretize(&[0.0, 0.05, 0.15, 0.99, 1.0]), vec![0, 0, 1, 9, 10]);

        let coarse = BinDiscretizer { bins: 4 };
        assert_eq!(coarse.discretize(&[0.3, 0.6]), vec![1, 2]);
    }

    #[test]
    fn test_visited_state_initializes_all_kinds() {
        let mut agent = QLearningAgent::with_defaults("auditor");
        let state = test_state(100_000.0, 14);
        let _ = agent.choose_action(&state, false);

        let hash = agent.get_state_hash(&state);
        let entry = agent.q_table.get(&hash).expect("state entry should exist");
        assert_eq!(entry.len(), ActionKind::ALL.len());
        for kind in ActionKind::ALL {
            assert_eq!(entry[&kind], 0.0);
        }
    }

    #[test]
    fn test_forced_exploration_covers_all_kinds() {
        let mut agent = QLearningAgent::with_defaults("auditor");
        let state = test_state(100_000.0, 14);

        let mut counts: HashMap<ActionKind, u32> = HashMap::new();
        let samples = 1400;
        for _ in 0..samples {
            let action = agent.choose_action(&state, true);
            *counts.entry(action.kind).or_insert(0) += 1;
        }

        // Expected ~200 per kind; 5 sigma is roughly +/- 65
        for kind in ActionKind::ALL {
            let n = counts.get(&kind).copied().unwrap_or(0);
            assert!(
                (120..=290).contains(&n),
                "kind {kind} sampled {n} times out of {samples}, expected roughly uniform"
            );
        }
    }

    #[test]
    fn test_exploit_picks_highest_q() {
        let mut agent = QLearningAgent::new("auditor", 0.1, 0.95, 0.0);
        let state = test_state(100_000.0, 14);
        let hash = agent.get_state_hash(&state);
        agent.ensure_state_entry(&hash);
        agent
            .q_table
            .get_mut(&hash)
            .unwrap()
            .insert(ActionKind::ThumbnailOptimization, 0.9);

        for _ in 0..20 {
            let action = agent.choose_action(&state, false);
            assert_eq!(action.kind, ActionKind::ThumbnailOptimization);
            assert!((action.confidence - 0.9).abs() < 1e-12);
        }
    }

    #[test]
    fn test_exploit_tie_breaks_in_declaration_order() {
        // All zeros: first declared kind wins every tie
        let mut agent = QLearningAgent::new("auditor", 0.1, 0.95, 0.0);
        let state = test_state(100_000.0, 14);
        let action = agent.choose_action(&state, false);
        assert_eq!(action.kind, ActionKind::UploadTimeOptimization);
    }

    #[test]
    fn test_q_update_exact_arithmetic() {
        let mut agent = QLearningAgent::new("auditor", 0.1, 0.95, 0.1);
        agent.update_q_value("s1", ActionKind::TitleOptimization, 0.5, "");

        // old_q = 0, max_next = 0: new_q = 0 + 0.1*(0.5 + 0.95*0 - 0)
        let q1 = agent.get_q_value("s1", ActionKind::TitleOptimization);
        assert!((q1 - 0.05).abs() < 1e-9);

        // Known next state with a max Q of 0.05
        agent.update_q_value("s2", ActionKind::TitleOptimization, 0.3, "s1");
        let expected = 0.0 + 0.1 * (0.3 + 0.95 * 0.05 - 0.0);
        let q2 = agent.get_q_value("s2", ActionKind::TitleOptimization);
        assert!((q2 - expected).abs() < 1e-9);

        // Second update folds in the existing estimate
        agent.update_q_value("s1", ActionKind::TitleOptimization, 0.5, "");
        let expected = 0.05 + 0.1 * (0.5 - 0.05);
        let q3 = agent.get_q_value("s1", ActionKind::TitleOptimization);
        assert!((q3 - expected).abs() < 1e-9);
    }

    #[test]
    fn test_next_state_max_may_be_negative() {
        let mut agent = QLearningAgent::new("auditor", 0.1, 0.95, 0.1);

        // Penalize every action of the next state down to Q = -0.1
        for kind in ActionKind::ALL {
            agent.update_q_value("sprime", kind, -1.0, "");
            assert!((agent.get_q_value("sprime", kind) + 0.1).abs() < 1e-9);
        }

        // max(Q[sprime]) is -0.1, not 0: new_q = 0 + 0.1*(0 + 0.95*(-0.1) - 0)
        agent.update_q_value("s", ActionKind::TitleOptimization, 0.0, "sprime");
        let q = agent.get_q_value("s", ActionKind::TitleOptimization);
        assert!((q - (-0.0095)).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_next_state_treated_as_zero() {
        let mut agent = QLearningAgent::new("auditor", 0.1, 0.95, 0.1);
        agent.update_q_value("s1", ActionKind::TagOptimization, 1.0, "never_seen");
        let q = agent.get_q_value("s1", ActionKind::TagOptimization);
        assert!((q - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_learn_from_experience_updates_and_returns_q() {
        let mut agent = QLearningAgent::with_defaults("auditor");
        let exp = test_experience("s1", ActionKind::ContentStrategy, 0.8);

        let q = agent.learn_from_experience(&exp).unwrap();
        assert!((q - 0.08).abs() < 1e-9);
        assert_eq!(agent.stats.total_actions, 1);
        assert_eq!(agent.stats.successful_actions, 1);
        assert!((agent.stats.avg_reward - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_learn_from_experience_validation() {
        let mut agent = QLearningAgent::with_defaults("auditor");

        let empty_hash = test_experience("", ActionKind::ContentStrategy, 0.5);
        assert!(agent.learn_from_experience(&empty_hash).is_err());

        let nan_reward = test_experience("s1", ActionKind::ContentStrategy, f64::NAN);
        assert!(agent.learn_from_experience(&nan_reward).is_err());

        // A rejected experience must not create phantom Q-table entries
        assert_eq!(agent.q_table_size(), 0);
    }

    #[test]
    fn test_rolling_average_window() {
        let mut agent = QLearningAgent::with_defaults("auditor");

        for _ in 0..REWARD_WINDOW {
            agent
                .learn_from_experience(&test_experience("s1", ActionKind::TagOptimization, 0.0))
                .unwrap();
        }
        // 100 more with reward 1.0 should fully displace the zeros
        for _ in 0..REWARD_WINDOW {
            agent
                .learn_from_experience(&test_experience("s1", ActionKind::TagOptimization, 1.0))
                .unwrap();
        }

        assert!((agent.stats.avg_reward - 1.0).abs() < 1e-12);
        assert_eq!(agent.learning_progress().recent_episodes, REWARD_WINDOW);
    }

    #[test]
    fn test_learning_progress_rates() {
        let mut agent = QLearningAgent::with_defaults("auditor");
        agent
            .learn_from_experience(&test_experience("s1", ActionKind::TitleOptimization, 1.0))
            .unwrap();
        agent
            .learn_from_experience(&test_experience("s1", ActionKind::TitleOptimization, -0.5))
            .unwrap();

        let progress = agent.learning_progress();
        assert_eq!(progress.total_actions, 2);
        assert!((progress.success_rate - 0.5).abs() < 1e-12);
        assert_eq!(progress.q_table_size, 1);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut agent = QLearningAgent::with_defaults("auditor");
        agent
            .learn_from_experience(&test_experience("s1", ActionKind::ContentStrategy, 0.7))
            .unwrap();
        let snapshot = agent.snapshot();

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: ModelSnapshot = serde_json::from_str(&json).unwrap();

        let mut fresh = QLearningAgent::with_defaults("auditor");
        fresh.restore(parsed);
        assert_eq!(fresh.q_table_size(), 1);
        assert!(
            (fresh.get_q_value("s1", ActionKind::ContentStrategy)
                - agent.get_q_value("s1", ActionKind::ContentStrategy))
            .abs()
                < 1e-12
        );
    }
}
