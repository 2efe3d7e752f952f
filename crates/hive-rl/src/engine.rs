//! Episode-driven RL engine: observe, decide, learn from feedback

use chrono::{DateTime, Datelike, Timelike, Utc};
use hive_core::{AgentId, MetricMap, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::experience::Experience;
use crate::qlearning::{LearningProgress, ModelSnapshot, QLearningAgent};
use crate::reward::RewardCalculator;
use crate::state::{
    Action, AudienceContext, ChannelMetrics, ContentContext, State, TemporalContext, VideoMetrics,
};

/// Raw channel measurements fed into observation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelObservation {
    pub video_metrics: VideoMetrics,
    pub channel_metrics: ChannelMetrics,
}

/// Non-metric context accompanying an observation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextData {
    pub content_context: ContentContext,
    pub audience_context: AudienceContext,
}

/// Engine status summary
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub agent_id: AgentId,
    pub active_episode: bool,
    pub completed_episodes: u64,
    pub progress: LearningProgress,
    pub reward_weights: MetricMap,
}

/// An open decision awaiting outcome feedback
struct Episode {
    state: State,
    state_hash: String,
    action: Action,
    started_at: DateTime<Utc>,
    metrics_before: MetricMap,
}

/// Ties observation, action selection and feedback into one learning loop.
///
/// At most one episode is open at a time; a new decision before feedback
/// arrives discards the previous one.
pub struct RlEngine {
    agent_id: AgentId,
    q_agent: QLearningAgent,
    reward: RewardCalculator,
    current_episode: Option<Episode>,
    last_experience: Option<Experience>,
    completed_episodes: u64,
}

impl RlEngine {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        let agent_id = agent_id.into();
        Self {
            q_agent: QLearningAgent::with_defaults(agent_id.clone()),
            agent_id,
            reward: RewardCalculator::new(),
            current_episode: None,
            last_experience: None,
            completed_episodes: 0,
        }
    }

    pub fn with_q_agent(agent_id: impl Into<AgentId>, q_agent: QLearningAgent) -> Self {
        Self {
            agent_id: agent_id.into(),
            q_agent,
            reward: RewardCalculator::new(),
            current_episode: None,
            last_experience: None,
            completed_episodes: 0,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Build a state from raw observations, stamping the current time
    pub fn observe_environment(
        &self,
        observation: &ChannelObservation,
        context: &ContextData,
    ) -> State {
        let now = Utc::now();
        State {
            video_metrics: observation.video_metrics.clone(),
            channel_metrics: observation.channel_metrics.clone(),
            temporal_context: TemporalContext {
                hour: now.hour(),
                day_of_week: now.weekday().num_days_from_monday(),
                month: now.month(),
            },
            content_context: context.content_context.clone(),
            audience_context: context.audience_context.clone(),
        }
    }

    /// Choose an action for the given state and open an episode for it
    pub fn decide_action(&mut self, state: &State, exploration_mode: bool) -> Action {
        if self.current_episode.is_some() {
            debug!(agent_id = %self.agent_id, "discarding open episode without feedback");
        }

        let action = self.q_agent.choose_action(state, exploration_mode);
        let state_hash = self.q_agent.get_state_hash(state);

        debug!(
            agent_id = %self.agent_id,
            action = %action.kind,
            confidence = action.confidence,
            "action selected"
        );

        self.current_episode = Some(Episode {
            state: state.clone(),
            state_hash,
            action: action.clone(),
            started_at: Utc::now(),
            metrics_before: state.metric_snapshot(),
        });

        action
    }

    /// Close the open episode with outcome metrics and learn from it.
    ///
    /// Returns the post-update Q-value for the episode's state/action pair,
    /// or 0.0 when no episode is open. The resulting experience carries the
    /// reward and is kept for the caller to persist; retrieve it with
    /// [`take_last_experience`](Self::take_last_experience).
    pub fn process_feedback(&mut self, metrics_after: &MetricMap) -> Result<f64> {
        let Some(episode) = self.current_episode.take() else {
            debug!(agent_id = %self.agent_id, "feedback received with no open episode");
            return Ok(0.0);
        };

        let elapsed_hours = (Utc::now() - episode.started_at).num_seconds() as f64 / 3600.0;
        let base_reward =
            self.reward
                .calculate_reward(&episode.metrics_before, metrics_after, elapsed_hours)?;
        let bonus = self.reward.calculate_engagement_bonus(metrics_after);
        let total_reward = base_reward + bonus;

        let mut experience = Experience {
            state_hash: episode.state_hash,
            next_state_hash: String::new(),
            action: episode.action.kind,
            parameters: episode.action.params,
            reward: total_reward,
            q_value: 0.0,
            state: serde_json::to_value(&episode.state)?,
            metrics_before: episode.metrics_before,
            metrics_after: metrics_after.clone(),
            time_elapsed_hours: elapsed_hours,
            timestamp: Utc::now(),
        };

        experience.q_value = self.q_agent.learn_from_experience(&experience)?;
        self.completed_episodes += 1;

        info!(
            agent_id = %self.agent_id,
            action = %experience.action,
            reward = total_reward,
            q_value = experience.q_value,
            "episode completed"
        );

        let updated_q = experience.q_value;
        self.last_experience = Some(experience);
        Ok(updated_q)
    }

    /// Take the experience produced by the most recent feedback, if any
    pub fn take_last_experience(&mut self) -> Option<Experience> {
        self.last_experience.take()
    }

    pub fn learning_progress(&self) -> LearningProgress {
        self.q_agent.learning_progress()
    }

    pub fn engine_status(&self) -> EngineStatus {
        let reward_weights = self
            .reward
            .weights()
            .iter()
            .map(|(name, weight)| ((*name).to_string(), *weight))
            .collect();

        EngineStatus {
            agent_id: self.agent_id.clone(),
            active_episode: self.current_episode.is_some(),
            completed_episodes: self.completed_episodes,
            progress: self.q_agent.learning_progress(),
            reward_weights,
        }
    }

    /// Snapshot the underlying model for persistence
    pub fn snapshot(&self) -> ModelSnapshot {
        self.q_agent.snapshot()
    }

    /// Restore the underlying model from a snapshot
    pub fn restore(&mut self, snapshot: ModelSnapshot) {
        self.q_agent.restore(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(views: f64) -> ChannelObservation {
        ChannelObservation {
            video_metrics: VideoMetrics {
                views,
                likes: views / 50.0,
                comments: views / 500.0,
                watch_time_seconds: 900.0,
                ctr: 0.04,
                engagement_rate: 0.015,
            },
            channel_metrics: ChannelMetrics {
                subscribers: 25_000.0,
                total_views: 1_500_000.0,
                avg_engagement_rate: 0.015,
            },
        }
    }

    #[test]
    fn test_observe_stamps_temporal_context() {
        let engine = RlEngine::new("publisher");
        let state = engine.observe_environment(&observation(10_000.0), &ContextData::default());

        assert!(state.temporal_context.hour < 24);
        assert!(state.temporal_context.day_of_week < 7);
        assert!((1..=12).contains(&state.temporal_context.month));
        assert!((state.video_metrics.views - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_feedback_without_episode_is_neutral() {
        let mut engine = RlEngine::new("publisher");
        let updated_q = engine.process_feedback(&MetricMap::new()).unwrap();
        assert_eq!(updated_q, 0.0);
        assert!(engine.take_last_experience().is_none());
    }

    #[test]
    fn test_decide_opens_episode_and_feedback_closes_it() {
        let mut engine = RlEngine::new("publisher");
        let state = engine.observe_environment(&observation(10_000.0), &ContextData::default());

        engine.decide_action(&state, true);
        assert!(engine.engine_status().active_episode);

        let mut after = state.metric_snapshot();
        after.insert("views".to_string(), 13_000.0);
        after.insert("likes".to_string(), 260.0);

        let updated_q = engine.process_feedback(&after).unwrap();
        assert!(updated_q > 0.0, "improved metrics should raise the Q estimate");

        let status = engine.engine_status();
        assert!(!status.active_episode);
        assert_eq!(status.completed_episodes, 1);
        assert_eq!(status.reward_weights.len(), 6);

        let exp = engine.take_last_experience().expect("experience recorded");
        assert!(exp.reward > 0.0, "improved metrics should yield a positive reward");
        // the returned value is the post-update Q, not the reward:
        // first visit, empty next state: q = lr * reward
        assert!((updated_q - exp.q_value).abs() < 1e-12);
        assert!((updated_q - 0.1 * exp.reward).abs() < 1e-9);
        assert!(!exp.state_hash.is_empty());
        assert!(exp.next_state_hash.is_empty());
        // taking it again yields nothing
        assert!(engine.take_last_experience().is_none());
    }

    #[test]
    fn test_new_decision_replaces_open_episode() {
        let mut engine = RlEngine::new("publisher");
        let state = engine.observe_environment(&observation(10_000.0), &ContextData::default());

        engine.decide_action(&state, true);
        engine.decide_action(&state, true);

        let status = engine.engine_status();
        assert!(status.active_episode);
        assert_eq!(status.completed_episodes, 0);
    }

    #[test]
    fn test_engagement_bonus_included_in_reward() {
        let mut engine = RlEngine::new("publisher");
        let state = engine.observe_environment(&observation(10_000.0), &ContextData::default());
        engine.decide_action(&state, true);

        // Unchanged metrics except a high engagement rate: reward is the
        // 0.2 bonus alone
        let mut after = state.metric_snapshot();
        after.insert("engagement_rate".to_string(), 0.06);

        engine.process_feedback(&after).unwrap();
        let exp = engine.take_last_experience().expect("experience recorded");
        assert!(exp.reward >= 0.2 - 1e-9);
    }
}
