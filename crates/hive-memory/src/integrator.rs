//! Per-agent integration: ties the RL engine and the three memory tiers
//! into one periodic flow of promotion, cleanup, sync and insight adoption.

use chrono::{DateTime, Utc};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use hive_core::{AgentProfile, MetricMap};
use hive_rl::{ActionKind, EngineStatus, RlEngine};

use crate::central::{AgentInsights, CentralMemory, GlobalInsight, LtmSummary};
use crate::config::IntegrationConfig;
use crate::ltm::Ltm;
use crate::stm::AgentStm;

/// What an applied insight asks the agent to do.
///
/// Intents are surfaced, not fed back into the Q-table: central knowledge
/// steers future behavior without overwriting locally learned values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InsightIntent {
    /// Favor an action that performs well across the collective
    EncourageAction {
        action: ActionKind,
        average_reward: f64,
    },
    /// Prefer a specific hour for an action
    PreferHour { action: ActionKind, hour: i32 },
}

/// Extension seam for acting on central insights
pub trait InsightApplicator: Send + Sync {
    /// Translate one insight into an intent, or ignore it
    fn apply_insight(&self, insight: &GlobalInsight) -> Option<InsightIntent>;
}

/// Default applicator: logs each insight and maps it to an intent
pub struct LoggingApplicator;

impl InsightApplicator for LoggingApplicator {
    fn apply_insight(&self, insight: &GlobalInsight) -> Option<InsightIntent> {
        let action = ActionKind::from_str(&insight.action_type)?;

        let intent = match insight.insight_type.as_str() {
            "action_performance" | "urgent_success" => InsightIntent::EncourageAction {
                action,
                average_reward: insight.average_reward,
            },
            "optimal_timing" => InsightIntent::PreferHour {
                action,
                hour: insight.optimal_hour?,
            },
            other => {
                debug!(insight_type = other, "ignoring unrecognized insight type");
                return None;
            }
        };

        info!(
            insight_type = %insight.insight_type,
            action = %insight.action_type,
            confidence = insight.confidence,
            "insight applied"
        );
        Some(intent)
    }
}

/// Outcome of one integration cycle.
///
/// A failed phase records its error and skips the remaining phases; the
/// results of completed phases are kept.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub agent_id: String,
    pub promoted: usize,
    pub cleaned: u64,
    pub synced: bool,
    /// The summary pushed to central memory, present once the sync phase ran
    pub summary: Option<LtmSummary>,
    pub insights_applied: usize,
    pub strategies_adopted: usize,
    pub intents: Vec<InsightIntent>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    fn empty(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            promoted: 0,
            cleaned: 0,
            synced: false,
            summary: None,
            insights_applied: 0,
            strategies_adopted: 0,
            intents: Vec::new(),
            error: None,
            completed_at: Utc::now(),
        }
    }
}

/// Availability and progress snapshot for one agent
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStatus {
    pub agent_id: String,
    pub stm_available: bool,
    pub ltm_available: bool,
    pub central_available: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub engine: EngineStatus,
}

/// Connects one agent's RL engine to its memory tiers
pub struct AgentMemoryIntegrator {
    profile: AgentProfile,
    engine: RlEngine,
    stm: AgentStm,
    ltm: Ltm,
    central: CentralMemory,
    config: IntegrationConfig,
    last_sync: Option<DateTime<Utc>>,
}

impl AgentMemoryIntegrator {
    /// Wire up the tiers and register the agent in central memory
    pub async fn new(
        profile: AgentProfile,
        engine: RlEngine,
        stm: AgentStm,
        ltm: Ltm,
        central: CentralMemory,
        config: IntegrationConfig,
    ) -> Result<Self> {
        central.register_agent(&profile).await?;

        Ok(Self {
            profile,
            engine,
            stm,
            ltm,
            central,
            config,
            last_sync: None,
        })
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn engine_mut(&mut self) -> &mut RlEngine {
        &mut self.engine
    }

    /// Feed outcome metrics through the engine and record the resulting
    /// experience in short-term memory.
    ///
    /// Returns the post-update Q-value from the engine. Exceptional rewards
    /// are broadcast as urgent insights; poor ones are flagged in the log.
    pub async fn record_outcome(&mut self, metrics_after: &MetricMap) -> Result<f64> {
        let updated_q = self.engine.process_feedback(metrics_after)?;

        let Some(experience) = self.engine.take_last_experience() else {
            return Ok(updated_q);
        };
        let reward = experience.reward;

        let record_id = self.stm.store_experience(&experience).await?;
        debug!(
            agent_id = %self.profile.agent_id,
            record_id = %record_id,
            reward,
            "outcome recorded in short-term memory"
        );

        if reward >= self.config.urgent_reward_threshold {
            self.central
                .broadcast_urgent_insight(&self.profile.agent_id, experience.action, reward)
                .await?;
        } else if reward <= self.config.poor_performance_threshold {
            warn!(
                agent_id = %self.profile.agent_id,
                action = %experience.action,
                reward,
                "poor outcome recorded"
            );
        }

        Ok(updated_q)
    }

    /// Run one integration cycle: promote, clean up, sync, apply insights,
    /// adopt strategies.
    pub async fn run_integration_cycle(
        &mut self,
        applicator: &dyn InsightApplicator,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::empty(self.profile.agent_id.as_str());

        // Promote high-value STM experiences into LTM
        match self.promote_experiences().await {
            Ok(promoted) => report.promoted = promoted,
            Err(e) => {
                report.error = Some(format!("promotion failed: {e:#}"));
                report.completed_at = Utc::now();
                return Ok(report);
            }
        }

        match self.ltm.cleanup_old_data(self.config.ltm_cleanup_days).await {
            Ok(cleaned) => report.cleaned = cleaned,
            Err(e) => {
                report.error = Some(format!("cleanup failed: {e:#}"));
                report.completed_at = Utc::now();
                return Ok(report);
            }
        }

        // Push the LTM summary up to central memory
        match self.sync_to_central().await {
            Ok(summary) => {
                report.synced = true;
                report.summary = Some(summary);
            }
            Err(e) => {
                report.error = Some(format!("sync failed: {e:#}"));
                report.completed_at = Utc::now();
                return Ok(report);
            }
        }

        // Pull relevant insights back down
        match self.central.get_insights_for_agent(&self.profile).await {
            Ok(insights) => {
                let (applied, intents) = self.apply_insights(&insights, applicator);
                report.insights_applied = applied;
                report.intents = intents;
            }
            Err(e) => {
                report.error = Some(format!("insight fetch failed: {e:#}"));
                report.completed_at = Utc::now();
                return Ok(report);
            }
        }

        match self.adopt_strategies().await {
            Ok(adopted) => report.strategies_adopted = adopted,
            Err(e) => {
                report.error = Some(format!("strategy adoption failed: {e:#}"));
                report.completed_at = Utc::now();
                return Ok(report);
            }
        }

        self.last_sync = Some(Utc::now());
        report.completed_at = Utc::now();

        info!(
            agent_id = %self.profile.agent_id,
            promoted = report.promoted,
            cleaned = report.cleaned,
            insights = report.insights_applied,
            strategies = report.strategies_adopted,
            "integration cycle completed"
        );
        Ok(report)
    }

    async fn promote_experiences(&mut self) -> Result<usize> {
        let candidates = self
            .stm
            .get_high_q_experiences(self.config.stm_to_ltm_threshold, 50)
            .await?;

        let mut promoted = 0;
        for record in candidates {
            if self
                .ltm
                .store_high_value_experience(&record.id, &record.experience)
                .await?
                .is_some()
            {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn sync_to_central(&mut self) -> Result<LtmSummary> {
        let summary = self.ltm.sync_summary(10).await?;
        self.central
            .synchronize_agent_knowledge(&self.profile.agent_id, &summary)
            .await?;
        Ok(summary)
    }

    fn apply_insights(
        &self,
        insights: &AgentInsights,
        applicator: &dyn InsightApplicator,
    ) -> (usize, Vec<InsightIntent>) {
        let mut intents = Vec::new();
        for insight in &insights.insights {
            if insight.confidence < self.config.insight_confidence_threshold {
                continue;
            }
            if let Some(intent) = applicator.apply_insight(insight) {
                intents.push(intent);
            }
        }
        (intents.len(), intents)
    }

    /// Adopt collective strategies that clear the success-rate bar by
    /// mirroring them into the agent's own strategy table
    async fn adopt_strategies(&mut self) -> Result<usize> {
        let insights = self.central.get_insights_for_agent(&self.profile).await?;

        let mut adopted = 0;
        for strategy in &insights.strategies {
            if strategy.success_rate < self.config.strategy_adoption_threshold {
                continue;
            }
            if strategy.adopted_by.contains(&self.profile.agent_id.as_str().to_string()) {
                continue;
            }

            self.ltm
                .update_strategy(
                    &strategy.name,
                    &strategy.description,
                    strategy.avg_reward,
                    strategy.success_rate >= 0.5,
                    serde_json::json!({ "source": "collective" }),
                )
                .await?;
            self.central
                .update_collective_strategy(
                    &self.profile.agent_id,
                    &strategy.name,
                    &strategy.description,
                    strategy.success_rate,
                    strategy.avg_reward,
                )
                .await?;
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Availability and progress snapshot
    pub fn get_integration_status(&self) -> IntegrationStatus {
        IntegrationStatus {
            agent_id: self.profile.agent_id.as_str().to_string(),
            stm_available: self.stm.is_available(),
            ltm_available: self.ltm.is_available(),
            central_available: self.central.is_available(),
            last_sync: self.last_sync,
            engine: self.engine.engine_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive_core::AgentId;

    fn insight(insight_type: &str, action_type: &str, confidence: f64, hour: Option<i32>) -> GlobalInsight {
        GlobalInsight {
            insight_type: insight_type.to_string(),
            action_type: action_type.to_string(),
            average_reward: 0.7,
            std_deviation: 0.1,
            sample_size: 5,
            confidence,
            optimal_hour: hour,
            contributing_agent: "scout".to_string(),
            applicable_agents: crate::central::Applicability::All,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_logging_applicator_maps_performance_insights() {
        let applicator = LoggingApplicator;
        let intent = applicator
            .apply_insight(&insight("action_performance", "title_optimization", 0.8, None))
            .unwrap();

        assert_eq!(
            intent,
            InsightIntent::EncourageAction {
                action: ActionKind::TitleOptimization,
                average_reward: 0.7,
            }
        );
    }

    #[test]
    fn test_logging_applicator_maps_timing_insights() {
        let applicator = LoggingApplicator;
        let intent = applicator
            .apply_insight(&insight("optimal_timing", "upload_time_optimization", 0.8, Some(20)))
            .unwrap();

        assert_eq!(
            intent,
            InsightIntent::PreferHour {
                action: ActionKind::UploadTimeOptimization,
                hour: 20,
            }
        );
    }

    #[test]
    fn test_logging_applicator_rejects_unknown_input() {
        let applicator = LoggingApplicator;
        assert!(applicator
            .apply_insight(&insight("action_performance", "not_an_action", 0.9, None))
            .is_none());
        assert!(applicator
            .apply_insight(&insight("mystery_type", "title_optimization", 0.9, None))
            .is_none());
        // timing insight without an hour carries nothing actionable
        assert!(applicator
            .apply_insight(&insight("optimal_timing", "title_optimization", 0.9, None))
            .is_none());
    }

    #[tokio::test]
    async fn test_degraded_cycle_reports_cleanly() {
        let profile = AgentProfile::new(AgentId::from("scout"), "seo", vec!["seo".to_string()]);
        let engine = RlEngine::new("scout");
        let stm = AgentStm::new(None, AgentId::from("scout"), 1000);
        let ltm = Ltm::new(None, AgentId::from("scout"));
        let central = CentralMemory::new(None);

        let mut integrator = AgentMemoryIntegrator::new(
            profile,
            engine,
            stm,
            ltm,
            central,
            IntegrationConfig::default(),
        )
        .await
        .unwrap();

        let report = integrator.run_integration_cycle(&LoggingApplicator).await.unwrap();
        assert!(report.error.is_none());
        assert_eq!(report.promoted, 0);
        assert!(report.synced);
        assert!(report.summary.is_some());
        assert!(report.intents.is_empty());

        let status = integrator.get_integration_status();
        assert!(!status.stm_available);
        assert!(!status.ltm_available);
        assert!(!status.central_available);
    }

    #[tokio::test]
    async fn test_record_outcome_without_episode_is_neutral() {
        let profile = AgentProfile::new(AgentId::from("scout"), "seo", vec![]);
        let mut integrator = AgentMemoryIntegrator::new(
            profile,
            RlEngine::new("scout"),
            AgentStm::new(None, AgentId::from("scout"), 1000),
            Ltm::new(None, AgentId::from("scout")),
            CentralMemory::new(None),
            IntegrationConfig::default(),
        )
        .await
        .unwrap();

        let updated_q = integrator.record_outcome(&MetricMap::new()).await.unwrap();
        assert_eq!(updated_q, 0.0);
    }
}
