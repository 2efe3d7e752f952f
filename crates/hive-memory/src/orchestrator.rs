//! Collective orchestration: runs every agent's integration cycle, then
//! the cross-agent phases that only make sense over the whole fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use hive_core::AgentId;

use crate::central::{CentralMemory, CrossAgentPattern, GlobalStats, LeaderboardEntry};
use crate::config::IntegrationConfig;
use crate::integrator::{AgentMemoryIntegrator, CycleReport, InsightApplicator, LoggingApplicator};

/// Fleet-wide aggregates computed from the cycle's per-agent summaries
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectiveMetrics {
    pub total_agents: usize,
    pub total_experiences: i64,
    pub total_high_value_experiences: i64,
    /// Mean of each agent's `(avg_q_value + avg_reward) / 2`
    pub collective_performance_score: f64,
    /// Share of collected experiences that are high value
    pub knowledge_quality_ratio: f64,
}

/// Health snapshot for the integration loop itself
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub all_agents_active: bool,
    /// Fully clean cycles over all cycles run so far
    pub integration_success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of one collective cycle.
///
/// `individual_results` holds only the agents whose cycle ran to a report;
/// agents whose task panicked are logged and dropped.
#[derive(Debug, Serialize)]
pub struct CollectiveReport {
    pub cycle: u64,
    pub individual_results: Vec<CycleReport>,
    pub patterns: Vec<CrossAgentPattern>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub stats: GlobalStats,
    pub metrics: CollectiveMetrics,
    pub health: SystemHealth,
    pub urgent_delivered: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Drives the whole collective: per-agent cycles in parallel, then pattern
/// detection, the leaderboard and urgent insight delivery.
pub struct CollectiveOrchestrator {
    central: CentralMemory,
    config: IntegrationConfig,
    integrators: HashMap<String, Arc<Mutex<AgentMemoryIntegrator>>>,
    applicator: Arc<dyn InsightApplicator>,
    cycles_completed: u64,
    cycles_clean: u64,
}

impl CollectiveOrchestrator {
    pub fn new(central: CentralMemory, config: IntegrationConfig) -> Self {
        Self {
            central,
            config,
            integrators: HashMap::new(),
            applicator: Arc::new(LoggingApplicator),
            cycles_completed: 0,
            cycles_clean: 0,
        }
    }

    /// Replace the insight applicator shared by all agents
    pub fn with_applicator(mut self, applicator: Arc<dyn InsightApplicator>) -> Self {
        self.applicator = applicator;
        self
    }

    /// Add an agent's integrator to the collective
    pub fn register_integrator(&mut self, integrator: AgentMemoryIntegrator) {
        let agent_id = integrator.profile().agent_id.as_str().to_string();
        info!(agent_id = %agent_id, "integrator registered with orchestrator");
        self.integrators
            .insert(agent_id, Arc::new(Mutex::new(integrator)));
    }

    pub fn agent_count(&self) -> usize {
        self.integrators.len()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Run one full collective cycle
    pub async fn run_collective_cycle(&mut self) -> Result<CollectiveReport> {
        let started_at = Utc::now();
        self.cycles_completed += 1;
        let cycle = self.cycles_completed;

        info!(cycle, agents = self.integrators.len(), "collective cycle starting");

        let mut handles = Vec::with_capacity(self.integrators.len());
        for (agent_id, integrator) in &self.integrators {
            let agent_id = agent_id.clone();
            let integrator = Arc::clone(integrator);
            let applicator = Arc::clone(&self.applicator);

            handles.push(tokio::spawn(async move {
                let mut guard = integrator.lock().await;
                (agent_id, guard.run_integration_cycle(applicator.as_ref()).await)
            }));
        }

        let mut individual_results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((_, Ok(report))) => {
                    if let Some(error) = &report.error {
                        warn!(agent_id = %report.agent_id, error, "agent cycle ended with an error");
                    }
                    individual_results.push(report);
                }
                Ok((agent_id, Err(e))) => {
                    warn!(agent_id = %agent_id, "agent cycle failed: {e:#}");
                }
                Err(e) => {
                    warn!("agent cycle task panicked: {e}");
                }
            }
        }

        let all_agents_active = individual_results.len() == self.integrators.len()
            && individual_results.iter().all(|r| r.error.is_none());
        if all_agents_active {
            self.cycles_clean += 1;
        }

        let patterns = self.central.detect_cross_agent_patterns().await?;
        let leaderboard = self.central.update_performance_leaderboard().await?;
        self.broadcast_top_performers(&leaderboard).await?;
        let urgent_delivered = self.deliver_urgent_insights().await?;
        let stats = self.central.get_global_statistics().await?;

        let report = CollectiveReport {
            cycle,
            metrics: collective_metrics(self.integrators.len(), &individual_results),
            health: SystemHealth {
                all_agents_active,
                integration_success_rate: self.cycles_clean as f64 / cycle.max(1) as f64,
                last_updated: Utc::now(),
            },
            individual_results,
            patterns,
            leaderboard,
            stats,
            urgent_delivered,
            started_at,
            completed_at: Utc::now(),
        };

        info!(
            cycle,
            agents_reported = report.individual_results.len(),
            patterns = report.patterns.len(),
            urgent_delivered,
            "collective cycle completed"
        );
        Ok(report)
    }

    /// Broadcast agents whose average reward clears the urgent threshold on
    /// the freshly ranked leaderboard
    async fn broadcast_top_performers(&self, leaderboard: &[LeaderboardEntry]) -> Result<()> {
        for entry in leaderboard {
            if entry.avg_reward >= self.config.urgent_reward_threshold {
                self.central
                    .broadcast_top_performer(&AgentId::new(entry.agent_id.clone()), entry.avg_reward)
                    .await?;
            }
        }
        Ok(())
    }

    /// Hand pending urgent insights to each agent via the shared applicator
    async fn deliver_urgent_insights(&self) -> Result<usize> {
        let mut delivered = 0;
        for agent_id in self.integrators.keys() {
            let urgent = self
                .central
                .get_urgent_insights(&AgentId::new(agent_id.clone()))
                .await?;
            for insight in &urgent {
                if self.applicator.apply_insight(insight).is_some() {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Run collective cycles on a fixed interval until shutdown is signaled
    pub async fn run_continuous(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = Duration::from_secs(self.config.sync_interval_minutes * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_minutes = self.config.sync_interval_minutes,
            "continuous integration started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_collective_cycle().await {
                        warn!("collective cycle failed: {e:#}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("continuous integration stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Aggregate the per-agent sync summaries carried by a cycle's reports
fn collective_metrics(total_agents: usize, reports: &[CycleReport]) -> CollectiveMetrics {
    let summaries: Vec<_> = reports.iter().filter_map(|r| r.summary.as_ref()).collect();

    let total_experiences: i64 = summaries.iter().map(|s| s.total_experiences).sum();
    let total_high_value: i64 = summaries.iter().map(|s| s.high_value_experiences).sum();
    let performance = if summaries.is_empty() {
        0.0
    } else {
        summaries
            .iter()
            .map(|s| (s.avg_q_value + s.avg_reward) / 2.0)
            .sum::<f64>()
            / summaries.len() as f64
    };

    CollectiveMetrics {
        total_agents,
        total_experiences,
        total_high_value_experiences: total_high_value,
        collective_performance_score: performance,
        knowledge_quality_ratio: total_high_value as f64 / total_experiences.max(1) as f64,
    }
}
