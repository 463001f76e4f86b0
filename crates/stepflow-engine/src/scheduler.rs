use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::error::Result;
use stepflow_core::types::WorkflowId;
use stepflow_core::workflow::{Frequency, Schedule};

use crate::runtime::WorkflowEngine;

/// Upper bound on how long the scheduler sleeps before re-reading the store,
/// so newly saved schedules are picked up.
const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Last fire time per workflow. A workflow seen for the first time is
/// anchored at the scheduler's start, so nothing fires retroactively.
struct FireBook {
    started: DateTime<Utc>,
    anchors: HashMap<WorkflowId, DateTime<Utc>>,
}

impl FireBook {
    fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            anchors: HashMap::new(),
        }
    }

    fn next_fire(&self, workflow_id: &WorkflowId, schedule: &Schedule) -> Option<DateTime<Utc>> {
        let anchor = self
            .anchors
            .get(workflow_id)
            .copied()
            .unwrap_or(self.started);
        match schedule.next_fire(anchor) {
            Ok(next) => next,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Invalid schedule, skipping workflow");
                None
            }
        }
    }

    /// Workflows due at `now`. Each one is re-anchored at `now`, so missed
    /// slots collapse into a single run.
    fn take_due(
        &mut self,
        schedules: &[(WorkflowId, Schedule)],
        now: DateTime<Utc>,
    ) -> Vec<WorkflowId> {
        let mut due = Vec::new();
        for (id, schedule) in schedules {
            if let Some(next) = self.next_fire(id, schedule) {
                if next <= now {
                    self.anchors.insert(id.clone(), now);
                    due.push(id.clone());
                }
            }
        }
        due
    }

    /// Earliest upcoming fire time across all schedules.
    fn next_wake(&self, schedules: &[(WorkflowId, Schedule)]) -> Option<DateTime<Utc>> {
        schedules
            .iter()
            .filter_map(|(id, schedule)| self.next_fire(id, schedule))
            .min()
    }
}

/// Starts executions of workflows whose latest snapshot carries an interval
/// or cron schedule.
pub struct WorkflowScheduler {
    engine: Arc<WorkflowEngine>,
    cancel: CancellationToken,
}

impl WorkflowScheduler {
    pub fn new(engine: Arc<WorkflowEngine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Latest schedule of every saved workflow that is not manual.
    fn scheduled_workflows(&self) -> Result<Vec<(WorkflowId, Schedule)>> {
        let mut scheduled = Vec::new();
        for summary in self.engine.list_workflows()? {
            let snapshot = self.engine.load_latest(&summary.workflow_id)?;
            let schedule = snapshot.graph.metadata.schedule;
            if schedule.frequency != Frequency::Manual {
                scheduled.push((summary.workflow_id, schedule));
            }
        }
        Ok(scheduled)
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        let mut book = FireBook::new(Utc::now());
        info!("Workflow scheduler started");

        loop {
            let schedules = match self.scheduled_workflows() {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to read workflow schedules");
                    Vec::new()
                }
            };

            for workflow_id in book.take_due(&schedules, Utc::now()) {
                self.fire(&workflow_id).await;
            }

            let delay = book
                .next_wake(&schedules)
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .map_or(RESCAN_INTERVAL, |d| d.min(RESCAN_INTERVAL));
            debug!(
                scheduled = schedules.len(),
                delay_secs = delay.as_secs(),
                "Scheduler sleeping"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    info!("Workflow scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn fire(&self, workflow_id: &WorkflowId) {
        info!(workflow_id = %workflow_id, "Firing scheduled workflow");
        let input = serde_json::json!({
            "trigger": "schedule",
            "firedAt": Utc::now().to_rfc3339(),
        });
        match self.engine.execute(workflow_id, input).await {
            Ok(handle) => info!(
                workflow_id = %workflow_id,
                execution_id = %handle.id(),
                "Scheduled execution started"
            ),
            Err(e) => error!(workflow_id = %workflow_id, error = %e, "Scheduled execution failed to start"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stepflow_core::config::AppConfig;
    use stepflow_core::workflow::MetadataPatch;
    use stepflow_store::SqliteWorkflowStore;
    use stepflow_test_utils::{linear_workflow, ScriptedDirectory};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[test]
    fn interval_fires_once_per_period() {
        let id = WorkflowId::from("wf");
        let schedules = vec![(id.clone(), Schedule::interval(15))];
        let mut book = FireBook::new(at(9, 0));

        assert!(book.take_due(&schedules, at(9, 10)).is_empty());
        assert_eq!(book.next_wake(&schedules), Some(at(9, 15)));
        assert_eq!(book.take_due(&schedules, at(9, 15)), vec![id.clone()]);
        assert!(book.take_due(&schedules, at(9, 20)).is_empty());
        assert_eq!(book.next_wake(&schedules), Some(at(9, 30)));
    }

    #[test]
    fn missed_slots_collapse() {
        let id = WorkflowId::from("wf");
        let schedules = vec![(id.clone(), Schedule::interval(5))];
        let mut book = FireBook::new(at(9, 0));

        assert_eq!(book.take_due(&schedules, at(10, 0)), vec![id]);
        assert_eq!(book.next_wake(&schedules), Some(at(10, 5)));
    }

    #[test]
    fn cron_schedule_uses_expression() {
        let id = WorkflowId::from("wf");
        let schedules = vec![(id.clone(), Schedule::cron("0 30 9 * * *"))];
        let mut book = FireBook::new(at(9, 0));

        assert_eq!(book.next_wake(&schedules), Some(at(9, 30)));
        assert!(book.take_due(&schedules, at(9, 29)).is_empty());
        assert_eq!(book.take_due(&schedules, at(9, 30)), vec![id]);
    }

    #[test]
    fn invalid_schedule_never_fires() {
        let schedules = vec![(WorkflowId::from("wf"), Schedule::cron("not cron"))];
        let mut book = FireBook::new(at(9, 0));
        assert!(book.take_due(&schedules, at(12, 0)).is_empty());
        assert_eq!(book.next_wake(&schedules), None);
    }

    #[tokio::test]
    async fn only_scheduled_workflows_are_listed() {
        let store = Arc::new(SqliteWorkflowStore::in_memory().unwrap());
        let dir = Arc::new(ScriptedDirectory::new());
        let engine = Arc::new(WorkflowEngine::new(AppConfig::default(), store, dir));

        engine.save(&linear_workflow("manual")).unwrap();
        let mut nightly = linear_workflow("nightly");
        nightly.update_metadata(MetadataPatch {
            schedule: Some(Schedule::cron("0 0 2 * * *")),
            ..Default::default()
        });
        let saved = engine.save(&nightly).unwrap();

        let scheduler = WorkflowScheduler::new(engine, CancellationToken::new());
        let scheduled = scheduler.scheduled_workflows().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0, saved.workflow_id);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(SqliteWorkflowStore::in_memory().unwrap());
        let dir = Arc::new(ScriptedDirectory::new());
        let engine = Arc::new(WorkflowEngine::new(AppConfig::default(), store, dir));
        let cancel = CancellationToken::new();
        let scheduler = WorkflowScheduler::new(engine, cancel.clone());

        let task = tokio::spawn(async move { scheduler.run().await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
