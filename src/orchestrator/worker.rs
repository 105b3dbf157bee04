//! Job Worker
//!
//! Drains the task queue. A job that errors goes back to pending until it
//! has been attempted `max_attempts` times, then stays failed.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::detect::DetectionOrchestrator;
use super::event_bus::MonitorEvent;
use super::queue::{Job, Task, TaskQueue};
use crate::emit_event;
use crate::insight::{InsightGenerator, Narrative, NarrativeRequest};
use crate::risk::RiskRecomputer;
use crate::store::Stores;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<DetectionOrchestrator>,
    risk: RiskRecomputer,
    insight: Arc<dyn InsightGenerator>,
    stores: Stores,
    max_attempts: u32,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        stores: Stores,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<DetectionOrchestrator>,
        insight: Arc<dyn InsightGenerator>,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            risk: RiskRecomputer::new(stores.clone()),
            insight,
            stores,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process at most one task. Returns false when the queue was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(task) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        match self.execute(&task).await {
            Ok(()) => {
                self.queue.complete(&task.id).await?;
                debug!(task_id = %task.id, kind = %task.kind, "Task completed");
            }
            Err(e) => {
                let retry = task.attempts + 1 < self.max_attempts;
                let message = format!("{:#}", e);
                if retry {
                    warn!(task_id = %task.id, kind = %task.kind, attempt = task.attempts + 1, error = %message, "Task failed, will retry");
                } else {
                    error!(task_id = %task.id, kind = %task.kind, error = %message, "Task failed permanently");
                }
                self.queue.fail(&task.id, &message, retry).await?;
            }
        }
        Ok(true)
    }

    /// Process tasks until none are pending, including ones enqueued meanwhile.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let requeued = self.queue.requeue_running().await?;
        if requeued > 0 {
            info!(requeued, "Requeued tasks left running by a previous worker");
        }
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(error = %e, "Queue error"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    async fn execute(&self, task: &Task) -> Result<()> {
        match task.job()? {
            Job::DetectShipment { shipment_id } => {
                self.orchestrator.detect(&shipment_id).await?;
            }
            Job::RecomputeRisk { shipment_id } => {
                self.risk.recompute(&shipment_id).await?;
            }
            Job::ExplainAuditEntry { audit_id, request } => {
                self.attach_narrative(&audit_id, &request).await?;
            }
        }
        Ok(())
    }

    async fn attach_narrative(&self, audit_id: &str, request: &NarrativeRequest) -> Result<()> {
        match self.insight.explain(request).await {
            Narrative::Generated(text) => {
                self.stores.audit.annotate_narrative(audit_id, &text).await?;
                debug!(audit_id, "Narrative attached");
                emit_event!(MonitorEvent::NarrativeAttached {
                    audit_id: audit_id.to_string(),
                });
            }
            Narrative::Fallback(_) => {
                debug!(audit_id, "Narrative unavailable; leaving it empty");
            }
        }
        Ok(())
    }
}
