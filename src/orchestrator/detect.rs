//! Detection Pass
//!
//! Evaluates a shipment's readings against its policy and persists each new
//! violation as an excursion plus its audit entry, then schedules follow-up jobs.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::event_bus::MonitorEvent;
use super::locks::ShipmentLocks;
use super::queue::{Job, TaskQueue};
use crate::audit::AuditEntry;
use crate::emit_event;
use crate::insight::NarrativeRequest;
use crate::model::{Excursion, Violation};
use crate::policy::evaluate;
use crate::store::Stores;

/// Two excursions of one shipment whose start times are this close are the
/// same event, whatever their kind.
pub const IDEMPOTENCY_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownShipment,
    MissingPolicy,
    InactivePolicy,
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub skipped: Option<SkipReason>,
    pub evaluated: usize,
    /// Ids of excursions persisted by this pass
    pub recorded: Vec<String>,
    pub duplicates: usize,
}

impl DetectionReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

pub struct DetectionOrchestrator {
    stores: Stores,
    queue: Arc<dyn TaskQueue>,
    locks: ShipmentLocks,
}

impl DetectionOrchestrator {
    pub fn new(stores: Stores, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            stores,
            queue,
            locks: ShipmentLocks::new(),
        }
    }

    /// Run one detection pass for a shipment.
    ///
    /// Missing shipments and missing or inactive policies are silent no-ops.
    /// Excursion and audit writes propagate their errors; the narrative job
    /// is best effort. A risk recompute is scheduled on every completed pass.
    pub async fn detect(&self, shipment_id: &str) -> Result<DetectionReport> {
        let _guard = self.locks.acquire(shipment_id).await;

        let Some(shipment) = self.stores.shipments.get_shipment(shipment_id).await? else {
            debug!(shipment_id, "Detection skipped: unknown shipment");
            return Ok(DetectionReport::skipped(SkipReason::UnknownShipment));
        };

        let policy = match self.stores.policies.get_policy(&shipment.policy_id).await? {
            Some(p) if p.active => p,
            Some(_) => {
                debug!(shipment_id, policy_id = %shipment.policy_id, "Detection skipped: policy inactive");
                return Ok(DetectionReport::skipped(SkipReason::InactivePolicy));
            }
            None => {
                debug!(shipment_id, policy_id = %shipment.policy_id, "Detection skipped: policy missing");
                return Ok(DetectionReport::skipped(SkipReason::MissingPolicy));
            }
        };

        let readings = self
            .stores
            .readings
            .readings_for(shipment_id)
            .await
            .context("Failed to load readings")?;
        let violations = evaluate(&readings, &policy.rules);

        let mut report = DetectionReport {
            evaluated: violations.len(),
            ..DetectionReport::default()
        };

        for violation in &violations {
            let existing = self
                .stores
                .excursions
                .find_in_window(
                    shipment_id,
                    violation.start_time - IDEMPOTENCY_WINDOW_MS,
                    violation.start_time + IDEMPOTENCY_WINDOW_MS,
                )
                .await?;
            if existing.is_some() {
                debug!(shipment_id, start_time = violation.start_time, "Violation already recorded");
                report.duplicates += 1;
                emit_event!(MonitorEvent::DuplicateSkipped {
                    shipment_id: shipment_id.to_string(),
                    start_time: violation.start_time,
                });
                continue;
            }

            let excursion = Excursion::from_violation(shipment_id, &policy.id, violation, Utc::now());
            self.stores
                .excursions
                .insert(&excursion)
                .await
                .context("Failed to persist excursion")?;

            let entry = AuditEntry::excursion_detected(&shipment, violation, excursion.detected_at);
            if let Err(e) = self.stores.audit.append(&entry).await {
                // An excursion without its audit entry would be skipped as a duplicate on retry.
                self.discard_unlogged(&excursion.id).await;
                return Err(e.context("Failed to append audit entry"));
            }

            info!(
                shipment_id,
                excursion_id = %excursion.id,
                rule = %violation.rule_violated,
                severity = violation.severity.as_str(),
                "Excursion recorded"
            );
            emit_event!(MonitorEvent::ExcursionDetected {
                shipment_id: shipment_id.to_string(),
                excursion_id: excursion.id.clone(),
                kind: violation.kind,
                severity: violation.severity,
            });

            self.schedule_narrative(&entry, violation).await;
            report.recorded.push(excursion.id);
        }

        self.queue
            .enqueue(&Job::RecomputeRisk {
                shipment_id: shipment_id.to_string(),
            })
            .await
            .context("Failed to schedule risk recompute")?;

        info!(
            shipment_id,
            evaluated = report.evaluated,
            recorded = report.recorded.len(),
            duplicates = report.duplicates,
            "Detection pass complete"
        );
        Ok(report)
    }

    async fn discard_unlogged(&self, excursion_id: &str) {
        match self.stores.excursions.discard(excursion_id).await {
            Ok(_) => warn!(excursion_id, "Excursion discarded after audit failure"),
            Err(e) => error!(excursion_id, error = %e, "Failed to discard unlogged excursion"),
        }
    }

    async fn schedule_narrative(&self, entry: &AuditEntry, violation: &Violation) {
        let job = Job::ExplainAuditEntry {
            audit_id: entry.id.clone(),
            request: NarrativeRequest::for_violation(violation),
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            warn!(audit_id = %entry.id, error = %e, "Failed to schedule narrative");
        }
    }

    /// Mark an excursion resolved and log it. Returns false if it was unknown
    /// or already resolved.
    pub async fn resolve_excursion(&self, excursion_id: &str) -> Result<bool> {
        let Some(excursion) = self.stores.excursions.get_excursion(excursion_id).await? else {
            return Ok(false);
        };
        let _guard = self.locks.acquire(&excursion.shipment_id).await;

        let at = Utc::now();
        if !self.stores.excursions.resolve(excursion_id, at).await? {
            return Ok(false);
        }

        match self.stores.shipments.get_shipment(&excursion.shipment_id).await? {
            Some(shipment) => {
                let entry = AuditEntry::excursion_resolved(&shipment, excursion_id, at);
                self.stores
                    .audit
                    .append(&entry)
                    .await
                    .context("Failed to append audit entry")?;
            }
            None => warn!(excursion_id, shipment_id = %excursion.shipment_id, "Resolved excursion of unknown shipment"),
        }

        info!(excursion_id, shipment_id = %excursion.shipment_id, "Excursion resolved");
        Ok(true)
    }
}
