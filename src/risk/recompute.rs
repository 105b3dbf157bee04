use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use super::scoring::score;
use crate::emit_event;
use crate::model::{PolicyType, RiskScore};
use crate::orchestrator::event_bus::MonitorEvent;
use crate::store::Stores;

/// Recomputes a shipment's risk row from scratch.
///
/// Always scores the complete excursion set, so redundant or reordered runs
/// converge on the same row. An existing `ai_summary` survives the overwrite.
pub struct RiskRecomputer {
    stores: Stores,
}

impl RiskRecomputer {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Returns the written row, or `None` if the shipment no longer exists.
    pub async fn recompute(&self, shipment_id: &str) -> Result<Option<RiskScore>> {
        let Some(shipment) = self.stores.shipments.get_shipment(shipment_id).await? else {
            debug!(shipment_id, "Risk recompute for unknown shipment ignored");
            return Ok(None);
        };

        // A deleted policy still leaves excursions to score; food is the lenient default.
        let policy_type = self
            .stores
            .policies
            .get_policy(&shipment.policy_id)
            .await?
            .map(|p| p.policy_type())
            .unwrap_or(PolicyType::Food);

        let excursions = self
            .stores
            .excursions
            .list_for_shipment(shipment_id)
            .await
            .context("Failed to load excursions for risk recompute")?;
        let assessment = score(&excursions, policy_type);

        let previous = self.stores.risk_scores.latest(shipment_id).await?;
        let mut row = RiskScore::from_assessment(shipment_id, assessment, Utc::now());
        row.ai_summary = previous.and_then(|p| p.ai_summary);

        self.stores
            .risk_scores
            .upsert(&row)
            .await
            .context("Failed to upsert risk score")?;

        info!(
            shipment_id,
            score = row.score.as_str(),
            score_value = row.score_value,
            excursions = excursions.len(),
            "Risk recomputed"
        );
        emit_event!(MonitorEvent::RiskRecomputed {
            shipment_id: shipment_id.to_string(),
            score: row.score,
            score_value: row.score_value,
        });

        Ok(Some(row))
    }
}
