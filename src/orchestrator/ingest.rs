//! Ingestion trigger: stores normalized readings and queues one detection
//! per affected shipment. Parsing uploads is the caller's job.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::event_bus::MonitorEvent;
use super::queue::{Job, TaskQueue};
use crate::audit::AuditEntry;
use crate::emit_event;
use crate::model::{Reading, Shipment};
use crate::store::Stores;

/// One normalized row of an ingestion batch.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRow {
    pub shipment_id: String,
    pub reading: Reading,
}

/// Where new shipments in a batch are filed.
#[derive(Debug, Clone)]
pub struct IngestTarget {
    pub facility_id: Option<String>,
    pub policy_id: String,
    pub product_type: String,
    /// Free-form origin label recorded in the audit entry (e.g. "csv", "api")
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub records: usize,
    pub shipments: Vec<String>,
    pub created_shipments: usize,
    pub audit_id: Option<String>,
}

pub struct Ingestor {
    stores: Stores,
    queue: Arc<dyn TaskQueue>,
}

impl Ingestor {
    pub fn new(stores: Stores, queue: Arc<dyn TaskQueue>) -> Self {
        Self { stores, queue }
    }

    pub async fn ingest(&self, target: &IngestTarget, rows: Vec<IngestRow>) -> Result<IngestSummary> {
        if rows.is_empty() {
            return Ok(IngestSummary::default());
        }

        let records = rows.len();
        let mut by_shipment: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
        for row in rows {
            by_shipment.entry(row.shipment_id).or_default().push(row.reading);
        }

        let mut summary = IngestSummary {
            records,
            ..IngestSummary::default()
        };

        for (shipment_id, readings) in &by_shipment {
            if self.stores.shipments.get_shipment(shipment_id).await?.is_none() {
                self.stores
                    .shipments
                    .put_shipment(&Shipment {
                        id: shipment_id.clone(),
                        facility_id: target.facility_id.clone(),
                        product_type: target.product_type.clone(),
                        policy_id: target.policy_id.clone(),
                    })
                    .await
                    .with_context(|| format!("Failed to create shipment {}", shipment_id))?;
                summary.created_shipments += 1;
            }

            self.stores
                .readings
                .append_readings(shipment_id, readings)
                .await
                .with_context(|| format!("Failed to store readings for {}", shipment_id))?;
            emit_event!(MonitorEvent::ReadingsIngested {
                shipment_id: shipment_id.clone(),
                count: readings.len(),
            });
        }

        let entry = AuditEntry::data_ingestion(target.facility_id.as_deref(), &target.source, records, Utc::now());
        self.stores
            .audit
            .append(&entry)
            .await
            .context("Failed to append ingestion audit entry")?;
        summary.audit_id = Some(entry.id);

        for shipment_id in by_shipment.into_keys() {
            self.queue
                .enqueue(&Job::DetectShipment {
                    shipment_id: shipment_id.clone(),
                })
                .await
                .context("Failed to schedule detection")?;
            summary.shipments.push(shipment_id);
        }

        info!(
            records = summary.records,
            shipments = summary.shipments.len(),
            created = summary.created_shipments,
            source = %target.source,
            "Readings ingested"
        );
        Ok(summary)
    }
}
