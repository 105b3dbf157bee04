//! Audit Ledger
//!
//! Append-only compliance log. Entries are immutable once appended; the
//! only post-hoc write is the narrative annotation, which lives beside the
//! entry under its id rather than inside it.

pub mod export;

pub use export::export_csv;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::model::{Severity, Shipment, Violation};

pub const EXCURSION_CORRECTIVE_ACTION: &str = "Review and quarantine as per policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExcursionDetected,
    ExcursionResolved,
    DataIngestion,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ExcursionDetected => "excursion_detected",
            AuditEventType::ExcursionResolved => "excursion_resolved",
            AuditEventType::DataIngestion => "data_ingestion",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excursion_detected" => Ok(AuditEventType::ExcursionDetected),
            "excursion_resolved" => Ok(AuditEventType::ExcursionResolved),
            "data_ingestion" => Ok(AuditEventType::DataIngestion),
            other => Err(format!("unknown audit event type '{}'", other)),
        }
    }
}

/// Immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub shipment_id: Option<String>,
    pub facility_id: Option<String>,
    pub event_type: AuditEventType,
    pub rule_violated: Option<String>,
    pub severity: Option<Severity>,
    pub corrective_action: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn excursion_detected(shipment: &Shipment, violation: &Violation, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: at,
            shipment_id: Some(shipment.id.clone()),
            facility_id: shipment.facility_id.clone(),
            event_type: AuditEventType::ExcursionDetected,
            rule_violated: Some(violation.rule_violated.clone()),
            severity: Some(violation.severity),
            corrective_action: Some(EXCURSION_CORRECTIVE_ACTION.to_string()),
            details: serde_json::json!({
                "temperatureC": violation.temperature,
                "durationMinutes": violation.duration_minutes,
                "startTime": violation.start_time,
                "endTime": violation.end_time,
            }),
        }
    }

    pub fn excursion_resolved(shipment: &Shipment, excursion_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: at,
            shipment_id: Some(shipment.id.clone()),
            facility_id: shipment.facility_id.clone(),
            event_type: AuditEventType::ExcursionResolved,
            rule_violated: None,
            severity: None,
            corrective_action: None,
            details: serde_json::json!({ "excursionId": excursion_id }),
        }
    }

    pub fn data_ingestion(facility_id: Option<&str>, source: &str, records: usize, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: at,
            shipment_id: None,
            facility_id: facility_id.map(str::to_string),
            event_type: AuditEventType::DataIngestion,
            rule_violated: None,
            severity: None,
            corrective_action: None,
            details: serde_json::json!({ "source": source, "records": records }),
        }
    }
}

/// An entry joined with its narrative annotation, for reading back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub narrative: Option<String>,
}

#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Append one immutable entry.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Set the narrative of an appended entry. Errors on an unknown id.
    async fn annotate_narrative(&self, audit_id: &str, text: &str) -> Result<()>;

    async fn get(&self, audit_id: &str) -> Result<Option<AuditRecord>>;

    async fn narrative(&self, audit_id: &str) -> Result<Option<String>> {
        Ok(self.get(audit_id).await?.and_then(|r| r.narrative))
    }

    /// Entries with `from <= timestamp <= to`, oldest first.
    async fn list_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditRecord>>;

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<AuditRecord>>;
}
