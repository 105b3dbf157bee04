//! In-process backend. Used by tests and single-node demos.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ExcursionStore, PolicyStore, ReadingStore, RiskScoreStore, ShipmentStore, StoreError};
use crate::audit::{AuditEntry, AuditLogger, AuditRecord};
use crate::model::{Excursion, Policy, Reading, RiskScore, Shipment};

#[derive(Default)]
struct Tables {
    shipments: HashMap<String, Shipment>,
    policies: HashMap<String, Policy>,
    readings: HashMap<String, Vec<Reading>>,
    excursions: Vec<Excursion>,
    risk_scores: HashMap<String, RiskScore>,
    audit_log: Vec<AuditEntry>,
    narratives: HashMap<String, String>,
}

impl Tables {
    fn record(&self, entry: &AuditEntry) -> AuditRecord {
        AuditRecord {
            entry: entry.clone(),
            narrative: self.narratives.get(&entry.id).cloned(),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShipmentStore for MemoryStore {
    async fn get_shipment(&self, shipment_id: &str) -> Result<Option<Shipment>> {
        Ok(self.tables.read().await.shipments.get(shipment_id).cloned())
    }

    async fn put_shipment(&self, shipment: &Shipment) -> Result<()> {
        self.tables.write().await.shipments.insert(shipment.id.clone(), shipment.clone());
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>> {
        Ok(self.tables.read().await.policies.get(policy_id).cloned())
    }

    async fn put_policy(&self, policy: &Policy) -> Result<()> {
        policy.rules.validate()?;
        self.tables.write().await.policies.insert(policy.id.clone(), policy.clone());
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn readings_for(&self, shipment_id: &str) -> Result<Vec<Reading>> {
        Ok(self.tables.read().await.readings.get(shipment_id).cloned().unwrap_or_default())
    }

    async fn append_readings(&self, shipment_id: &str, readings: &[Reading]) -> Result<()> {
        let mut tables = self.tables.write().await;
        let series = tables.readings.entry(shipment_id.to_string()).or_default();
        series.extend_from_slice(readings);
        series.sort_by_key(|r| r.timestamp);
        Ok(())
    }
}

#[async_trait]
impl ExcursionStore for MemoryStore {
    async fn find_in_window(&self, shipment_id: &str, from: i64, to: i64) -> Result<Option<Excursion>> {
        let tables = self.tables.read().await;
        Ok(tables
            .excursions
            .iter()
            .find(|e| e.shipment_id == shipment_id && e.start_time >= from && e.start_time <= to)
            .cloned())
    }

    async fn insert(&self, excursion: &Excursion) -> Result<()> {
        self.tables.write().await.excursions.push(excursion.clone());
        Ok(())
    }

    async fn discard(&self, excursion_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.excursions.len();
        tables.excursions.retain(|e| e.id != excursion_id);
        Ok(tables.excursions.len() < before)
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<Excursion>> {
        let tables = self.tables.read().await;
        Ok(tables
            .excursions
            .iter()
            .filter(|e| e.shipment_id == shipment_id)
            .cloned()
            .collect())
    }

    async fn get_excursion(&self, excursion_id: &str) -> Result<Option<Excursion>> {
        let tables = self.tables.read().await;
        Ok(tables.excursions.iter().find(|e| e.id == excursion_id).cloned())
    }

    async fn resolve(&self, excursion_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.excursions.iter_mut().find(|e| e.id == excursion_id) {
            Some(excursion) if excursion.resolved_at.is_none() => {
                excursion.resolved_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_open(&self, shipment_id: &str) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables
            .excursions
            .iter()
            .filter(|e| e.shipment_id == shipment_id && e.is_open())
            .count())
    }
}

#[async_trait]
impl RiskScoreStore for MemoryStore {
    async fn latest(&self, shipment_id: &str) -> Result<Option<RiskScore>> {
        Ok(self.tables.read().await.risk_scores.get(shipment_id).cloned())
    }

    async fn upsert(&self, score: &RiskScore) -> Result<()> {
        self.tables
            .write()
            .await
            .risk_scores
            .insert(score.shipment_id.clone(), score.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditLogger for MemoryStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.tables.write().await.audit_log.push(entry.clone());
        Ok(())
    }

    async fn annotate_narrative(&self, audit_id: &str, text: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.audit_log.iter().any(|e| e.id == audit_id) {
            return Err(StoreError::UnknownAuditEntry(audit_id.to_string()).into());
        }
        tables.narratives.insert(audit_id.to_string(), text.to_string());
        Ok(())
    }

    async fn get(&self, audit_id: &str) -> Result<Option<AuditRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audit_log
            .iter()
            .find(|e| e.id == audit_id)
            .map(|e| tables.record(e)))
    }

    async fn list_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .audit_log
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .map(|e| tables.record(e))
            .collect();
        records.sort_by_key(|r| r.entry.timestamp);
        Ok(records)
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<AuditRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audit_log
            .iter()
            .filter(|e| e.shipment_id.as_deref() == Some(shipment_id))
            .map(|e| tables.record(e))
            .collect())
    }
}
