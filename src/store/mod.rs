//! Storage Collaborators
//!
//! Logical contracts for everything the detection core reads and writes,
//! plus two backends: an in-memory one and SQLite.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::audit::AuditLogger;
use crate::model::{Excursion, Policy, Reading, RiskScore, Shipment};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("audit entry {0} does not exist")]
    UnknownAuditEntry(String),

    #[error("corrupt value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

#[async_trait]
pub trait ShipmentStore: Send + Sync {
    async fn get_shipment(&self, shipment_id: &str) -> Result<Option<Shipment>>;
    async fn put_shipment(&self, shipment: &Shipment) -> Result<()>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>>;
    async fn put_policy(&self, policy: &Policy) -> Result<()>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// All readings of a shipment, timestamp ascending.
    async fn readings_for(&self, shipment_id: &str) -> Result<Vec<Reading>>;
    async fn append_readings(&self, shipment_id: &str, readings: &[Reading]) -> Result<()>;
}

#[async_trait]
pub trait ExcursionStore: Send + Sync {
    /// Any excursion of the shipment, whatever its kind, with `from <= start_time <= to`.
    async fn find_in_window(&self, shipment_id: &str, from: i64, to: i64) -> Result<Option<Excursion>>;
    async fn insert(&self, excursion: &Excursion) -> Result<()>;
    /// Drop an excursion whose audit entry could not be written. Returns false if unknown.
    async fn discard(&self, excursion_id: &str) -> Result<bool>;
    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<Excursion>>;
    async fn get_excursion(&self, excursion_id: &str) -> Result<Option<Excursion>>;
    /// Sets `resolved_at` once. Returns false if already resolved or unknown.
    async fn resolve(&self, excursion_id: &str, at: DateTime<Utc>) -> Result<bool>;
    async fn count_open(&self, shipment_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait RiskScoreStore: Send + Sync {
    async fn latest(&self, shipment_id: &str) -> Result<Option<RiskScore>>;
    /// Overwrite the shipment's current row, inserting it if absent.
    async fn upsert(&self, score: &RiskScore) -> Result<()>;
}

/// Collaborator handles shared by the orchestrator, the worker and the ingestor.
#[derive(Clone)]
pub struct Stores {
    pub shipments: Arc<dyn ShipmentStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub readings: Arc<dyn ReadingStore>,
    pub excursions: Arc<dyn ExcursionStore>,
    pub risk_scores: Arc<dyn RiskScoreStore>,
    pub audit: Arc<dyn AuditLogger>,
}

impl Stores {
    /// Route every collaborator to one backend.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ShipmentStore + PolicyStore + ReadingStore + ExcursionStore + RiskScoreStore + AuditLogger + 'static,
    {
        Self {
            shipments: backend.clone(),
            policies: backend.clone(),
            readings: backend.clone(),
            excursions: backend.clone(),
            risk_scores: backend.clone(),
            audit: backend,
        }
    }
}
