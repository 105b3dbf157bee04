//! Cold Chain Excursion Monitor
//!
//! Flags temperature excursions of monitored shipments against food and
//! pharma policies and keeps a per-shipment risk score:
//! - Pure rule evaluation over a time-ordered reading series
//! - Idempotent, per-shipment serialized detection passes
//! - Risk aggregation recomputed from the full excursion history
//! - Append-only audit ledger with keyed narrative annotations
//! - Durable SQLite task queue for follow-up work

pub mod audit;
pub mod config;
pub mod insight;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod risk;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::MonitorConfig;
pub use model::{Excursion, Policy, PolicyRules, PolicyType, Reading, RiskScore, Severity, Shipment, Violation};
pub use orchestrator::{DetectionOrchestrator, Worker};
pub use policy::evaluate;
pub use risk::score;
