//! Risk Aggregation
//!
//! `scoring` is the pure aggregator; `recompute` derives and persists the
//! shipment's single current risk row from its complete excursion set.

pub mod recompute;
pub mod scoring;

pub use recompute::RiskRecomputer;
pub use scoring::{band_for, score, ScoringInput};
