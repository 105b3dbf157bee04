//! Policy Module
//!
//! Pure evaluation of temperature readings against policy rules.
//! Food policies follow HACCP/FSMA-style limits (chilled 2-8°C or frozen
//! below -18°C); pharma follows GDP/GxP-style limits with a stricter
//! duration budget.

pub mod engine;

pub use engine::{evaluate, EffectiveBounds, SPIKE_MAX_MINUTES};
