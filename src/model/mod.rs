//! Domain Model
//!
//! Readings, policies, violations and the records derived from them.
//! All instants coming from sensors are epoch milliseconds; instants
//! stamped by this process are `DateTime<Utc>`.

pub mod rules;

pub use rules::{FoodRules, PharmaRules, PolicyRules, RulesError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Milliseconds in one minute.
pub const MINUTE_MS: i64 = 60_000;

/// A single temperature sample. Immutable once stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Degrees Celsius
    pub temperature: f64,
}

impl Reading {
    pub fn new(timestamp: i64, temperature: f64) -> Self {
        Self { timestamp, temperature }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Food,
    Pharma,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Food => "food",
            PolicyType::Pharma => "pharma",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "food" => Ok(PolicyType::Food),
            "pharma" => Ok(PolicyType::Pharma),
            other => Err(format!("unknown policy type '{}'", other)),
        }
    }
}

/// Ordered grading: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ThresholdHigh,
    ThresholdLow,
    Duration,
    RepeatedMinor,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::ThresholdHigh => "threshold_high",
            ViolationKind::ThresholdLow => "threshold_low",
            ViolationKind::Duration => "duration",
            ViolationKind::RepeatedMinor => "repeated_minor",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold_high" => Ok(ViolationKind::ThresholdHigh),
            "threshold_low" => Ok(ViolationKind::ThresholdLow),
            "duration" => Ok(ViolationKind::Duration),
            "repeated_minor" => Ok(ViolationKind::RepeatedMinor),
            other => Err(format!("unknown violation kind '{}'", other)),
        }
    }
}

/// Evaluator output. Transient until the orchestrator persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_minutes: f64,
    pub rule_violated: String,
    /// Peak (or trough) temperature of the run; absent for repeated-minor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        start_time: i64,
        end_time: i64,
        temperature: Option<f64>,
    ) -> Self {
        Self {
            kind,
            severity,
            start_time,
            end_time,
            duration_minutes: (end_time - start_time) as f64 / MINUTE_MS as f64,
            rule_violated: kind.as_str().to_string(),
            temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    /// Normalized external shipment id
    pub id: String,
    pub facility_id: Option<String>,
    pub product_type: String,
    pub policy_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub rules: PolicyRules,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(name: impl Into<String>, rules: PolicyRules) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            rules,
            active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn policy_type(&self) -> PolicyType {
        self.rules.policy_type()
    }
}

/// A persisted violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Excursion {
    pub id: String,
    pub shipment_id: String,
    pub policy_id: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_minutes: f64,
    pub rule_violated: String,
    pub temperature: Option<f64>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Excursion {
    pub fn from_violation(
        shipment_id: &str,
        policy_id: &str,
        violation: &Violation,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            shipment_id: shipment_id.to_string(),
            policy_id: policy_id.to_string(),
            kind: violation.kind,
            severity: violation.severity,
            start_time: violation.start_time,
            end_time: violation.end_time,
            duration_minutes: violation.duration_minutes,
            rule_violated: violation.rule_violated.clone(),
            temperature: violation.temperature,
            detected_at,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Low,
    Medium,
    High,
}

impl RiskBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Medium => "medium",
            RiskBand::High => "high",
        }
    }
}

impl FromStr for RiskBand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskBand::Low),
            "medium" => Ok(RiskBand::Medium),
            "high" => Ok(RiskBand::High),
            other => Err(format!("unknown risk band '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    Duration,
    RepeatedViolations,
    CriticalSeverity,
    HighSeverity,
    MultipleExcursions,
}

impl RiskFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFactor::Duration => "duration",
            RiskFactor::RepeatedViolations => "repeated_violations",
            RiskFactor::CriticalSeverity => "critical_severity",
            RiskFactor::HighSeverity => "high_severity",
            RiskFactor::MultipleExcursions => "multiple_excursions",
        }
    }
}

/// Pure aggregation result, before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: RiskBand,
    pub score_value: u8,
    pub factors: BTreeSet<RiskFactor>,
}

/// The single current risk row of a shipment. Overwritten, never appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    pub shipment_id: String,
    pub score: RiskBand,
    pub score_value: u8,
    pub factors: BTreeSet<RiskFactor>,
    pub computed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,
}

impl RiskScore {
    pub fn from_assessment(shipment_id: &str, assessment: RiskAssessment, computed_at: DateTime<Utc>) -> Self {
        Self {
            shipment_id: shipment_id.to_string(),
            score: assessment.score,
            score_value: assessment.score_value,
            factors: assessment.factors,
            computed_at,
            ai_summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            [Severity::Medium, Severity::Critical, Severity::Low].iter().max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn test_violation_duration_and_rule() {
        let v = Violation::new(ViolationKind::Duration, Severity::Medium, 0, 90 * MINUTE_MS, Some(12.0));
        assert_eq!(v.duration_minutes, 90.0);
        assert_eq!(v.rule_violated, "duration");
    }

    #[test]
    fn test_string_forms_round_trip() {
        for kind in [
            ViolationKind::ThresholdHigh,
            ViolationKind::ThresholdLow,
            ViolationKind::Duration,
            ViolationKind::RepeatedMinor,
        ] {
            assert_eq!(kind.as_str().parse::<ViolationKind>().unwrap(), kind);
        }
        assert!("lukewarm".parse::<Severity>().is_err());
        assert_eq!(serde_json::to_string(&RiskFactor::CriticalSeverity).unwrap(), "\"critical_severity\"");
    }
}
