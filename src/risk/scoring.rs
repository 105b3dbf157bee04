//! Risk aggregation: accumulated excursions to a single band.
//!
//! Severity lifts the score to a floor (max, not sum); the remaining
//! bonuses are additive and capped at 100.

use std::collections::BTreeSet;

use crate::model::{Excursion, PolicyType, RiskAssessment, RiskBand, RiskFactor, Severity, Violation, ViolationKind};

const EMPTY_SCORE: u8 = 10;
const BASELINE_SCORE: u32 = 15;
const MAX_SCORE: u32 = 100;

const MEDIUM_FLOOR: u32 = 45;
const HIGH_FLOOR: u32 = 65;
const CRITICAL_FLOOR: u32 = 85;

const DURATION_BONUS: u32 = 20;
const REPEATED_BONUS: u32 = 15;
const PER_EXTRA_EXCURSION_BONUS: u32 = 10;

const DURATION_FACTOR_MULTIPLE: f64 = 2.0;

const HIGH_BAND_AT: u8 = 65;
const MEDIUM_BAND_AT: u8 = 35;

/// What the aggregator needs to know about one excursion.
pub trait ScoringInput {
    fn severity(&self) -> Severity;
    fn duration_minutes(&self) -> f64;
    fn rule_violated(&self) -> &str;
}

impl ScoringInput for Excursion {
    fn severity(&self) -> Severity {
        self.severity
    }

    fn duration_minutes(&self) -> f64 {
        self.duration_minutes
    }

    fn rule_violated(&self) -> &str {
        &self.rule_violated
    }
}

impl ScoringInput for Violation {
    fn severity(&self) -> Severity {
        self.severity
    }

    fn duration_minutes(&self) -> f64 {
        self.duration_minutes
    }

    fn rule_violated(&self) -> &str {
        &self.rule_violated
    }
}

/// Cumulative-duration threshold in minutes.
pub fn duration_threshold(policy_type: PolicyType) -> f64 {
    match policy_type {
        PolicyType::Food => 30.0,
        PolicyType::Pharma => 15.0,
    }
}

/// Number of repeated-minor excursions that counts as a pattern.
pub fn repeated_threshold(policy_type: PolicyType) -> usize {
    match policy_type {
        PolicyType::Food => 3,
        PolicyType::Pharma => 2,
    }
}

pub fn band_for(score_value: u8) -> RiskBand {
    if score_value >= HIGH_BAND_AT {
        RiskBand::High
    } else if score_value >= MEDIUM_BAND_AT {
        RiskBand::Medium
    } else {
        RiskBand::Low
    }
}

pub fn score<E: ScoringInput>(excursions: &[E], policy_type: PolicyType) -> RiskAssessment {
    if excursions.is_empty() {
        return RiskAssessment {
            score: RiskBand::Low,
            score_value: EMPTY_SCORE,
            factors: BTreeSet::new(),
        };
    }

    let mut factors = BTreeSet::new();
    let worst = excursions.iter().map(|e| e.severity()).max().unwrap_or(Severity::Low);

    let mut value = BASELINE_SCORE;
    let floor = match worst {
        Severity::Critical => CRITICAL_FLOOR,
        Severity::High => HIGH_FLOOR,
        Severity::Medium => MEDIUM_FLOOR,
        Severity::Low => BASELINE_SCORE,
    };
    value = value.max(floor);

    if excursions.iter().any(|e| e.severity() == Severity::Critical) {
        factors.insert(RiskFactor::CriticalSeverity);
    }
    if excursions.iter().any(|e| e.severity() == Severity::High) {
        factors.insert(RiskFactor::HighSeverity);
    }

    // The bonus starts at the threshold; the factor is only reported at twice it.
    let total_duration: f64 = excursions.iter().map(|e| e.duration_minutes()).sum();
    let threshold = duration_threshold(policy_type);
    if total_duration > threshold {
        value = (value + DURATION_BONUS).min(MAX_SCORE);
    }
    if total_duration > threshold * DURATION_FACTOR_MULTIPLE {
        factors.insert(RiskFactor::Duration);
    }

    let repeated = excursions
        .iter()
        .filter(|e| e.rule_violated() == ViolationKind::RepeatedMinor.as_str())
        .count();
    if repeated >= repeated_threshold(policy_type) {
        value = (value + REPEATED_BONUS).min(MAX_SCORE);
        factors.insert(RiskFactor::RepeatedViolations);
    }

    let extra = u32::try_from(excursions.len() - 1).unwrap_or(u32::MAX);
    if extra > 0 {
        value = (value + extra.saturating_mul(PER_EXTRA_EXCURSION_BONUS)).min(MAX_SCORE);
        factors.insert(RiskFactor::MultipleExcursions);
    }

    let score_value = value as u8;
    RiskAssessment {
        score: band_for(score_value),
        score_value,
        factors,
    }
}
