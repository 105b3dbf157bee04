//! Policy rules
//!
//! Rules are a tagged document, one variant per policy type, each with its
//! own defaults. They are validated when they enter the system so the
//! evaluator never sees a malformed rule set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PolicyType;

#[derive(Debug, Error, PartialEq)]
pub enum RulesError {
    #[error("malformed policy rules: {0}")]
    Malformed(String),

    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("minTempC ({min}) must be below maxTempC ({max})")]
    InvertedBounds { min: f64, max: f64 },

    #[error("maxDurationMinutes must be positive, got {0}")]
    NonPositiveDuration(f64),

    #[error("repeatedMinorCount must be at least 1")]
    ZeroRepeatedCount,
}

/// HACCP/FSMA-style cold chain: 2-8°C chilled, or frozen below -18°C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FoodRules {
    pub min_temp_c: f64,
    pub max_temp_c: f64,
    pub max_duration_minutes: f64,
    pub repeated_minor_count: u32,
    pub frozen_max_temp_c: Option<f64>,
}

impl Default for FoodRules {
    fn default() -> Self {
        Self {
            min_temp_c: 2.0,
            max_temp_c: 8.0,
            max_duration_minutes: 30.0,
            repeated_minor_count: 3,
            frozen_max_temp_c: Some(-18.0),
        }
    }
}

/// GDP/GxP-style: 2-8°C with a stricter duration limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PharmaRules {
    pub min_temp_c: f64,
    pub max_temp_c: f64,
    pub max_duration_minutes: f64,
    pub repeated_minor_count: u32,
    pub frozen_max_temp_c: Option<f64>,
}

impl Default for PharmaRules {
    fn default() -> Self {
        Self {
            min_temp_c: 2.0,
            max_temp_c: 8.0,
            max_duration_minutes: 15.0,
            repeated_minor_count: 2,
            frozen_max_temp_c: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyRules {
    Food(FoodRules),
    Pharma(PharmaRules),
}

/// Type-independent view over either variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleLimits {
    pub min_temp_c: f64,
    pub max_temp_c: f64,
    pub max_duration_minutes: f64,
    pub repeated_minor_count: u32,
    pub frozen_max_temp_c: Option<f64>,
}

impl PolicyRules {
    /// Type defaults with no overrides.
    pub fn defaults_for(policy_type: PolicyType) -> Self {
        match policy_type {
            PolicyType::Food => PolicyRules::Food(FoodRules::default()),
            PolicyType::Pharma => PolicyRules::Pharma(PharmaRules::default()),
        }
    }

    /// Parse and validate a tagged rules document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, RulesError> {
        let rules: PolicyRules =
            serde_json::from_value(value).map_err(|e| RulesError::Malformed(e.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Parse an untagged override document for a known policy type.
    pub fn from_overrides(policy_type: PolicyType, overrides: serde_json::Value) -> Result<Self, RulesError> {
        let mut doc = match overrides {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => return Err(RulesError::Malformed(format!("expected an object, got {}", other))),
        };
        doc.insert("type".to_string(), serde_json::Value::from(policy_type.as_str()));
        Self::from_json(serde_json::Value::Object(doc))
    }

    pub fn policy_type(&self) -> PolicyType {
        match self {
            PolicyRules::Food(_) => PolicyType::Food,
            PolicyRules::Pharma(_) => PolicyType::Pharma,
        }
    }

    pub fn limits(&self) -> RuleLimits {
        match self {
            PolicyRules::Food(r) => RuleLimits {
                min_temp_c: r.min_temp_c,
                max_temp_c: r.max_temp_c,
                max_duration_minutes: r.max_duration_minutes,
                repeated_minor_count: r.repeated_minor_count,
                frozen_max_temp_c: r.frozen_max_temp_c,
            },
            PolicyRules::Pharma(r) => RuleLimits {
                min_temp_c: r.min_temp_c,
                max_temp_c: r.max_temp_c,
                max_duration_minutes: r.max_duration_minutes,
                repeated_minor_count: r.repeated_minor_count,
                frozen_max_temp_c: r.frozen_max_temp_c,
            },
        }
    }

    pub fn validate(&self) -> Result<(), RulesError> {
        let l = self.limits();
        if !l.min_temp_c.is_finite() {
            return Err(RulesError::NotFinite { field: "minTempC" });
        }
        if !l.max_temp_c.is_finite() {
            return Err(RulesError::NotFinite { field: "maxTempC" });
        }
        if let Some(frozen) = l.frozen_max_temp_c {
            if !frozen.is_finite() {
                return Err(RulesError::NotFinite { field: "frozenMaxTempC" });
            }
        }
        if l.min_temp_c >= l.max_temp_c {
            return Err(RulesError::InvertedBounds { min: l.min_temp_c, max: l.max_temp_c });
        }
        if !l.max_duration_minutes.is_finite() || l.max_duration_minutes <= 0.0 {
            return Err(RulesError::NonPositiveDuration(l.max_duration_minutes));
        }
        if l.repeated_minor_count == 0 {
            return Err(RulesError::ZeroRepeatedCount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let rules = PolicyRules::from_json(json!({"type": "pharma", "maxTempC": 6})).unwrap();
        let l = rules.limits();
        assert_eq!(rules.policy_type(), PolicyType::Pharma);
        assert_eq!(l.max_temp_c, 6.0);
        assert_eq!(l.min_temp_c, 2.0);
        assert_eq!(l.max_duration_minutes, 15.0);
        assert_eq!(l.repeated_minor_count, 2);
        assert_eq!(l.frozen_max_temp_c, None);

        let food = PolicyRules::from_json(json!({"type": "food"})).unwrap().limits();
        assert_eq!(food.max_duration_minutes, 30.0);
        assert_eq!(food.repeated_minor_count, 3);
        assert_eq!(food.frozen_max_temp_c, Some(-18.0));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = PolicyRules::from_json(json!({"type": "food", "maxTemp": 9})).unwrap_err();
        assert!(matches!(err, RulesError::Malformed(_)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(PolicyRules::from_json(json!({"type": "produce"})).is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = PolicyRules::from_overrides(PolicyType::Food, json!({"minTempC": 9, "maxTempC": 8})).unwrap_err();
        assert_eq!(err, RulesError::InvertedBounds { min: 9.0, max: 8.0 });
    }

    #[test]
    fn test_zero_duration_and_count_rejected() {
        assert_eq!(
            PolicyRules::from_overrides(PolicyType::Pharma, json!({"maxDurationMinutes": 0})).unwrap_err(),
            RulesError::NonPositiveDuration(0.0)
        );
        assert_eq!(
            PolicyRules::from_overrides(PolicyType::Pharma, json!({"repeatedMinorCount": 0})).unwrap_err(),
            RulesError::ZeroRepeatedCount
        );
    }

    #[test]
    fn test_overrides_accept_null() {
        let rules = PolicyRules::from_overrides(PolicyType::Food, serde_json::Value::Null).unwrap();
        assert_eq!(rules, PolicyRules::defaults_for(PolicyType::Food));
    }

    #[test]
    fn test_serialized_form_is_tagged() {
        let value = serde_json::to_value(PolicyRules::defaults_for(PolicyType::Pharma)).unwrap();
        assert_eq!(value["type"], "pharma");
        assert_eq!(value["maxDurationMinutes"], 15.0);
        assert_eq!(PolicyRules::from_json(value).unwrap().policy_type(), PolicyType::Pharma);
    }
}
