//! Insight Generation
//!
//! Turns an audit event into a short regulator-facing narrative. Generation
//! is best effort: every failure collapses into [`Narrative::Fallback`].

pub mod cache;
pub mod provider;

pub use cache::{CachedProvider, NarrativeCache};
pub use provider::{LlmProvider, OpenAiCompatibleProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audit::AuditEventType;
use crate::model::{Severity, Violation};

pub const FALLBACK_NARRATIVE: &str = "AI explanation unavailable.";

const SYSTEM_PROMPT: &str = "You are a compliance auditor. In one sentence, write a regulator-friendly \
     explanation for this audit event. Be factual and concise.";

/// What the generator is told about one audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeRequest {
    pub event_type: AuditEventType,
    pub rule_violated: Option<String>,
    pub severity: Option<Severity>,
    pub details_summary: String,
}

impl NarrativeRequest {
    pub fn for_violation(violation: &Violation) -> Self {
        let details_summary = match violation.temperature {
            Some(t) => format!("Temperature {}°C, duration {} min", t, violation.duration_minutes),
            None => format!("Duration {} min", violation.duration_minutes),
        };
        Self {
            event_type: AuditEventType::ExcursionDetected,
            rule_violated: Some(violation.rule_violated.clone()),
            severity: Some(violation.severity),
            details_summary,
        }
    }

    pub fn prompt(&self) -> String {
        let mut prompt = format!("Event: {}.", self.event_type);
        if let Some(rule) = &self.rule_violated {
            prompt.push_str(&format!(" Rule: {}.", rule));
        }
        if let Some(severity) = self.severity {
            prompt.push_str(&format!(" Severity: {}.", severity));
        }
        prompt.push_str(&format!(" Details: {}.", self.details_summary));
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Narrative {
    Generated(String),
    Fallback(&'static str),
}

impl Narrative {
    pub fn text(&self) -> &str {
        match self {
            Narrative::Generated(text) => text,
            Narrative::Fallback(text) => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Narrative::Fallback(_))
    }
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    /// Never fails; unavailability is reported as a fallback.
    async fn explain(&self, request: &NarrativeRequest) -> Narrative;
}

/// Always falls back. Used when no model is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticInsightGenerator;

#[async_trait]
impl InsightGenerator for StaticInsightGenerator {
    async fn explain(&self, _request: &NarrativeRequest) -> Narrative {
        Narrative::Fallback(FALLBACK_NARRATIVE)
    }
}

pub struct LlmInsightGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmInsightGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl InsightGenerator for LlmInsightGenerator {
    async fn explain(&self, request: &NarrativeRequest) -> Narrative {
        let result = self
            .provider
            .generate(&self.model, request.prompt(), Some(SYSTEM_PROMPT.to_string()))
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => {
                debug!(model = %self.model, "Narrative generated");
                Narrative::Generated(text.trim().to_string())
            }
            Ok(_) => {
                warn!(model = %self.model, "Model returned an empty narrative");
                Narrative::Fallback(FALLBACK_NARRATIVE)
            }
            Err(e) => {
                warn!(model = %self.model, error = %e, "Narrative generation failed");
                Narrative::Fallback(FALLBACK_NARRATIVE)
            }
        }
    }
}
