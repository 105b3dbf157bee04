//! Monitor configuration: optional YAML file, then environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::worker::{DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub database_path: PathBuf,
    pub worker_poll_interval_ms: u64,
    pub max_task_attempts: u32,
    /// Narratives fall back to the static text when absent
    pub llm: Option<LlmConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("coldchain.db"),
            worker_poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_task_attempts: DEFAULT_MAX_ATTEMPTS,
            llm: None,
        }
    }
}

impl MonitorConfig {
    /// Read `path` if given and present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).with_context(|| format!("Failed to read config {:?}", p))?;
                serde_yaml::from_str(&text).with_context(|| format!("Failed to parse config {:?}", p))?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Split out so tests need not touch the process env.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("COLDCHAIN_DB") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(ms) = lookup("COLDCHAIN_POLL_MS") {
            self.worker_poll_interval_ms = ms.parse().context("COLDCHAIN_POLL_MS must be an integer")?;
        }
        if let Some(n) = lookup("COLDCHAIN_MAX_ATTEMPTS") {
            self.max_task_attempts = n.parse().context("COLDCHAIN_MAX_ATTEMPTS must be an integer")?;
        }

        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.llm.get_or_insert_with(LlmConfig::default).api_key = key;
        }
        if let Some(llm) = self.llm.as_mut() {
            if let Some(url) = lookup("OPENAI_BASE_URL") {
                llm.base_url = url;
            }
            if let Some(model) = lookup("OPENAI_MODEL") {
                llm.model = model;
            }
        }
        // A section without a key cannot authenticate.
        if self.llm.as_ref().is_some_and(|l| l.api_key.trim().is_empty()) {
            self.llm = None;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }
}
