//! Narrative Cache
//!
//! Redelivered narrative jobs ask for the same completion again; this keeps
//! the model from being called twice for one audit event.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::LlmProvider;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model: String,
    prompt_hash: [u8; 32],
    system_hash: [u8; 32],
}

impl CacheKey {
    fn new(model: &str, prompt: &str, system: Option<&str>) -> Self {
        Self {
            model: model.to_string(),
            prompt_hash: hash(prompt),
            system_hash: hash(system.unwrap_or("")),
        }
    }
}

fn hash(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

#[derive(Default)]
pub struct NarrativeCache {
    responses: RwLock<HashMap<CacheKey, String>>,
}

impl NarrativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, model: &str, prompt: &str, system: Option<&str>) -> Option<String> {
        let key = CacheKey::new(model, prompt, system);
        self.responses.read().await.get(&key).cloned()
    }

    pub async fn set(&self, model: &str, prompt: &str, system: Option<&str>, response: String) {
        let key = CacheKey::new(model, prompt, system);
        self.responses.write().await.insert(key, response);
    }

    pub async fn len(&self) -> usize {
        self.responses.read().await.len()
    }
}

/// Provider that wraps another provider with a cache
pub struct CachedProvider {
    inner: Arc<dyn LlmProvider>,
    cache: Arc<NarrativeCache>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, cache: Arc<NarrativeCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl LlmProvider for CachedProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> anyhow::Result<String> {
        if let Some(cached) = self.cache.get(model, &prompt, system.as_deref()).await {
            tracing::debug!(model, "Narrative cache hit");
            return Ok(cached);
        }

        let response = self.inner.generate(model, prompt.clone(), system.clone()).await?;
        self.cache.set(model, &prompt, system.as_deref(), response.clone()).await;
        Ok(response)
    }
}
