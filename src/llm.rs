use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::types::{PipelineError, Result};

/// Opaque text-generation capability. Failure must be distinguishable from
/// success so the generator's retry accounting works.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce post text from a prompt and the item's content.
    async fn generate(&self, prompt: &str, content: &str) -> Result<String>;

    /// Derive up to `max` topical keywords from generated text.
    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>>;

    /// Lightweight reachability probe for the health surface.
    async fn probe(&self) -> Result<()>;
}

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client. The request shape is the only thing this module
/// knows about the provider; everything above it sees the trait.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(PipelineError::Configuration(
                "OPENAI_API_KEY is not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: OPENAI_BASE_URL.to_string(),
        })
    }

    /// Point at a compatible endpoint other than the default.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn chat(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens,
                "temperature": 0.7,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!(
                "API returned {}: {}",
                status, body
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::Generation("malformed completion payload".to_string()))?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, content: &str) -> Result<String> {
        debug!(model = %self.model, "requesting generation");
        self.chat(&format!("{}\n\n{}", prompt, content), 300).await
    }

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>> {
        let prompt = format!(
            "List at most {} short topical keywords for the following text. \
             Reply with the keywords only, comma separated.\n\n{}",
            max, text
        );
        let response = self.chat(&prompt, 100).await?;
        Ok(split_keywords(&response, max))
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PipelineError::Generation(format!(
                "probe returned {}",
                response.status()
            )))
        }
    }
}

fn split_keywords(response: &str, max: usize) -> Vec<String> {
    response
        .split(',')
        .map(|w| w.trim().trim_matches('#').to_lowercase())
        .filter(|w| !w.is_empty())
        .take(max)
        .collect()
}

/// Deterministic generator for tests and credential-less local runs.
pub struct MockGenerator;

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, _prompt: &str, content: &str) -> Result<String> {
        let first_line = content.lines().next().unwrap_or("").trim();
        Ok(format!("{} — here is what you need to know.", first_line))
    }

    async fn keywords(&self, text: &str, max: usize) -> Result<Vec<String>> {
        let mut words: Vec<String> = text
            .split_whitespace()
            .filter(|w| w.len() > 4 && w.chars().next().is_some_and(|c| c.is_uppercase()))
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();
        words.sort();
        words.dedup();
        words.truncate(max);
        Ok(words)
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}
