//! Embedding provider contract and HTTP implementation.
//!
//! Callers are agnostic to the provider; anything that can turn text
//! into a fixed-dimension vector satisfies [`EmbeddingProvider`]. The
//! shipped implementation speaks the OpenAI-compatible `/embeddings`
//! wire format, which local servers such as Ollama also expose.

use async_trait::async_trait;
use logsink_core::config::EmbeddingConfig;
use logsink_core::issue::Issue;
use logsink_core::{Result, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Contract over an external vector-embedding provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The model name recorded alongside stored embeddings.
    fn model(&self) -> &str;
}

/// Builds the text the worker embeds for an issue: message, application
/// scope, and the pretty-printed context.
#[must_use]
pub fn build_embedding_input(issue: &Issue) -> String {
    let context = serde_json::to_string_pretty(&Value::Object(issue.context.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "Message: {}\nApplication: {}\nContext: {}",
        issue.message, issue.application_id, context
    )
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    /// Builds the client from configuration. The per-request timeout is
    /// enforced by the underlying HTTP client.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Provider(format!("cannot build embedding client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.endpoint);
        let mut request = self.client.post(&url).json(&EmbedRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Provider(format!("embedding request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Provider(format!(
                "embedding request returned {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Provider(format!("cannot parse embedding response: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SinkError::Provider("provider returned no embedding".into()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
