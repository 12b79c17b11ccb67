//! Optional LLM similarity scorer.
//!
//! The cleanup scheduler asks the scorer to refine pairs whose
//! Levenshtein similarity falls below the duplicate threshold. The
//! shipped implementation speaks the OpenAI-compatible chat wire
//! format and expects the model to answer with a bare number.

use async_trait::async_trait;
use logsink_core::config::LlmConfig;
use logsink_core::{Result, SinkError};
use serde::{Deserialize, Serialize};

/// Contract over an external similarity judge.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    /// Scores how likely `a` and `b` describe the same underlying
    /// issue, in `[0, 1]`.
    async fn score(&self, a: &str, b: &str) -> Result<f64>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

const SYSTEM_PROMPT: &str = "You compare two application error messages and answer with a \
     single number between 0 and 1: the probability that they describe the same underlying \
     issue. Answer with the number only.";

/// OpenAI-compatible chat-completions scorer.
pub struct HttpLlmScorer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl HttpLlmScorer {
    /// Builds the scorer from configuration.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Provider(format!("cannot build LLM client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl SimilarityScorer for HttpLlmScorer {
    async fn score(&self, a: &str, b: &str) -> Result<f64> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("First message:\n{a}\n\nSecond message:\n{b}"),
                },
            ],
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Provider(format!("LLM request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(SinkError::Provider(format!(
                "LLM request returned {status}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Provider(format!("cannot parse LLM response: {e}")))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim())
            .ok_or_else(|| SinkError::Provider("LLM returned no choices".into()))?;
        parse_score(content)
            .ok_or_else(|| SinkError::Provider(format!("LLM answer is not a score: {content}")))
    }
}

/// Pulls a `[0, 1]` score out of a model answer, tolerating surrounding
/// prose.
fn parse_score(answer: &str) -> Option<f64> {
    if let Ok(score) = answer.parse::<f64>() {
        return (0.0..=1.0).contains(&score).then_some(score);
    }
    answer
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|token| token.trim_matches('.'))
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<f64>().ok())
        .find(|score| (0.0..=1.0).contains(score))
}
