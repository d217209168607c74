//! HTTP client for the text-generation backend.
//!
//! Speaks either the OpenAI-compatible chat completions API or the Ollama
//! chat API, depending on the configured provider.

use super::TextGenerator;
use crate::config::{ModelConfig, Provider};
use crate::error::GenerationError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message in the chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// OpenAI-compatible chat completions request.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Configured backend client.
pub struct LlmClient {
    provider: Provider,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    timeout_seconds: u64,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            provider: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.name.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_seconds: config.timeout_seconds,
            http,
        })
    }

    fn messages(prompt: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            },
        ]
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, GenerationError> {
        let mut request = self.http.post(url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.timeout_seconds)
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = CompletionRequest {
            model: &self.model,
            messages: Self::messages(prompt),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response: CompletionResponse = self
            .post(&url, &request)
            .await?
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::Malformed("no choices in response".to_string()))
    }

    async fn complete_ollama(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = OllamaChatRequest {
            model: &self.model,
            messages: Self::messages(prompt),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let response: OllamaChatResponse = self
            .post(&url, &request)
            .await?
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        Ok(response.message.content)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        debug!("Requesting synopsis from {} ({:?})", self.model, self.provider);
        let text = match self.provider {
            Provider::OpenAi => self.complete_openai(prompt).await?,
            Provider::Ollama => self.complete_ollama(prompt).await?,
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text)
    }
}

/// System prompt for per-item synopses.
const SYSTEM_PROMPT: &str = r#"You write very short notification synopses.
Answer in plain text, 2-3 short lines, under 60 words.
No links, no markdown, no greeting."#;
