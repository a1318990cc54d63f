use crate::adapters::llm::{
    build_system_prompt, extract_comments, AnalysisRequest, AnalysisResponse, LlmAdapter,
    ModelConfig, Usage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Chat-completions client. Also serves self-hosted OpenAI-compatible
/// endpoints via `base_url`.
pub struct OpenAIAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl OpenAIAdapter {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .context("OpenAI API key not found. Set OPENAI_API_KEY or provide api_key in config")?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
            base_url,
        })
    }

    async fn send_with_retry(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        const MAX_RETRIES: usize = 2;
        const BASE_DELAY_MS: u64 = 250;

        let url = format!("{}/chat/completions", self.base_url);
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if is_retryable(status) && attempt < MAX_RETRIES {
                        tracing::warn!("OpenAI returned {}, retrying", status);
                        sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1))).await;
                        continue;
                    }
                    anyhow::bail!("OpenAI API error ({}): {}", status, text);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1))).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        anyhow::bail!("OpenAI request failed after retries")
    }
}

#[async_trait]
impl LlmAdapter for OpenAIAdapter {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        let body = ChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: build_system_prompt(&request),
                },
                Message {
                    role: "user".to_string(),
                    content: request.content,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .send_with_retry(&body)
            .await
            .context("Failed to send request to OpenAI")?;

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        let text = chat
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(AnalysisResponse {
            comments: extract_comments(&text),
            usage: Usage {
                prompt_tokens: chat.usage.prompt_tokens,
                completion_tokens: chat.usage.completion_tokens,
                total_tokens: chat.usage.total_tokens,
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
