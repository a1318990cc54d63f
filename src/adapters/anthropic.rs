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

pub struct AnthropicAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: usize,
    temperature: f32,
    system: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
    #[serde(rename = "type")]
    block_type: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}

impl AnthropicAdapter {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .context(
                "Anthropic API key not found. Set ANTHROPIC_API_KEY or provide api_key in config",
            )?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string());

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

    async fn send_with_retry(&self, body: &MessagesRequest) -> Result<reqwest::Response> {
        const MAX_RETRIES: usize = 2;
        const BASE_DELAY_MS: u64 = 250;

        let url = format!("{}/messages", self.base_url);
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
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
                        tracing::warn!("Anthropic returned {}, retrying", status);
                        sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1))).await;
                        continue;
                    }
                    anyhow::bail!("Anthropic API error ({}): {}", status, text);
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
        anyhow::bail!("Anthropic request failed after retries")
    }
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        let body = MessagesRequest {
            model: self.config.model_name.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.content.clone(),
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: build_system_prompt(&request),
        };

        let response = self
            .send_with_retry(&body)
            .await
            .context("Failed to send request to Anthropic")?;

        let messages: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let text = messages
            .content
            .iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text.clone())
            .unwrap_or_default();

        Ok(AnalysisResponse {
            comments: extract_comments(&text),
            usage: Usage {
                prompt_tokens: messages.usage.input_tokens,
                completion_tokens: messages.usage.output_tokens,
                total_tokens: messages.usage.input_tokens + messages.usage.output_tokens,
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
