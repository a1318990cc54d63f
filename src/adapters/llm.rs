use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "gpt-4o".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.2,
            max_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReviewType {
    General,
    Security,
    Performance,
    Style,
}

/// One chunk's worth of work for the model: the rendered diff content plus
/// the review focus and an optional caller-supplied prompt override.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub content: String,
    pub review_type: ReviewType,
    pub custom_prompt: Option<String>,
}

/// A single review finding, in the shape the comment publisher needs to
/// build an inline position: path plus old/new line numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub file_path: String,
    #[serde(default)]
    pub old_line: Option<u64>,
    #[serde(default)]
    pub new_line: Option<u64>,
    #[serde(default)]
    pub severity: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub comments: Vec<ReviewComment>,
    pub usage: Usage,
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse>;
    fn model_name(&self) -> &str;
}

pub fn create_adapter(config: &ModelConfig) -> Result<Box<dyn LlmAdapter>> {
    match config.model_name.as_str() {
        name if name.starts_with("claude") => Ok(Box::new(
            crate::adapters::AnthropicAdapter::new(config.clone())?,
        )),
        // Anything else goes through the OpenAI-compatible endpoint.
        _ => Ok(Box::new(crate::adapters::OpenAIAdapter::new(
            config.clone(),
        )?)),
    }
}

/// System prompt shared by all adapters. The custom prompt, when given,
/// replaces the review-type focus but not the output contract.
pub fn build_system_prompt(request: &AnalysisRequest) -> String {
    let focus = match request.review_type {
        ReviewType::General => {
            "Review the changes for bugs, correctness issues, and maintainability problems."
        }
        ReviewType::Security => {
            "Review the changes for security issues: injection, auth gaps, unsafe handling of untrusted input, secrets in code."
        }
        ReviewType::Performance => {
            "Review the changes for performance problems: needless allocation, quadratic loops, blocking calls, chatty I/O."
        }
        ReviewType::Style => {
            "Review the changes for readability and style: naming, structure, dead code, missing error handling."
        }
    };

    let mut prompt = String::from("You are a code reviewer for a merge request.\n");
    match &request.custom_prompt {
        Some(custom) => prompt.push_str(custom),
        None => prompt.push_str(focus),
    }
    prompt.push_str(
        "\n\nRespond with a JSON array only. Each element: \
{\"file_path\": string, \"new_line\": number or null, \"old_line\": number or null, \
\"severity\": \"error\"|\"warning\"|\"info\", \"body\": string}. \
Line numbers refer to the numbers in the @@ hunk headers. \
Return [] if the changes look fine.",
    );
    prompt
}

/// Pulls the comments array out of a model completion, tolerating fenced
/// code blocks and prose around the JSON.
pub fn extract_comments(text: &str) -> Vec<ReviewComment> {
    if let Ok(comments) = serde_json::from_str::<Vec<ReviewComment>>(text.trim()) {
        return comments;
    }

    // Fenced block, with or without a language tag.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(comments) = serde_json::from_str::<Vec<ReviewComment>>(after[..end].trim()) {
                return comments;
            }
        }
    }

    // Last resort: widest bracketed span.
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            if let Ok(comments) = serde_json::from_str::<Vec<ReviewComment>>(&text[start..=end]) {
                return comments;
            }
        }
    }

    tracing::warn!("could not extract review comments from model output");
    Vec::new()
}
