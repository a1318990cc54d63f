pub mod anthropic;
pub mod gitlab;
pub mod llm;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use gitlab::{DiffRefs, GitLabClient, MergeRequestChanges};
pub use openai::OpenAIAdapter;
