use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion budget per LLM request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Chunk budget for the diff packer. Kept signed so a negative value in
    /// a config file is caught by `validate` instead of wrapping.
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: i64,

    pub api_key: Option<String>,
    pub base_url: Option<String>,

    #[serde(default = "default_gitlab_url")]
    pub gitlab_url: String,
    pub gitlab_token: Option<String>,

    pub custom_prompt: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_chunk_tokens: default_max_chunk_tokens(),
            api_key: None,
            base_url: None,
            gitlab_url: default_gitlab_url(),
            gitlab_token: None,
            custom_prompt: None,
        }
    }
}

impl Config {
    /// Loads `.mrscope.yml` / `.mrscope.yaml` from the working directory,
    /// then the home directory, falling back to defaults. A present but
    /// unparseable file is an error, not a silent default.
    pub fn load() -> Result<Self> {
        for name in [".mrscope.yml", ".mrscope.yaml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".mrscope.yml");
            if home_config.exists() {
                return Self::from_file(&home_config);
            }
        }

        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn merge_with_cli(
        &mut self,
        model: Option<String>,
        max_chunk_tokens: Option<i64>,
        prompt: Option<String>,
    ) {
        if let Some(model) = model {
            self.model = model;
        }
        if let Some(tokens) = max_chunk_tokens {
            self.max_chunk_tokens = tokens;
        }
        if let Some(prompt) = prompt {
            self.custom_prompt = Some(prompt);
        }
    }

    /// Rejects unusable values outright; nothing is clamped to a default.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_tokens <= 0 {
            bail!(
                "max_chunk_tokens must be a positive integer, got {}",
                self.max_chunk_tokens
            );
        }
        if self.model.is_empty() {
            bail!("model must not be empty");
        }
        Ok(())
    }

    pub fn chunk_budget(&self) -> usize {
        self.max_chunk_tokens as usize
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> usize {
    4000
}

fn default_max_chunk_tokens() -> i64 {
    16000
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}
