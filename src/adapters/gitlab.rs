use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::adapters::llm::ReviewComment;
use crate::core::RawDiffEntry;

/// The SHA triple GitLab needs to anchor an inline discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub start_sha: String,
    pub head_sha: String,
}

/// Everything the review pipeline needs about one merge request: metadata,
/// the position anchor, and the raw per-file diff payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequestChanges {
    pub title: String,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    pub diff_refs: DiffRefs,
    pub changes: Vec<RawDiffEntry>,
}

pub struct GitLabClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let token = token
            .or_else(|| std::env::var("GITLAB_TOKEN").ok())
            .context("GitLab token not found. Set GITLAB_TOKEN or provide gitlab_token in config")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// `GET /projects/:id/merge_requests/:iid/changes` — the raw input the
    /// diff parser consumes.
    pub async fn fetch_merge_request_changes(
        &self,
        project: &str,
        iid: u64,
    ) -> Result<MergeRequestChanges> {
        let url = format!(
            "{}/api/v4/projects/{}/merge_requests/{}/changes",
            self.base_url,
            encode_project(project),
            iid
        );

        let response = self
            .send_with_retry(|| self.client.get(&url))
            .await
            .context("Failed to fetch merge request changes")?;

        response
            .json::<MergeRequestChanges>()
            .await
            .context("Failed to parse merge request changes response")
    }

    /// Posts one review finding as an inline discussion, positioned with
    /// the diff-refs SHA triple and the comment's old/new line numbers.
    pub async fn publish_inline_comment(
        &self,
        project: &str,
        iid: u64,
        diff_refs: &DiffRefs,
        old_path: &str,
        new_path: &str,
        comment: &ReviewComment,
    ) -> Result<()> {
        let url = format!(
            "{}/api/v4/projects/{}/merge_requests/{}/discussions",
            self.base_url,
            encode_project(project),
            iid
        );

        let mut position = json!({
            "position_type": "text",
            "base_sha": diff_refs.base_sha,
            "start_sha": diff_refs.start_sha,
            "head_sha": diff_refs.head_sha,
            "old_path": old_path,
            "new_path": new_path,
        });
        if let Some(line) = comment.new_line {
            position["new_line"] = json!(line);
        }
        if let Some(line) = comment.old_line {
            position["old_line"] = json!(line);
        }

        let body = json!({
            "body": comment.body,
            "position": position,
        });

        self.send_with_retry(|| self.client.post(&url).json(&body))
            .await
            .with_context(|| format!("Failed to publish inline comment on {}", new_path))?;
        Ok(())
    }

    /// Posts a plain (non-positioned) note, used for the review summary.
    pub async fn publish_summary_note(&self, project: &str, iid: u64, body: &str) -> Result<()> {
        let url = format!(
            "{}/api/v4/projects/{}/merge_requests/{}/notes",
            self.base_url,
            encode_project(project),
            iid
        );
        let payload = json!({ "body": body });

        self.send_with_retry(|| self.client.post(&url).json(&payload))
            .await
            .context("Failed to publish summary note")?;
        Ok(())
    }

    async fn send_with_retry<F>(&self, make_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 2;
        const BASE_DELAY_MS: u64 = 250;

        for attempt in 0..=MAX_RETRIES {
            let result = make_request()
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if is_retryable(status) && attempt < MAX_RETRIES {
                        tracing::warn!("GitLab returned {}, retrying", status);
                        sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1))).await;
                        continue;
                    }
                    anyhow::bail!("GitLab API error ({}): {}", status, text);
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
        anyhow::bail!("GitLab request failed after retries")
    }
}

/// Projects are addressed either by numeric ID or by URL-encoded
/// "group/project" path.
fn encode_project(project: &str) -> String {
    project.replace('/', "%2F")
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
