use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::adapters::gitlab::GitLabClient;
use crate::adapters::llm::{
    create_adapter, AnalysisRequest, LlmAdapter, ModelConfig, ReviewComment, ReviewType, Usage,
};
use crate::config::Config;
use crate::core::{DiffParser, DiffSummary, FileDiff};

/// Lifecycle of one review task. The core transformations are stateless;
/// this is bookkeeping for callers and reports only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReviewState::Pending => "pending",
            ReviewState::Running => "running",
            ReviewState::Completed => "completed",
            ReviewState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize)]
pub struct ReviewReport {
    pub project: String,
    pub merge_request_iid: u64,
    pub title: String,
    pub state: ReviewState,
    pub model: String,
    pub summary: DiffSummary,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub comments: Vec<ReviewComment>,
    pub usage: Usage,
    pub generated_at: DateTime<Utc>,
}

impl ReviewReport {
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Review: {}\n\n", self.title));
        out.push_str(&format!(
            "{} files (+{} / -{}), {} chunks, model {}\n\n",
            self.summary.total_files,
            self.summary.total_added_lines,
            self.summary.total_removed_lines,
            self.chunks,
            self.model
        ));

        if self.comments.is_empty() {
            out.push_str("No findings.\n");
            return out;
        }

        out.push_str("## Findings\n\n");
        for comment in &self.comments {
            let line = comment
                .new_line
                .or(comment.old_line)
                .map(|l| format!(":{}", l))
                .unwrap_or_default();
            let severity = comment.severity.as_deref().unwrap_or("info");
            out.push_str(&format!(
                "- **{}{}** [{}] {}\n",
                comment.file_path, line, severity, comment.body
            ));
        }
        out
    }
}

/// Wires the collaborators together for one merge request review:
/// fetch changes, parse, chunk, analyze each chunk, publish or report.
pub struct ReviewProcessor {
    config: Config,
    parser: DiffParser,
    gitlab: GitLabClient,
    adapter: Box<dyn LlmAdapter>,
}

impl ReviewProcessor {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let parser = DiffParser::new(config.chunk_budget())?;
        let gitlab = GitLabClient::new(&config.gitlab_url, config.gitlab_token.clone())?;
        let adapter = create_adapter(&ModelConfig {
            model_name: config.model.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })?;
        Ok(Self {
            config,
            parser,
            gitlab,
            adapter,
        })
    }

    pub async fn run(
        &self,
        project: &str,
        iid: u64,
        review_type: ReviewType,
        post_comments: bool,
    ) -> Result<ReviewReport> {
        let mut state = ReviewState::Pending;
        info!("review of {}!{}: {}", project, iid, state);
        let changes = self
            .gitlab
            .fetch_merge_request_changes(project, iid)
            .await?;
        state = ReviewState::Running;
        info!(
            "review of {}!{}: {} ({})",
            project, iid, state, changes.title
        );
        if let (Some(source), Some(target)) = (&changes.source_branch, &changes.target_branch) {
            tracing::debug!("branches: {} -> {}", source, target);
        }

        let files = self.parser.parse(&changes.changes);
        let summary = self.parser.get_diff_summary(&files);
        info!(
            "parsed {} files (+{} / -{}), ~{} tokens",
            summary.total_files,
            summary.total_added_lines,
            summary.total_removed_lines,
            summary.total_estimated_tokens
        );

        let chunks = self.parser.chunk_large_diff(&files);
        info!(
            "packed {} files into {} chunks (budget {} tokens)",
            files.len(),
            chunks.len(),
            self.parser.max_chunk_tokens()
        );

        // Chunk boundaries are self-contained, so each request stands
        // alone; one failed chunk does not abort the rest.
        let mut comments = Vec::new();
        let mut usage = Usage::default();
        let mut failed_chunks = 0usize;
        for (idx, chunk) in chunks.iter().enumerate() {
            info!(
                "analyzing chunk {}/{} ({} files, ~{} tokens)",
                idx + 1,
                chunks.len(),
                chunk.len(),
                chunk.estimated_tokens()
            );
            let request = AnalysisRequest {
                content: chunk.render(),
                review_type,
                custom_prompt: self.config.custom_prompt.clone(),
            };
            match self.adapter.analyze(request).await {
                Ok(response) => {
                    usage.prompt_tokens += response.usage.prompt_tokens;
                    usage.completion_tokens += response.usage.completion_tokens;
                    usage.total_tokens += response.usage.total_tokens;
                    comments.extend(response.comments);
                }
                Err(err) => {
                    warn!("chunk {} analysis failed: {:#}", idx + 1, err);
                    failed_chunks += 1;
                }
            }
        }
        if !chunks.is_empty() && failed_chunks == chunks.len() {
            state = ReviewState::Failed;
            info!("review of {}!{}: {}", project, iid, state);
            bail!("all {} chunks failed analysis", chunks.len());
        }

        let comments = retain_mapped_comments(comments, &files);

        if post_comments {
            self.publish(project, iid, &changes.diff_refs, &files, &comments)
                .await?;
        }

        state = ReviewState::Completed;
        info!(
            "review of {}!{}: {} with {} comments",
            project,
            iid,
            state,
            comments.len()
        );
        Ok(ReviewReport {
            project: project.to_string(),
            merge_request_iid: iid,
            title: changes.title,
            state,
            model: self.adapter.model_name().to_string(),
            summary,
            chunks: chunks.len(),
            failed_chunks,
            comments,
            usage,
            generated_at: Utc::now(),
        })
    }

    /// Fetches and summarizes without touching the LLM.
    pub async fn summarize(&self, project: &str, iid: u64) -> Result<(String, DiffSummary)> {
        let changes = self
            .gitlab
            .fetch_merge_request_changes(project, iid)
            .await?;
        let files = self.parser.parse(&changes.changes);
        Ok((changes.title, self.parser.get_diff_summary(&files)))
    }

    pub async fn post_summary_note(&self, project: &str, iid: u64, body: &str) -> Result<()> {
        self.gitlab.publish_summary_note(project, iid, body).await
    }

    async fn publish(
        &self,
        project: &str,
        iid: u64,
        diff_refs: &crate::adapters::gitlab::DiffRefs,
        files: &[FileDiff],
        comments: &[ReviewComment],
    ) -> Result<()> {
        let mut unplaced = Vec::new();
        for comment in comments {
            let file = files
                .iter()
                .find(|f| f.file_path() == comment.file_path || f.old_path == comment.file_path)
                .context("comment references a file outside the diff")?;

            // Only lines the diff actually touched can anchor an inline
            // position; anything else goes into the summary note.
            if !position_in_diff(file, comment) {
                unplaced.push(comment);
                continue;
            }
            self.gitlab
                .publish_inline_comment(
                    project,
                    iid,
                    diff_refs,
                    &file.old_path,
                    &file.new_path,
                    comment,
                )
                .await?;
        }

        if !unplaced.is_empty() {
            let mut body = String::from("General review notes:\n\n");
            for comment in &unplaced {
                body.push_str(&format!("- **{}**: {}\n", comment.file_path, comment.body));
            }
            self.gitlab.publish_summary_note(project, iid, &body).await?;
        }
        Ok(())
    }
}

/// True when the comment's line numbers land on a `+`/`-` line of the
/// file's hunks.
fn position_in_diff(file: &FileDiff, comment: &ReviewComment) -> bool {
    if comment.new_line.is_none() && comment.old_line.is_none() {
        return false;
    }
    file.changed_line_positions().iter().any(|position| {
        let new_matches = match (comment.new_line, position.new_line) {
            (Some(wanted), Some(have)) => wanted == have as u64,
            _ => false,
        };
        let old_matches = match (comment.old_line, position.old_line) {
            (Some(wanted), Some(have)) => wanted == have as u64,
            _ => false,
        };
        new_matches || old_matches
    })
}

/// Drops findings that cannot be mapped back to a file in the diff; the
/// publisher must never guess a position.
fn retain_mapped_comments(comments: Vec<ReviewComment>, files: &[FileDiff]) -> Vec<ReviewComment> {
    comments
        .into_iter()
        .filter(|comment| {
            let known = files
                .iter()
                .any(|f| f.file_path() == comment.file_path || f.old_path == comment.file_path);
            if !known {
                warn!(
                    "dropping comment for unknown file {}: {}",
                    comment.file_path, comment.body
                );
            }
            known
        })
        .collect()
}

pub fn summary_markdown(title: &str, summary: &DiffSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", title));
    out.push_str(&format!(
        "- files: {} ({} added, {} modified, {} deleted, {} renamed)\n",
        summary.total_files,
        summary.added_files,
        summary.modified_files,
        summary.deleted_files,
        summary.renamed_files
    ));
    out.push_str(&format!(
        "- lines: +{} / -{}\n",
        summary.total_added_lines, summary.total_removed_lines
    ));
    out.push_str(&format!(
        "- estimated tokens: {}\n",
        summary.total_estimated_tokens
    ));
    if summary.binary_files > 0 {
        out.push_str(&format!("- binary files: {}\n", summary.binary_files));
    }
    if !summary.largest_files.is_empty() {
        out.push_str("\nLargest files:\n");
        for file in &summary.largest_files {
            out.push_str(&format!(
                "- {} (~{} tokens)\n",
                file.path, file.estimated_tokens
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RawDiffEntry;

    fn parsed_file(path: &str) -> FileDiff {
        FileDiff::from_entry(&RawDiffEntry {
            old_path: path.to_string(),
            new_path: path.to_string(),
            diff: "@@ -1,1 +1,1 @@\n-x\n+y\n".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn comment(path: &str) -> ReviewComment {
        ReviewComment {
            file_path: path.to_string(),
            old_line: None,
            new_line: Some(1),
            severity: None,
            body: "check this".to_string(),
        }
    }

    #[test]
    fn comments_for_unknown_files_are_dropped() {
        let files = vec![parsed_file("a.rs")];
        let kept = retain_mapped_comments(vec![comment("a.rs"), comment("phantom.rs")], &files);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].file_path, "a.rs");
    }

    #[test]
    fn positions_outside_the_diff_are_rejected() {
        let file = parsed_file("a.rs");
        let mut on_changed_line = comment("a.rs");
        on_changed_line.new_line = Some(1);
        assert!(position_in_diff(&file, &on_changed_line));

        let mut on_untouched_line = comment("a.rs");
        on_untouched_line.new_line = Some(99);
        assert!(!position_in_diff(&file, &on_untouched_line));

        let mut no_line = comment("a.rs");
        no_line.new_line = None;
        assert!(!position_in_diff(&file, &no_line));
    }

    #[test]
    fn report_markdown_lists_findings() {
        let report = ReviewReport {
            project: "group/app".to_string(),
            merge_request_iid: 7,
            title: "Fix pagination".to_string(),
            state: ReviewState::Completed,
            model: "gpt-4o".to_string(),
            summary: DiffSummary::default(),
            chunks: 1,
            failed_chunks: 0,
            comments: vec![comment("a.rs")],
            usage: Usage::default(),
            generated_at: Utc::now(),
        };
        let markdown = report.to_markdown();
        assert!(markdown.contains("Fix pagination"));
        assert!(markdown.contains("a.rs:1"));
    }

    #[test]
    fn report_serializes_to_json() {
        let report = ReviewReport {
            project: "group/app".to_string(),
            merge_request_iid: 7,
            title: "Fix pagination".to_string(),
            state: ReviewState::Completed,
            model: "gpt-4o".to_string(),
            summary: DiffSummary::default(),
            chunks: 1,
            failed_chunks: 0,
            comments: Vec::new(),
            usage: Usage::default(),
            generated_at: Utc::now(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"generated_at\""));
        assert!(json.contains("\"state\":\"completed\""));
    }

    #[test]
    fn summary_markdown_is_markdown_not_json() {
        let summary = DiffSummary::default();
        let body = summary_markdown("MR title", &summary);
        assert!(body.starts_with("# "));
        assert!(serde_json::from_str::<serde_json::Value>(&body).is_err());
    }

    #[test]
    fn summary_markdown_mentions_largest_files() {
        let parser = DiffParser::new(1000).unwrap();
        let files = vec![parsed_file("big.rs")];
        let summary = parser.get_diff_summary(&files);
        let markdown = summary_markdown("MR title", &summary);
        assert!(markdown.contains("big.rs"));
        assert!(markdown.contains("files: 1"));
    }
}
