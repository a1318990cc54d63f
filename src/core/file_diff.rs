use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::core::error::DiffError;
use crate::core::parser::estimate_tokens;

static HUNK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@ -(\d+)(?:,\d+)? \+(\d+)(?:,\d+)? @@").unwrap());

/// One changed-file entry as delivered by the source-control API.
///
/// Mirrors the GitLab merge request `changes` payload. Optional fields get
/// documented defaults: `binary_file` false, `diff` empty (pure renames
/// carry no diff text).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDiffEntry {
    #[serde(default)]
    pub old_path: String,
    #[serde(default)]
    pub new_path: String,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
    #[serde(default)]
    pub binary_file: bool,
    #[serde(default)]
    pub a_mode: Option<String>,
    #[serde(default)]
    pub b_mode: Option<String>,
    #[serde(default)]
    pub diff: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
            ChangeType::Renamed => "renamed",
            ChangeType::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Old/new line numbers of one `+` or `-` line, recovered from the hunk
/// headers. Added lines carry only `new_line`, removed lines only
/// `old_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinePosition {
    pub old_line: Option<usize>,
    pub new_line: Option<usize>,
}

/// One file's change within a merge request diff.
///
/// Built once by [`DiffParser::parse`](crate::core::DiffParser::parse) and
/// immutable afterwards; chunks borrow from the parsed sequence.
#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub old_path: String,
    pub new_path: String,
    pub file_mode: Option<String>,
    pub change_type: ChangeType,
    pub is_binary: bool,
    /// Raw diff-text lines (`@@` headers, ` `/`+`/`-` prefixed lines),
    /// preserved exactly in the received order.
    pub hunks: Vec<String>,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub estimated_tokens: usize,
}

impl FileDiff {
    /// Builds a `FileDiff` from one raw API entry.
    ///
    /// Fails only when the entry names no file at all; everything else is
    /// absorbed (empty diff text, binary files, missing modes).
    pub fn from_entry(entry: &RawDiffEntry) -> Result<Self, DiffError> {
        if entry.old_path.is_empty() && entry.new_path.is_empty() {
            return Err(DiffError::EmptyPaths);
        }

        let change_type = classify(entry);
        let hunks: Vec<String> = entry.diff.lines().map(str::to_string).collect();
        let (added_lines, removed_lines) = count_changed_lines(&hunks);

        let file_mode = match change_type {
            ChangeType::Deleted => entry.a_mode.clone(),
            _ => entry.b_mode.clone().or_else(|| entry.a_mode.clone()),
        };

        let mut diff = Self {
            old_path: entry.old_path.clone(),
            new_path: entry.new_path.clone(),
            file_mode,
            change_type,
            is_binary: entry.binary_file,
            hunks,
            added_lines,
            removed_lines,
            estimated_tokens: 0,
        };
        diff.estimated_tokens = estimate_tokens(&diff.render());
        Ok(diff)
    }

    /// The path a reviewer would refer to: the new path, falling back to
    /// the old one for deletions.
    pub fn file_path(&self) -> &str {
        if self.new_path.is_empty() {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    pub fn file_extension(&self) -> &str {
        Path::new(self.file_path())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
    }

    /// Text representation submitted to the LLM: a one-line file header
    /// followed by the raw hunk lines. Token estimates are computed over
    /// exactly this text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("### ");
        out.push_str(self.file_path());
        out.push_str(" (");
        if self.change_type == ChangeType::Renamed {
            out.push_str("renamed from ");
            out.push_str(&self.old_path);
        } else {
            out.push_str(&self.change_type.to_string());
        }
        out.push_str(")\n");

        if self.is_binary {
            out.push_str("Binary file, diff omitted\n");
            return out;
        }
        for line in &self.hunks {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Positions of every `+`/`-` line, walking the hunk headers. Used to
    /// map review comments back onto exact diff lines.
    pub fn changed_line_positions(&self) -> Vec<LinePosition> {
        let mut positions = Vec::new();
        let mut old_line = 0usize;
        let mut new_line = 0usize;
        let mut in_hunk = false;

        for line in &self.hunks {
            if let Some(caps) = HUNK_HEADER.captures(line) {
                old_line = caps[1].parse().unwrap_or(0);
                new_line = caps[2].parse().unwrap_or(0);
                in_hunk = true;
                continue;
            }
            if !in_hunk {
                continue;
            }
            if line.starts_with("+++") || line.starts_with("---") {
                continue;
            }
            match line.chars().next() {
                Some('+') => {
                    positions.push(LinePosition {
                        old_line: None,
                        new_line: Some(new_line),
                    });
                    new_line += 1;
                }
                Some('-') => {
                    positions.push(LinePosition {
                        old_line: Some(old_line),
                        new_line: None,
                    });
                    old_line += 1;
                }
                _ => {
                    old_line += 1;
                    new_line += 1;
                }
            }
        }
        positions
    }
}

fn classify(entry: &RawDiffEntry) -> ChangeType {
    if entry.new_file {
        ChangeType::Added
    } else if entry.deleted_file {
        ChangeType::Deleted
    } else if !entry.old_path.is_empty()
        && !entry.new_path.is_empty()
        && entry.old_path != entry.new_path
    {
        ChangeType::Renamed
    } else {
        ChangeType::Modified
    }
}

/// Counts added/removed lines by raw line prefix. The match is anchored at
/// column 0 on the unstripped line; the `+++`/`---` file-header lines are
/// the only exclusions. Matching on stripped text would misread indented
/// context lines.
fn count_changed_lines(hunks: &[String]) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in hunks {
        if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }
    (added, removed)
}
