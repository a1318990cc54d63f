use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::core::chunk::DiffChunk;
use crate::core::error::DiffError;
use crate::core::file_diff::{ChangeType, FileDiff, RawDiffEntry};

/// Divisor for the length-based token approximation. Tuned against typical
/// LLM tokenizers on diff text; must stay identical for per-file and
/// per-chunk accounting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Number of entries reported in [`DiffSummary::largest_files`].
const LARGEST_FILES: usize = 5;

/// Cheap, deterministic token estimate: `ceil(len / CHARS_PER_TOKEN)`.
/// Monotonic in content length; never an exact tokenizer call.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Parses raw merge-request diff payloads into [`FileDiff`]s and packs them
/// into token-bounded [`DiffChunk`]s.
///
/// Holds only the validated chunk budget; every operation takes `&self` and
/// is a pure transformation, safe to call repeatedly or concurrently.
#[derive(Debug, Clone)]
pub struct DiffParser {
    max_chunk_tokens: usize,
}

impl DiffParser {
    /// Fails on a zero budget rather than substituting a default.
    pub fn new(max_chunk_tokens: usize) -> Result<Self, DiffError> {
        if max_chunk_tokens == 0 {
            return Err(DiffError::InvalidMaxTokens(0));
        }
        Ok(Self { max_chunk_tokens })
    }

    pub fn max_chunk_tokens(&self) -> usize {
        self.max_chunk_tokens
    }

    /// Transforms raw entries into `FileDiff`s, preserving input order.
    ///
    /// Entries that name no file are logged and skipped; the rest of the
    /// batch still parses. The result is never longer than the input.
    pub fn parse(&self, entries: &[RawDiffEntry]) -> Vec<FileDiff> {
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            match FileDiff::from_entry(entry) {
                Ok(file) => files.push(file),
                Err(err) => {
                    warn!("skipping malformed diff entry: {}", err);
                }
            }
        }
        files
    }

    /// Parses an untyped JSON payload, as read straight off the API or from
    /// a saved response file.
    ///
    /// The overall shape is checked strictly: anything other than an array
    /// of objects is an integration error and fails the whole call.
    /// Entries inside that fail field-level deserialization are logged and
    /// skipped like any other malformed entry.
    pub fn parse_payload(&self, payload: &Value) -> Result<Vec<FileDiff>, DiffError> {
        let items = payload
            .as_array()
            .ok_or(DiffError::InvalidPayload(json_kind(payload)))?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            if !item.is_object() {
                return Err(DiffError::InvalidPayload(json_kind(item)));
            }
            match serde_json::from_value::<RawDiffEntry>(item.clone()) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("skipping undeserializable diff entry: {}", err);
                }
            }
        }
        Ok(self.parse(&entries))
    }

    /// Packs files into the fewest chunks a first-fit pass yields, never
    /// reordering and never dropping a file.
    ///
    /// A file too large for the budget on its own still becomes a chunk of
    /// one; downstream callers may truncate it, the chunker does not.
    /// Output is a pure function of the input order and the budget.
    pub fn chunk_large_diff<'a>(&self, files: &'a [FileDiff]) -> Vec<DiffChunk<'a>> {
        let mut chunks = Vec::new();
        let mut current = DiffChunk::new();

        for file in files {
            if !current.is_empty()
                && current.estimated_tokens() + file.estimated_tokens > self.max_chunk_tokens
            {
                chunks.push(std::mem::replace(&mut current, DiffChunk::new()));
            }
            current.push(file);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Aggregate statistics over a parsed diff, for logs, reports and LLM
    /// preamble context.
    pub fn get_diff_summary(&self, files: &[FileDiff]) -> DiffSummary {
        let mut summary = DiffSummary {
            total_files: files.len(),
            ..Default::default()
        };

        for file in files {
            match file.change_type {
                ChangeType::Added => summary.added_files += 1,
                ChangeType::Modified => summary.modified_files += 1,
                ChangeType::Deleted => summary.deleted_files += 1,
                ChangeType::Renamed => summary.renamed_files += 1,
                ChangeType::Unknown => summary.unknown_files += 1,
            }
            summary.total_added_lines += file.added_lines;
            summary.total_removed_lines += file.removed_lines;
            summary.total_estimated_tokens += file.estimated_tokens;
            if file.is_binary {
                summary.binary_files += 1;
            }
        }

        let mut ranked: Vec<LargestFile> = files
            .iter()
            .map(|f| LargestFile {
                path: f.file_path().to_string(),
                estimated_tokens: f.estimated_tokens,
            })
            .collect();
        // Stable sort keeps original order for equal sizes.
        ranked.sort_by(|a, b| b.estimated_tokens.cmp(&a.estimated_tokens));
        ranked.truncate(LARGEST_FILES);
        summary.largest_files = ranked;

        summary
    }

    /// Single-file descriptor for prompt context and reports.
    pub fn extract_file_context(&self, file: &FileDiff) -> FileContext {
        FileContext {
            path: file.file_path().to_string(),
            extension: file.file_extension().to_string(),
            language: detect_language(file.file_extension()).to_string(),
            change_type: file.change_type,
            added_lines: file.added_lines,
            removed_lines: file.removed_lines,
            is_binary: file.is_binary,
            estimated_tokens: file.estimated_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffSummary {
    pub total_files: usize,
    pub added_files: usize,
    pub modified_files: usize,
    pub deleted_files: usize,
    pub renamed_files: usize,
    pub unknown_files: usize,
    pub total_added_lines: usize,
    pub total_removed_lines: usize,
    pub total_estimated_tokens: usize,
    pub binary_files: usize,
    pub largest_files: Vec<LargestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LargestFile {
    pub path: String,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub path: String,
    pub extension: String,
    pub language: String,
    pub change_type: ChangeType,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub is_binary: bool,
    pub estimated_tokens: usize,
}

/// Best-effort language label from a file extension. Unknown extensions map
/// to "unknown", never an error.
pub fn detect_language(extension: &str) -> &'static str {
    match extension {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "jsx" => "javascript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "php" => "php",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "html" | "htm" => "html",
        "css" | "scss" | "less" => "css",
        "md" => "markdown",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "xml" => "xml",
        _ => "unknown",
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> DiffParser {
        DiffParser::new(4000).unwrap()
    }

    fn entry(old: &str, new: &str, new_file: bool, deleted_file: bool, diff: &str) -> RawDiffEntry {
        RawDiffEntry {
            old_path: old.to_string(),
            new_path: new.to_string(),
            new_file,
            deleted_file,
            diff: diff.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_zero_chunk_budget() {
        assert!(matches!(
            DiffParser::new(0),
            Err(DiffError::InvalidMaxTokens(0))
        ));
    }

    #[test]
    fn parses_modified_file_with_counts() {
        // A hunk with a one-line removal, a replacement, and additions.
        let diff = "@@ -1,5 +1,7 @@\n def hello_world():\n-    print(\"Hello, World!\")\n+    print(\"Hello, Enhanced World!\")\n+    # Added a comment\n+    return True\n \n if __name__ == \"__main__\":\n";
        let files = parser().parse(&[entry("src/main.py", "src/main.py", false, false, diff)]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].change_type, ChangeType::Modified);
        assert_eq!(files[0].added_lines, 3);
        assert_eq!(files[0].removed_lines, 1);
    }

    #[test]
    fn parses_new_file_as_added() {
        let diff = "@@ -0,0 +1,3 @@\n+def f():\n+    return 1\n+\n";
        let files = parser().parse(&[entry("", "src/utils.py", true, false, diff)]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].change_type, ChangeType::Added);
        assert_eq!(files[0].added_lines, 3);
        assert_eq!(files[0].removed_lines, 0);
    }

    #[test]
    fn path_change_without_flags_is_renamed() {
        let diff = "@@ -1,2 +1,2 @@\n-Old\n+New\n Same\n";
        let files = parser().parse(&[entry("old.txt", "new.txt", false, false, diff)]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].change_type, ChangeType::Renamed);
        assert_eq!(files[0].old_path, "old.txt");
        assert_eq!(files[0].file_path(), "new.txt");
    }

    #[test]
    fn new_file_flag_wins_over_rename_shape() {
        let files = parser().parse(&[entry("a.txt", "b.txt", true, false, "")]);
        assert_eq!(files[0].change_type, ChangeType::Added);
    }

    #[test]
    fn malformed_entry_is_skipped_not_fatal() {
        let entries = vec![
            entry("a.rs", "a.rs", false, false, "@@ -1,1 +1,1 @@\n-x\n+y\n"),
            RawDiffEntry::default(),
            entry("b.rs", "b.rs", false, false, "@@ -1,1 +1,1 @@\n-p\n+q\n"),
        ];
        let files = parser().parse(&entries);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_path(), "a.rs");
        assert_eq!(files[1].file_path(), "b.rs");
    }

    #[test]
    fn parse_preserves_input_order() {
        let entries: Vec<RawDiffEntry> = (0..10)
            .map(|i| entry(&format!("f{i}.rs"), &format!("f{i}.rs"), false, false, ""))
            .collect();
        let files = parser().parse(&entries);
        assert!(files.len() <= entries.len());
        for (i, file) in files.iter().enumerate() {
            assert_eq!(file.file_path(), format!("f{i}.rs"));
        }
    }

    #[test]
    fn payload_must_be_an_array() {
        let err = parser().parse_payload(&json!("not a diff")).unwrap_err();
        assert!(matches!(err, DiffError::InvalidPayload("a string")));
    }

    #[test]
    fn payload_elements_must_be_objects() {
        let err = parser()
            .parse_payload(&json!([{"new_path": "a.rs"}, 42]))
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidPayload("a number")));
    }

    #[test]
    fn payload_defaults_optional_fields() {
        let files = parser()
            .parse_payload(&json!([
                {"old_path": "a.rs", "new_path": "a.rs", "new_file": false, "deleted_file": false}
            ]))
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(!files[0].is_binary);
        assert!(files[0].hunks.is_empty());
        assert_eq!(files[0].added_lines, 0);
    }

    fn sized_entry(path: &str, lines: usize) -> RawDiffEntry {
        let mut diff = String::from("@@ -0,0 +1,100 @@\n");
        for i in 0..lines {
            diff.push_str(&format!("+let value_{i} = compute_something_interesting();\n"));
        }
        entry("", path, true, false, &diff)
    }

    #[test]
    fn chunking_splits_when_budget_exceeded() {
        let parser = DiffParser::new(100).unwrap();
        let entries = vec![
            sized_entry("a.rs", 20),
            sized_entry("b.rs", 20),
            sized_entry("c.rs", 20),
        ];
        let files = parser.parse(&entries);
        let chunks = parser.chunk_large_diff(&files);
        assert!(chunks.len() >= 2);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 3);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn chunking_never_drops_files() {
        let parser = DiffParser::new(50).unwrap();
        let entries: Vec<RawDiffEntry> = (0..7)
            .map(|i| sized_entry(&format!("f{i}.rs"), 5 + i))
            .collect();
        let files = parser.parse(&entries);
        let chunks = parser.chunk_large_diff(&files);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, files.len());
    }

    #[test]
    fn chunk_order_preserves_file_order() {
        let parser = DiffParser::new(60).unwrap();
        let entries: Vec<RawDiffEntry> = (0..5)
            .map(|i| sized_entry(&format!("f{i}.rs"), 8))
            .collect();
        let files = parser.parse(&entries);
        let chunks = parser.chunk_large_diff(&files);
        let flattened: Vec<&str> = chunks
            .iter()
            .flat_map(|c| c.files().iter().map(|f| f.file_path()))
            .collect();
        let original: Vec<&str> = files.iter().map(|f| f.file_path()).collect();
        assert_eq!(flattened, original);
    }

    #[test]
    fn oversized_file_gets_its_own_chunk() {
        let parser = DiffParser::new(30).unwrap();
        let entries = vec![
            sized_entry("small.rs", 1),
            sized_entry("huge.rs", 200),
            sized_entry("tiny.rs", 1),
        ];
        let files = parser.parse(&entries);
        assert!(files[1].estimated_tokens > parser.max_chunk_tokens());
        let chunks = parser.chunk_large_diff(&files);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 3);
        let huge_chunk = chunks
            .iter()
            .find(|c| c.files().iter().any(|f| f.file_path() == "huge.rs"))
            .unwrap();
        assert_eq!(huge_chunk.len(), 1);
    }

    #[test]
    fn chunking_is_deterministic() {
        let parser = DiffParser::new(80).unwrap();
        let entries: Vec<RawDiffEntry> = (0..6)
            .map(|i| sized_entry(&format!("f{i}.rs"), 4 + 3 * i))
            .collect();
        let files = parser.parse(&entries);
        let first: Vec<usize> = parser.chunk_large_diff(&files).iter().map(|c| c.len()).collect();
        let second: Vec<usize> = parser.chunk_large_diff(&files).iter().map(|c| c.len()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_totals_round_trip_to_file_totals() {
        let parser = DiffParser::new(90).unwrap();
        let entries: Vec<RawDiffEntry> = (0..5)
            .map(|i| sized_entry(&format!("f{i}.rs"), 10))
            .collect();
        let files = parser.parse(&entries);
        let file_total: usize = files.iter().map(|f| f.estimated_tokens).sum();
        let chunk_total: usize = parser
            .chunk_large_diff(&files)
            .iter()
            .map(|c| c.estimated_tokens())
            .sum();
        assert_eq!(chunk_total, file_total);
    }

    #[test]
    fn summary_aggregates_by_change_type() {
        let entries = vec![
            entry("", "new.py", true, false, "@@ -0,0 +1,2 @@\n+a\n+b\n"),
            entry("mod.py", "mod.py", false, false, "@@ -1,1 +1,1 @@\n-a\n+b\n"),
            entry("dead.py", "", false, true, "@@ -1,2 +0,0 @@\n-a\n-b\n"),
            entry("was.py", "is.py", false, false, ""),
        ];
        let parser = parser();
        let files = parser.parse(&entries);
        let summary = parser.get_diff_summary(&files);
        assert_eq!(summary.total_files, 4);
        assert_eq!(summary.added_files, 1);
        assert_eq!(summary.modified_files, 1);
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.renamed_files, 1);
        assert_eq!(summary.total_added_lines, 3);
        assert_eq!(summary.total_removed_lines, 3);
        assert_eq!(summary.binary_files, 0);
    }

    #[test]
    fn summary_ranks_largest_files_with_stable_ties() {
        let entries = vec![
            sized_entry("small.rs", 1),
            sized_entry("big_one.rs", 40),
            sized_entry("tie_a.rs", 10),
            sized_entry("tie_b.rs", 10),
        ];
        let parser = parser();
        let files = parser.parse(&entries);
        let summary = parser.get_diff_summary(&files);
        assert_eq!(summary.largest_files[0].path, "big_one.rs");
        // Equal sizes keep their original relative order.
        let tie_a = summary
            .largest_files
            .iter()
            .position(|f| f.path == "tie_a.rs")
            .unwrap();
        let tie_b = summary
            .largest_files
            .iter()
            .position(|f| f.path == "tie_b.rs")
            .unwrap();
        assert!(tie_a < tie_b);
    }

    #[test]
    fn file_context_reports_language() {
        let parser = parser();
        let files = parser.parse(&[entry("", "api/server.py", true, false, "@@ -0,0 +1,1 @@\n+x\n")]);
        let ctx = parser.extract_file_context(&files[0]);
        assert_eq!(ctx.language, "python");
        assert_eq!(ctx.extension, "py");
        assert_eq!(ctx.change_type, ChangeType::Added);
        assert_eq!(ctx.added_lines, 1);
    }

    #[test]
    fn unknown_extension_maps_to_sentinel() {
        assert_eq!(detect_language("xyz"), "unknown");
        assert_eq!(detect_language(""), "unknown");
    }

    #[test]
    fn token_estimate_is_monotonic_and_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert!(estimate_tokens("a longer piece of text") >= estimate_tokens("short"));
    }
}
