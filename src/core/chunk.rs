use serde::Serialize;

use crate::core::file_diff::FileDiff;

/// One LLM-submission-sized group of file diffs.
///
/// Chunks borrow from the parsed file sequence and are only mutated while
/// the chunker runs; callers receive them fully built. The running token
/// total is the sum of the member files' estimates, so per-file and
/// per-chunk accounting always agree.
#[derive(Debug, Clone, Serialize)]
pub struct DiffChunk<'a> {
    files: Vec<&'a FileDiff>,
    estimated_tokens: usize,
}

impl<'a> DiffChunk<'a> {
    pub(crate) fn new() -> Self {
        Self {
            files: Vec::new(),
            estimated_tokens: 0,
        }
    }

    pub(crate) fn push(&mut self, file: &'a FileDiff) {
        self.estimated_tokens += file.estimated_tokens;
        self.files.push(file);
    }

    pub fn files(&self) -> &[&'a FileDiff] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    /// Concatenated text of every member file, in chunk order. This is the
    /// content handed to the LLM as-is.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            out.push_str(&file.render());
            out.push('\n');
        }
        out
    }
}
