use thiserror::Error;

/// Errors produced by the diff parsing and chunking core.
///
/// Only two conditions are fail-fast: an invalid chunk-size configuration
/// and a payload whose overall shape is wrong. Everything else (missing
/// fields, binary files, empty diffs) degrades gracefully.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("max_chunk_tokens must be a positive integer, got {0}")]
    InvalidMaxTokens(i64),

    #[error("diff payload must be an array of objects, got {0}")]
    InvalidPayload(&'static str),

    #[error("diff entry has neither old_path nor new_path")]
    EmptyPaths,
}
