pub mod chunk;
pub mod error;
pub mod file_diff;
pub mod parser;

pub use chunk::DiffChunk;
pub use error::DiffError;
pub use file_diff::{ChangeType, FileDiff, LinePosition, RawDiffEntry};
pub use parser::{DiffParser, DiffSummary, FileContext};
