//! File fracturing for swarm mode.
//!
//! Splits one large input into line-bounded micro-chunks so oversized files
//! fit per-task size limits and saturate swarm concurrency. Consecutive
//! chunks share a small line overlap to preserve cross-chunk context.

use std::path::{Path, PathBuf};

/// Characters-per-token heuristic used for chunk sizing.
const CHARS_PER_TOKEN: usize = 4;

/// Lines shared between consecutive chunks.
const OVERLAP_LINES: usize = 5;

/// Default chunk budget in estimated tokens.
pub const DEFAULT_MAX_TOKENS_PER_CHUNK: usize = 25_000;

/// One content-bounded slice of a source file. Line numbers are 1-based
/// and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Path of the fractured file.
    pub path: PathBuf,
    /// Chunk content.
    pub content: String,
    /// First line of the chunk in the original file.
    pub start_line: usize,
    /// Last line of the chunk in the original file.
    pub end_line: usize,
}

/// Fractures `content` into chunks of at most `max_tokens_per_chunk`
/// estimated tokens, with a [`OVERLAP_LINES`]-line overlap between
/// consecutive chunks. A file under the budget yields exactly one chunk.
pub fn fracture_file(path: &Path, content: &str, max_tokens_per_chunk: usize) -> Vec<FileChunk> {
    let lines: Vec<&str> = content.split('\n').collect();
    let max_chars = max_tokens_per_chunk * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_chars = 0usize;
    let mut start_line = 1usize;

    for (i, line) in lines.iter().enumerate() {
        if current_chars + line.len() > max_chars && !current.is_empty() {
            chunks.push(FileChunk {
                path: path.to_path_buf(),
                content: current.join("\n"),
                start_line,
                end_line: i,
            });

            let overlap_start = current.len().saturating_sub(OVERLAP_LINES);
            let overlap: Vec<&str> = current[overlap_start..].to_vec();
            current_chars = overlap.iter().map(|l| l.len()).sum::<usize>() + line.len();
            current = overlap;
            current.push(line);
            start_line = (i + 1).saturating_sub(OVERLAP_LINES).max(1);
        } else {
            current_chars += line.len();
            current.push(line);
        }
    }

    if !current.is_empty() {
        chunks.push(FileChunk {
            path: path.to_path_buf(),
            content: current.join("\n"),
            start_line,
            end_line: lines.len(),
        });
    }

    chunks
}
