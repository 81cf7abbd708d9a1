use text_splitter::{ChunkCapacity, ChunkConfig, MarkdownSplitter, TextSplitter};

use common::backends::embedding::estimate_tokens;
use common::error::AppError;
use common::storage::types::chunk::{ContentType, SplitMeta};

/// Chunks shorter than this are dropped as noise.
pub const CHUNK_MIN_CHARS: usize = 8;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Drop floor applied after splitting.
    pub min_chars: usize,
    /// Desired chunk size range handed to the splitter.
    pub target_min_chars: usize,
    pub target_max_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chars: CHUNK_MIN_CHARS,
            target_min_chars: 500,
            target_max_chars: 2_000,
        }
    }
}

/// A chunk before enrichment. `chunk_index`/`total_chunks` are local to the
/// sub-document; identity uses the global index when the file was split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    pub text: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub split: Option<SplitMeta>,
}

impl PendingChunk {
    /// The index identity derives from: global when split, local otherwise.
    pub fn identity_index(&self) -> usize {
        self.split
            .map_or(self.chunk_index, |s| s.chunk_index_global)
    }
}

/// Split raw file text into chunk candidates. Markdown gets the
/// paragraph-aware splitter; code and plain text use semantic line/paragraph
/// boundaries from the generic splitter.
pub fn split_text(
    text: &str,
    content_type: ContentType,
    extension: &str,
    config: &ChunkerConfig,
) -> Result<Vec<String>, AppError> {
    if config.target_min_chars == 0 || config.target_min_chars > config.target_max_chars {
        return Err(AppError::Validation(
            "invalid chunk size bounds; ensure 0 < min <= max".into(),
        ));
    }

    let capacity = ChunkCapacity::new(config.target_min_chars)
        .with_max(config.target_max_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk capacity: {e}")))?;

    let chunks: Vec<String> = if content_type == ContentType::Text
        && matches!(extension, "md" | "markdown")
    {
        let splitter = MarkdownSplitter::new(ChunkConfig::new(capacity));
        splitter.chunks(text).map(str::to_owned).collect()
    } else {
        let splitter = TextSplitter::new(ChunkConfig::new(capacity));
        splitter.chunks(text).map(str::to_owned).collect()
    };

    Ok(chunks
        .into_iter()
        .filter(|chunk| chunk.chars().count() >= config.min_chars)
        .collect())
}

/// Group a file's chunks into sub-documents so no contextualized-embedding
/// call exceeds `token_limit`. Files that fit yield one unsplit document.
pub fn apply_context_window(chunks: Vec<String>, token_limit: usize) -> Vec<PendingChunk> {
    let total_tokens: usize = chunks.iter().map(|c| estimate_tokens(c)).sum();
    let total = chunks.len();

    if total_tokens <= token_limit || total <= 1 {
        return chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| PendingChunk {
                text,
                chunk_index: i,
                total_chunks: total,
                split: None,
            })
            .collect();
    }

    // Greedy partition; an oversized single chunk still forms its own group.
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;

    for chunk in chunks {
        let tokens = estimate_tokens(&chunk);
        if !current.is_empty() && current_tokens + tokens > token_limit {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(chunk);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let split_total = groups.len();
    let mut global = 0usize;
    let mut out = Vec::with_capacity(total);

    for (split_index, group) in groups.into_iter().enumerate() {
        let group_len = group.len();
        for (local_index, text) in group.into_iter().enumerate() {
            out.push(PendingChunk {
                text,
                chunk_index: local_index,
                total_chunks: group_len,
                split: Some(SplitMeta {
                    split_index,
                    split_total,
                    chunk_index_global: global,
                }),
            });
            global += 1;
        }
    }

    out
}
