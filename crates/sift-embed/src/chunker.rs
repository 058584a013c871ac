//! Token-bounded text chunking.
//!
//! Built on [`text_splitter::TextSplitter`], which splits at the coarsest
//! semantic level that fits (paragraphs, then sentences, then words, then
//! graphemes) and packs the pieces into chunks of at most `max_tokens`.
//! Consecutive chunks share up to `overlap_tokens` so context survives the
//! cut.
//!
//! Token counts are estimated as `ceil(chars / 4)`.

use std::fmt;

use sift_core::{Error, Result};
use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};

use crate::config::ChunkingConfig;

/// One chunk of an entity's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 0-based position.
    pub index: u32,
    /// Chunk text.
    pub text: String,
    /// Estimated token count of `text`.
    pub token_count: u32,
}

/// Estimated token count: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Measures chunks with [`estimate_tokens`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatedTokens;

impl ChunkSizer for EstimatedTokens {
    fn size(&self, chunk: &str) -> usize {
        estimate_tokens(chunk) as usize
    }
}

/// Splits text into token-bounded, overlapping chunks.
pub struct Chunker {
    splitter: TextSplitter<EstimatedTokens>,
    max_tokens: u32,
    overlap_tokens: u32,
}

impl Chunker {
    /// Create a chunker, rejecting `max_tokens == 0` and
    /// `overlap_tokens >= max_tokens`.
    pub fn new(max_tokens: u32, overlap_tokens: u32) -> Result<Self> {
        ChunkingConfig {
            max_tokens,
            overlap_tokens,
        }
        .validate()?;
        let config = ChunkConfig::new(max_tokens as usize)
            .with_sizer(EstimatedTokens)
            .with_trim(true)
            .with_overlap(overlap_tokens as usize)
            .map_err(|e| Error::config(format!("Invalid chunking limits: {e}")))?;
        Ok(Self {
            splitter: TextSplitter::new(config),
            max_tokens,
            overlap_tokens,
        })
    }

    /// Create a chunker from configuration.
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.max_tokens, config.overlap_tokens)
    }

    /// Split `text` into chunks. Blank text yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        self.splitter
            .chunks(text)
            .filter(|piece| !piece.trim().is_empty())
            .enumerate()
            .map(|(i, piece)| TextChunk {
                index: u32::try_from(i).unwrap_or(u32::MAX),
                text: piece.to_string(),
                token_count: estimate_tokens(piece),
            })
            .collect()
    }
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap_tokens", &self.overlap_tokens)
            .finish_non_exhaustive()
    }
}

/// Chunk `text` with the given limits.
pub fn chunk(text: &str, max_tokens: u32, overlap_tokens: u32) -> Result<Vec<TextChunk>> {
    Ok(Chunker::new(max_tokens, overlap_tokens)?.chunk(text))
}

// ============================================================================
// Tests
// ============================================================================
