#[cfg(test)]
mod tests;

use std::ops::Range;
use std::sync::LazyLock;

use fancy_regex::Regex;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;

/// Line starts that open a definition in the common source languages
static DEFINITION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:pub(?:\([^)\n]*\))?[ \t]+|export[ \t]+)?(?:async[ \t]+)?(?:def|class|fn|impl|struct|enum|trait|mod|function|interface)\b",
    )
    .expect("regex is valid")
});

/// Configuration for content chunking, measured in characters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum span length
    pub chunk_size: usize,
    /// Characters each span repeats from the end of the previous one
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

/// A verbatim slice of a source document, ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub text: String,
    /// Position of this span within the document
    pub index: usize,
    /// Character offset of the first character (inclusive)
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    /// Number of leading characters shared with the previous span
    pub overlap: usize,
}

impl ChunkSpan {
    /// The part of this span not already covered by the previous one
    #[inline]
    pub fn fresh_text(&self) -> String {
        self.text.chars().skip(self.overlap).collect()
    }

    /// Span length in characters
    #[inline]
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Prose,
    Code,
}

/// Splits documents into bounded, overlapping spans along semantic boundaries.
///
/// Break points are chosen in priority order: definition starts (code mode only),
/// paragraph breaks, line breaks (code mode only), sentence ends, the edges of
/// fenced code blocks, and finally a hard cut at `chunk_size`. Break points that
/// fall inside a fenced code block are never used.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    #[inline]
    pub fn new(config: ChunkingConfig) -> Result<Self, ConfigError> {
        if config.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }
        if config.overlap >= config.chunk_size {
            return Err(ConfigError::OverlapTooLarge(
                config.overlap,
                config.chunk_size,
            ));
        }

        Ok(Self { config })
    }

    #[inline]
    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Chunk prose such as documentation pages and READMEs
    #[inline]
    pub fn chunk(&self, text: &str) -> Vec<ChunkSpan> {
        self.split(text, Mode::Prose)
    }

    /// Chunk source code, preferring to cut where a new definition begins
    #[inline]
    pub fn chunk_code(&self, text: &str) -> Vec<ChunkSpan> {
        self.split(text, Mode::Code)
    }

    fn split(&self, text: &str, mode: Mode) -> Vec<ChunkSpan> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let ChunkingConfig {
            chunk_size,
            overlap,
        } = self.config;

        if total == 0 {
            return Vec::new();
        }

        if total <= chunk_size {
            return vec![ChunkSpan {
                text: text.to_string(),
                index: 0,
                start: 0,
                end: total,
                overlap: 0,
            }];
        }

        let boundaries = Boundaries::detect(text, &chars, mode);
        let min_len = (overlap + 1).max(chunk_size / 2);

        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let hard_end = (start + chunk_size).min(total);
            let end = if hard_end == total {
                total
            } else {
                let end = boundaries.best_break(start + min_len, hard_end);
                boundaries.keep_block_whole(end, start + overlap, chunk_size - overlap)
            };

            spans.push(ChunkSpan {
                text: chars[start..end].iter().collect(),
                index: spans.len(),
                start,
                end,
                overlap: if spans.is_empty() { 0 } else { overlap },
            });

            if end == total {
                break;
            }
            start = end - overlap;
        }

        debug!(
            "Chunked {} characters into {} spans ({:?} mode, size {}, overlap {})",
            total,
            spans.len(),
            mode,
            chunk_size,
            overlap
        );

        spans
    }
}

/// Convenience wrapper that validates the configuration and chunks prose in one call
#[inline]
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<ChunkSpan>, ConfigError> {
    let chunker = Chunker::new(ChunkingConfig {
        chunk_size,
        overlap,
    })?;
    Ok(chunker.chunk(text))
}

/// Candidate break points for one document, grouped by priority
struct Boundaries {
    /// Sorted character offsets, highest priority tier first
    tiers: Vec<Vec<usize>>,
    /// Character ranges covered by fenced code blocks
    code_blocks: Vec<Range<usize>>,
}

impl Boundaries {
    fn detect(text: &str, chars: &[char], mode: Mode) -> Self {
        let byte_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let to_char = |byte: usize| byte_offsets.partition_point(|&b| b < byte);

        let code_blocks: Vec<Range<usize>> = Parser::new(text)
            .into_offset_iter()
            .filter_map(|(event, range)| match event {
                Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(_))) => {
                    Some(to_char(range.start)..to_char(range.end))
                }
                _ => None,
            })
            .collect();

        let total = chars.len();
        let positions = 2..total;
        let paragraphs: Vec<usize> = positions
            .clone()
            .filter(|&p| chars[p - 1] == '\n' && chars[p - 2] == '\n' && chars[p] != '\n')
            .collect();
        let sentences: Vec<usize> = positions
            .filter(|&p| matches!(chars[p - 2], '.' | '!' | '?') && chars[p - 1].is_whitespace())
            .collect();
        let mut fence_edges: Vec<usize> = code_blocks
            .iter()
            .flat_map(|block| [block.start, block.end])
            .filter(|&p| p > 0 && p < total)
            .collect();
        fence_edges.sort_unstable();
        fence_edges.dedup();

        let tiers = match mode {
            Mode::Prose => vec![paragraphs, sentences, fence_edges],
            Mode::Code => {
                let definitions: Vec<usize> = DEFINITION_START
                    .find_iter(text)
                    .filter_map(Result::ok)
                    .map(|m| to_char(m.start()))
                    .filter(|&p| p > 0)
                    .collect();
                let lines: Vec<usize> = (1..total).filter(|&p| chars[p - 1] == '\n').collect();
                vec![definitions, paragraphs, lines, sentences, fence_edges]
            }
        };

        Self { tiers, code_blocks }
    }

    fn inside_code_block(&self, position: usize) -> bool {
        self.code_blocks
            .iter()
            .any(|block| block.start < position && position < block.end)
    }

    /// Move a cut that would split a fenced block back to the block's opening fence.
    ///
    /// Only done when the block fits in `room` characters, so the next span can hold
    /// it whole, and the opening fence lies past `floor`.
    fn keep_block_whole(&self, end: usize, floor: usize, room: usize) -> usize {
        self.code_blocks
            .iter()
            .find(|block| block.start < end && end < block.end)
            .filter(|block| block.start > floor && block.end - block.start <= room)
            .map_or(end, |block| block.start)
    }

    /// Latest usable break in `lo..=hi`, falling back to a hard cut at `hi`
    fn best_break(&self, lo: usize, hi: usize) -> usize {
        for tier in &self.tiers {
            let upper = tier.partition_point(|&p| p <= hi);
            let found = tier[..upper]
                .iter()
                .rev()
                .take_while(|&&p| p >= lo)
                .find(|&&p| !self.inside_code_block(p));
            if let Some(&position) = found {
                return position;
            }
        }
        hi
    }
}
