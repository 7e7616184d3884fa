//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters where each chunk begins exactly `overlap` characters before the
//! previous one ended. Sizes count Unicode scalar values, not bytes.
//!
//! # Algorithm
//!
//! 1. If the remaining text fits in one window, emit it as the final chunk.
//! 2. Otherwise look for a cut point inside the window, preferring the
//!    latest paragraph break (`\n\n`), then line break, then sentence end
//!    (`. `, `! `, `? `), then space. Each kind is searched over the whole
//!    window past the overlap before the next kind is considered, so an
//!    early paragraph break wins over a late space.
//! 3. With no boundary anywhere past the overlap, hard-cut at `chunk_size`.
//! 4. The next chunk starts at `cut - overlap`.
//!
//! Chunk text is the exact slice of the input, so dropping the first
//! `overlap` characters of every chunk after the first and concatenating
//! reproduces the original text.
//!
//! ```rust
//! use avivo::chunk::Chunker;
//!
//! let chunker = Chunker::new(512, 50).unwrap();
//! let chunks = chunker.split("doc.txt", &"A".repeat(600));
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].text.len(), 600 - 462);
//! ```

use crate::error::RagError;
use crate::models::Chunk;

/// Boundary kinds, highest preference first. Each pattern marks a cut
/// point immediately after the matched characters.
const BOUNDARIES: &[&[&[char]]] = &[
    &[&['\n', '\n']],
    &[&['\n']],
    &[&['.', ' '], &['!', ' '], &['?', ' ']],
    &[&[' '], &['\t']],
];

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, RagError> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(RagError::InvalidChunking {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Iterate the chunks of `text`. Calling again restarts from the beginning.
    pub fn iter<'a>(&self, source_id: &'a str, text: &str) -> ChunkIter<'a> {
        let chars: Vec<char> = if text.trim().is_empty() {
            Vec::new()
        } else {
            text.chars().collect()
        };
        ChunkIter {
            source_id,
            chars,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            start: 0,
            index: 0,
            done: false,
        }
    }

    /// Split `text` into chunks with contiguous indices starting at 0.
    /// Empty or whitespace-only text yields no chunks.
    pub fn split(&self, source_id: &str, text: &str) -> Vec<Chunk> {
        self.iter(source_id, text).collect()
    }
}

/// Lazily produced chunk sequence. See [`Chunker::iter`].
pub struct ChunkIter<'a> {
    source_id: &'a str,
    chars: Vec<char>,
    chunk_size: usize,
    overlap: usize,
    start: usize,
    index: usize,
    done: bool,
}

impl ChunkIter<'_> {
    fn next_cut(&self) -> usize {
        let hard = self.start + self.chunk_size;
        let earliest = self.start + self.overlap + 1;

        BOUNDARIES
            .iter()
            .find_map(|kind| last_boundary(&self.chars, earliest, hard, kind))
            .unwrap_or(hard)
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done || self.chars.is_empty() {
            return None;
        }

        let end = if self.start + self.chunk_size >= self.chars.len() {
            self.done = true;
            self.chars.len()
        } else {
            self.next_cut()
        };

        let chunk = Chunk {
            source_id: self.source_id.to_string(),
            index: self.index,
            text: self.chars[self.start..end].iter().collect(),
        };
        self.index += 1;
        self.start = end - self.overlap;
        Some(chunk)
    }
}

/// Latest cut position in `lo..=hi` that sits right after one of `patterns`.
fn last_boundary(chars: &[char], lo: usize, hi: usize, patterns: &[&[char]]) -> Option<usize> {
    (lo..=hi).rev().find(|&cut| {
        patterns
            .iter()
            .any(|p| cut >= p.len() && chars[cut - p.len()..cut] == **p)
    })
}

/// Convenience wrapper used by callers that hold raw config values.
pub fn chunk_text(
    source_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, RagError> {
    Ok(Chunker::new(chunk_size, overlap)?.split(source_id, text))
}
