use serde::{Deserialize, Serialize};

use super::tokenizer::token_windows;
use super::utils::compute_id;

/// Text chunk produced by the chunker, stored in `text_chunks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content hash id (`chunk-...`)
    pub id: String,
    pub content: String,
    /// Token count of `content`
    pub tokens: usize,
    pub chunk_order_index: usize,
    pub full_doc_id: String,
    #[serde(default)]
    pub file_path: String,
}

/// Chunking strategy.
#[derive(Debug, Clone, Copy, Default)]
pub enum ChunkingStrategy {
    /// Token windows with overlap (default)
    #[default]
    Tokens,
}

/// Token chunker with overlap.
#[derive(Debug, Clone)]
pub struct Chunker {
    size: usize,
    overlap: usize,
    strategy: ChunkingStrategy,
}

impl Chunker {
    /// Create a new chunker.
    pub fn new(size: usize, overlap: usize) -> Self {
        Self::with_strategy(size, overlap, ChunkingStrategy::default())
    }

    /// Create with custom strategy.
    pub fn with_strategy(size: usize, overlap: usize, strategy: ChunkingStrategy) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
            strategy,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split a document into overlapping chunks.
    pub fn chunk(&self, text: &str, full_doc_id: &str, file_path: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        match self.strategy {
            ChunkingStrategy::Tokens => token_windows(text, self.size, self.overlap)
                .into_iter()
                .map(|(content, tokens)| (content.trim().to_string(), tokens))
                .filter(|(content, _)| !content.is_empty())
                .enumerate()
                .map(|(index, (content, tokens))| Chunk {
                    id: compute_id("chunk-", &content),
                    content,
                    tokens,
                    chunk_order_index: index,
                    full_doc_id: full_doc_id.to_string(),
                    file_path: file_path.to_string(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunker = Chunker::new(10, 2);
        assert!(chunker.chunk("", "doc-1", "a.txt").is_empty());
        assert!(chunker.chunk("   \n\t  ", "doc-1", "a.txt").is_empty());
    }

    #[test]
    fn size_and_overlap_are_clamped() {
        let chunker = Chunker::new(0, 5);
        assert_eq!(chunker.size(), 1);
        assert_eq!(chunker.overlap(), 0);

        let chunker = Chunker::new(10, 50);
        assert_eq!(chunker.overlap(), 9);
    }

    #[test]
    fn chunks_carry_document_metadata_in_order() {
        let text = (0..200).map(|i| format!("token{i}")).collect::<Vec<_>>().join(" ");
        let chunks = Chunker::new(40, 5).chunk(&text, "doc-abc", "notes.md");
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_order_index, i);
            assert_eq!(chunk.full_doc_id, "doc-abc");
            assert_eq!(chunk.file_path, "notes.md");
            assert!(chunk.id.starts_with("chunk-"));
            assert!(chunk.tokens <= 40);
        }
    }

    #[test]
    fn identical_content_gets_identical_id() {
        let chunker = Chunker::new(100, 0);
        let a = chunker.chunk("same text", "doc-1", "a");
        let b = chunker.chunk("same text", "doc-2", "b");
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = Chunker::new(1200, 100).chunk("Alice works at Acme.", "doc-1", "f");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Alice works at Acme.");
    }
}
