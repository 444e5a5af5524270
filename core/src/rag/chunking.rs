//! Character-count chunking with overlap (spec.md §4.11 defaults: 800
//! chars / 100 overlap).

pub const DEFAULT_CHUNK_SIZE: usize = 800;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
}

/// Splits `text` into overlapping chunks of `chunk_size` characters,
/// stepping forward by `chunk_size - overlap` each time. A `chunk_size`
/// not greater than `overlap` would never advance, so it falls back to a
/// non-overlapping chunk size of `chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let step = if overlap < chunk_size { chunk_size - overlap } else { chunk_size };

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk_text: String = chars[start..end].iter().collect();
        chunks.push(TextChunk {
            index,
            start_offset: start,
            end_offset: end,
            text: chunk_text,
        });
        index += 1;
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_produces_one_chunk() {
        let chunks = chunk_text("hello world", DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn long_text_overlaps_between_consecutive_chunks() {
        let text = "a".repeat(2000);
        let chunks = chunk_text(&text, 800, 100);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].end_offset - chunks[1].start_offset, 100);
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_text("", 800, 100).is_empty());
    }

    #[test]
    fn chunks_cover_the_whole_text_without_gaps() {
        let text = "x".repeat(1000);
        let chunks = chunk_text(&text, 300, 50);
        for window in chunks.windows(2) {
            assert!(window[1].start_offset <= window[0].end_offset);
        }
        assert_eq!(chunks.last().unwrap().end_offset, 1000);
    }
}
