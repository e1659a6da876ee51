//! Boundary-aware text chunking.
//!
//! Chunks target a fixed size with overlap, but the cut point is searched
//! within the last 30% of each chunk: paragraph break first, then newline,
//! then sentence end, then lesser punctuation. Line numbers are tracked for
//! file-backed indexes.

/// One chunk of a larger text.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub start_line: usize,
    pub end_line: usize,
}

const SENTENCE_BREAKS: &[&str] = &[". ", ".\n", "! ", "? ", ".\t"];
const PUNCT_BREAKS: &[&str] = &["; ", ": ", ", "];

/// Split text into overlapping chunks.
///
/// `chunk_size` and `overlap` are in characters; an overlap at or above the
/// chunk size is clamped to half of it. Whitespace-only chunks are skipped.
#[must_use]
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let normalized = text.replace("\r\n", "\n");
    let chars: Vec<char> = normalized.chars().collect();
    let total = chars.len();
    let chunk_size = chunk_size.max(1);
    let overlap = if overlap >= chunk_size {
        chunk_size / 2
    } else {
        overlap
    };

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < total {
        let mut end = (start + chunk_size).min(total);
        if end < total {
            end = find_boundary(&chars, start, end);
        }

        let body: String = chars[start..end].iter().collect();
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            let start_line = line_of(&chars, start);
            let end_line = line_of(&chars, end.saturating_sub(1));
            chunks.push(Chunk {
                text: trimmed.to_string(),
                index,
                char_start: start,
                char_end: end,
                start_line,
                end_line,
            });
            index += 1;
        }

        if end >= total {
            break;
        }
        // Step forward by at least one char so degenerate overlaps terminate.
        start = (end.saturating_sub(overlap)).max(start + 1);
    }

    chunks
}

/// Search the final 30% of the window for the best break point.
fn find_boundary(chars: &[char], start: usize, end: usize) -> usize {
    let window = end - start;
    let search_start = start + (window as f64 * 0.7) as usize;
    let haystack: String = chars[search_start..end].iter().collect();

    if let Some(pos) = haystack.rfind("\n\n") {
        return search_start + prefix_chars(&haystack, pos) + 2;
    }
    if let Some(pos) = haystack.rfind('\n') {
        return search_start + prefix_chars(&haystack, pos) + 1;
    }
    for pattern in SENTENCE_BREAKS {
        if let Some(pos) = haystack.rfind(pattern) {
            return search_start + prefix_chars(&haystack, pos) + pattern.chars().count();
        }
    }
    for pattern in PUNCT_BREAKS {
        if let Some(pos) = haystack.rfind(pattern) {
            return search_start + prefix_chars(&haystack, pos) + pattern.chars().count();
        }
    }
    end
}

/// Convert a byte offset within `text` to a char count.
fn prefix_chars(text: &str, byte_pos: usize) -> usize {
    text[..byte_pos].chars().count()
}

fn line_of(chars: &[char], position: usize) -> usize {
    chars[..position.min(chars.len())]
        .iter()
        .filter(|c| **c == '\n')
        .count()
        + 1
}
