//! Text cleaning and overlap-aware windowing.
//!
//! `clean_text` strips control, format, and emoji characters, normalizes to NFC,
//! and maps typographic punctuation to ASCII. `Chunker::chunk` then slides a
//! character window over the cleaned text, preferring to cut after a sentence
//! terminator in the second half of the window, then after whitespace, then hard.

use exo_core::config::ChunkingConfig;
use exo_core::types::{Chunk, ContentTag};
use unicode_normalization::UnicodeNormalization;

const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F600, 0x1F64F), // emoticons
    (0x1F300, 0x1F5FF), // pictographs
    (0x1F680, 0x1F6FF), // transport and map
    (0x1F1E0, 0x1F1FF), // regional indicators
    (0x2600, 0x27BF),   // misc symbols and dingbats
    (0x1F900, 0x1F9FF), // supplemental pictographs
    (0x1F018, 0x1F270), // enclosed and misc
    (0x1FA70, 0x1FAFF), // symbols and pictographs extended-a
];

fn is_emoji(c: char) -> bool {
    let cp = c as u32;
    EMOJI_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

fn is_format_char(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
            | '\u{FE00}'..='\u{FE0F}'
            | '\u{E0100}'..='\u{E01EF}'
    )
}

fn ascii_replacement(c: char) -> Option<&'static str> {
    Some(match c {
        '\u{2018}' | '\u{2019}' => "'",
        '\u{201C}' | '\u{201D}' => "\"",
        '\u{2013}' => "-",
        '\u{2014}' => "--",
        '\u{2026}' => "...",
        '\u{00A0}' => " ",
        '\u{00B0}' => " degrees",
        _ => return None,
    })
}

/// Normalize raw text before chunking.
///
/// Line endings become `\n`; tabs and newlines are the only control characters kept.
pub fn clean_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = unified
        .chars()
        .filter(|&c| !(c.is_control() && c != '\n' && c != '\t'))
        .filter(|&c| !is_format_char(c) && !is_emoji(c))
        .collect();

    let mut out = String::with_capacity(stripped.len());
    for c in stripped.nfc() {
        match ascii_replacement(c) {
            Some(rep) => out.push_str(rep),
            None => out.push(c),
        }
    }
    out
}

/// Splits cleaned text into overlapping character windows.
#[derive(Debug, Clone)]
pub struct Chunker {
    window_size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

impl Chunker {
    /// `overlap` is clamped below `window_size`; a zero window becomes 1.
    pub fn new(window_size: usize, overlap: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            overlap: overlap.min(window_size - 1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.window_size, config.overlap)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Clean `text` and cut it into chunks tagged by `hint_extension`.
    pub fn chunk(&self, source_id: &str, text: &str, hint_extension: Option<&str>) -> Vec<Chunk> {
        let tag = hint_extension
            .map(ContentTag::from_extension)
            .unwrap_or(ContentTag::Other);
        let cleaned = clean_text(text);
        let chars: Vec<char> = cleaned.chars().collect();

        let mut chunks = Vec::new();
        let mut push = |start: usize, end: usize| {
            let slice: String = chars[start..end].iter().collect();
            if slice.trim().is_empty() {
                return;
            }
            chunks.push(Chunk {
                source_id: source_id.to_string(),
                sequence_index: chunks.len(),
                byte_len: slice.len(),
                text: slice,
                tag,
                char_start: start,
                char_end: end,
            });
        };

        let n = chars.len();
        if n <= self.window_size {
            push(0, n);
            return chunks;
        }

        let mut start = 0;
        loop {
            let end = (start + self.window_size).min(n);
            let cut = if end < n {
                self.boundary(&chars, start, end)
            } else {
                end
            };
            push(start, cut);
            if cut >= n {
                break;
            }
            start = cut.saturating_sub(self.overlap).max(start + 1);
        }
        chunks
    }

    /// Cut position for the window `[start, end)`. Only the second half of the
    /// window is scanned.
    fn boundary(&self, chars: &[char], start: usize, end: usize) -> usize {
        let floor = start + self.window_size / 2;

        for i in (floor..end).rev() {
            let c = chars[i];
            let blank_line = c == '\n' && i > start && chars[i - 1] == '\n';
            if matches!(c, '.' | '!' | '?') || blank_line {
                return i + 1;
            }
        }
        for i in (floor..end).rev() {
            if chars[i].is_whitespace() {
                return i + 1;
            }
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the cleaned source from chunk offsets.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for c in chunks {
            assert!(c.char_start <= covered, "gap before chunk {}", c.sequence_index);
            let skip = covered - c.char_start;
            out.extend(c.text.chars().skip(skip));
            covered = c.char_end;
        }
        out
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("a.md", "Hello “world” — it’s fine…", Some("md"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello \"world\" -- it's fine...");
        assert_eq!(chunks[0].text, clean_text("Hello “world” — it’s fine…"));
        assert_eq!(chunks[0].tag, ContentTag::Doc);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].byte_len, chunks[0].text.len());
    }

    #[test]
    fn test_empty_and_whitespace_inputs() {
        let chunker = Chunker::default();
        assert!(chunker.chunk("a", "", None).is_empty());
        assert!(chunker.chunk("a", "   \n\t  ", None).is_empty());
    }

    #[test]
    fn test_clean_text_strips_emoji_and_format_chars() {
        let raw = "ok\u{200B}ay 😀 done\u{FEFF}\u{00AD}!\r\nnext\u{0007}line";
        assert_eq!(clean_text(raw), "okay  done!\nnextline");
    }

    #[test]
    fn test_clean_text_nfc() {
        // "e" + combining acute accent composes to a single char.
        let cleaned = clean_text("cafe\u{0301}");
        assert_eq!(cleaned, "caf\u{00E9}");
        assert_eq!(cleaned.chars().count(), 4);
    }

    #[test]
    fn test_clean_text_keeps_tabs_and_newlines() {
        assert_eq!(clean_text("a\tb\nc\rd"), "a\tb\nc\nd");
    }

    #[test]
    fn test_windows_reconstruct_source() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let chunker = Chunker::new(100, 20);
        let chunks = chunker.chunk("fox.txt", &text, Some("txt"));
        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&chunks), clean_text(&text));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
            assert!(c.text.chars().count() <= 100);
        }
    }

    #[test]
    fn test_overlap_between_consecutive_chunks() {
        let text = "word ".repeat(200);
        let chunker = Chunker::new(64, 10);
        let chunks = chunker.chunk("w", &text, None);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].char_start, pair[0].char_end - 10);
        }
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        // Period in the second half of the window, whitespace after it.
        let text = format!("{}. {}", "a".repeat(70), "b ".repeat(60));
        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("s", &text, None);
        assert!(chunks[0].text.ends_with('.'));
        assert_eq!(chunks[0].char_end, 71);
    }

    #[test]
    fn test_ignores_terminator_in_first_half() {
        let text = format!("{}. {}", "a".repeat(10), "b".repeat(200));
        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("s", &text, None);
        // No terminator or whitespace in the second half: hard cut.
        assert_eq!(chunks[0].char_end, 100);
    }

    #[test]
    fn test_falls_back_to_whitespace() {
        let text = format!("{} {}", "x".repeat(80), "y".repeat(100));
        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("w", &text, None);
        assert_eq!(chunks[0].char_end, 81);
        assert_eq!(chunks[1].char_start, 81);
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "z".repeat(250);
        let chunker = Chunker::new(100, 10);
        let chunks = chunker.chunk("z", &text, None);
        assert_eq!(chunks[0].char_end, 100);
        assert_eq!(chunks[1].char_start, 90);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn test_blank_line_is_a_boundary() {
        let text = format!("{}\n\n{}", "p".repeat(60), "q".repeat(100));
        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("b", &text, None);
        assert_eq!(chunks[0].char_end, 62);
    }

    #[test]
    fn test_multibyte_text_offsets_are_chars() {
        let text = "日本語のテキスト。".repeat(30);
        let chunker = Chunker::new(50, 5);
        let chunks = chunker.chunk("jp", &text, None);
        assert_eq!(reconstruct(&chunks), clean_text(&text));
        for c in &chunks {
            assert_eq!(c.text.chars().count(), c.char_end - c.char_start);
        }
    }

    #[test]
    fn test_large_overlap_still_advances() {
        let chunker = Chunker::new(10, 9);
        let chunks = chunker.chunk("o", &"abcdefghij".repeat(5), None);
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start > pair[0].char_start);
        }
        assert_eq!(chunks.last().unwrap().char_end, 50);
    }

    #[test]
    fn test_constructor_clamps_overlap() {
        let chunker = Chunker::new(10, 50);
        assert_eq!(chunker.overlap(), 9);
        assert_eq!(Chunker::new(0, 0).window_size(), 1);
    }

    #[test]
    fn test_tag_from_hint() {
        let chunker = Chunker::default();
        assert_eq!(chunker.chunk("m.rs", "fn main() {}", Some("rs"))[0].tag, ContentTag::Code);
        assert_eq!(chunker.chunk("c.yaml", "a: 1", Some(".yaml"))[0].tag, ContentTag::Config);
        assert_eq!(chunker.chunk("x", "text", None)[0].tag, ContentTag::Other);
    }
}
