// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capture diffing and message chunking
//!
//! The incremental tail is the suffix of a new capture after the previous
//! one; when the pane scrolled and the new capture is not an extension, the
//! fallback is the trailing N lines. Chunking respects the chat transport's
//! per-message caps, splitting on line boundaries where possible.

use sha2::{Digest, Sha256};

/// Normalize a capture for comparison: CRLF/CR to LF, trailing blank lines
/// and trailing whitespace dropped.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.split('\n').map(|l| l.trim_end()).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Content hash of a normalized capture.
pub fn capture_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// What to emit for a new capture relative to the last emitted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tail {
    /// Nothing new.
    Unchanged,
    /// The new capture extends the old one; emit only the suffix.
    Extension(String),
    /// The pane scrolled; emit the trailing lines instead.
    Fallback(String),
}

/// Compute the incremental tail of `current` relative to `previous`.
///
/// Both sides are normalized first. The extension check works on whole
/// strings, so the suffix boundary always falls on a UTF-8 code point.
pub fn incremental_tail(previous: &str, current: &str, fallback_lines: usize) -> Tail {
    let previous = normalize(previous);
    let current = normalize(current);
    if current == previous {
        return Tail::Unchanged;
    }
    if current.starts_with(&previous) {
        let suffix = current[previous.len()..].trim_start_matches('\n');
        if suffix.is_empty() {
            return Tail::Unchanged;
        }
        return Tail::Extension(suffix.to_string());
    }
    let lines: Vec<&str> = current.split('\n').collect();
    let start = lines.len().saturating_sub(fallback_lines);
    Tail::Fallback(lines[start..].join("\n"))
}

/// Per-message limits of the chat transport.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub max_chars: usize,
    pub max_bytes: usize,
    pub max_line_length: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            max_bytes: 4096,
            max_line_length: 120,
        }
    }
}

/// Split text into transport-sized chunks.
///
/// Long lines are wrapped at `max_line_length` code points first, then whole
/// lines are packed greedily under the character and byte caps. A segment
/// that still does not fit is hard-split on code-point boundaries.
pub fn split_message(text: &str, limits: ChunkLimits) -> Vec<String> {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    if unified.is_empty() {
        return Vec::new();
    }

    let mut segments: Vec<String> = Vec::new();
    for line in unified.split('\n') {
        if limits.max_line_length == 0 || line.chars().count() <= limits.max_line_length {
            segments.push(line.to_string());
            continue;
        }
        let mut piece = String::new();
        let mut count = 0;
        for c in line.chars() {
            piece.push(c);
            count += 1;
            if count == limits.max_line_length {
                segments.push(std::mem::take(&mut piece));
                count = 0;
            }
        }
        if !piece.is_empty() {
            segments.push(piece);
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    let flush = |chunks: &mut Vec<String>, current: &mut String, current_chars: &mut usize| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
            *current_chars = 0;
        }
    };

    for segment in segments {
        let with_newline = if current.is_empty() { 0 } else { 1 };
        let seg_chars = segment.chars().count();
        let seg_bytes = segment.len();

        if seg_chars <= limits.max_chars && seg_bytes <= limits.max_bytes {
            if current_chars + with_newline + seg_chars > limits.max_chars
                || current.len() + with_newline + seg_bytes > limits.max_bytes
            {
                flush(&mut chunks, &mut current, &mut current_chars);
            }
            if !current.is_empty() {
                current.push('\n');
                current_chars += 1;
            }
            current.push_str(&segment);
            current_chars += seg_chars;
            continue;
        }

        // Oversized even alone: hard split on code points.
        flush(&mut chunks, &mut current, &mut current_chars);
        for c in segment.chars() {
            if current_chars + 1 > limits.max_chars || current.len() + c.len_utf8() > limits.max_bytes
            {
                flush(&mut chunks, &mut current, &mut current_chars);
            }
            current.push(c);
            current_chars += 1;
        }
        flush(&mut chunks, &mut current, &mut current_chars);
    }
    flush(&mut chunks, &mut current, &mut current_chars);

    chunks.into_iter().filter(|c| !c.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_trailing_blank_lines() {
        assert_eq!(normalize("a\r\nb\n\n\n"), "a\nb");
        assert_eq!(normalize("a  \nb\t\n"), "a\nb");
    }

    #[test]
    fn extension_yields_suffix_only() {
        let tail = incremental_tail("A\nB\n", "A\nB\nC?\n", 30);
        assert_eq!(tail, Tail::Extension("C?".to_string()));
    }

    #[test]
    fn identical_captures_are_unchanged() {
        assert_eq!(incremental_tail("A\nB\n", "A\nB", 30), Tail::Unchanged);
    }

    #[test]
    fn scroll_falls_back_to_trailing_lines() {
        let previous = "line1\nline2\nline3";
        let current = "line2\nline3\nline4\nline5";
        match incremental_tail(previous, current, 2) {
            Tail::Fallback(text) => assert_eq!(text, "line4\nline5"),
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[test]
    fn multibyte_suffix_is_not_cut() {
        let previous = "héllo";
        let current = "héllo wörld";
        match incremental_tail(previous, current, 30) {
            Tail::Extension(suffix) => assert_eq!(suffix, " wörld"),
            other => panic!("expected extension, got {other:?}"),
        }
    }

    #[test]
    fn hash_ignores_line_ending_style() {
        assert_eq!(capture_hash("a\r\nb\n"), capture_hash("a\nb"));
        assert_ne!(capture_hash("a"), capture_hash("b"));
    }

    #[test]
    fn chunks_split_on_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_message(
            text,
            ChunkLimits {
                max_chars: 9,
                max_bytes: 4096,
                max_line_length: 0,
            },
        );
        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn oversized_line_is_hard_split() {
        let text = "x".repeat(10);
        let chunks = split_message(
            &text,
            ChunkLimits {
                max_chars: 4,
                max_bytes: 4096,
                max_line_length: 0,
            },
        );
        assert_eq!(chunks, vec!["xxxx", "xxxx", "xx"]);
    }

    #[test]
    fn byte_cap_respected_for_multibyte_text() {
        let text = "ééééé";
        let chunks = split_message(
            text,
            ChunkLimits {
                max_chars: 100,
                max_bytes: 4,
                max_line_length: 0,
            },
        );
        for chunk in &chunks {
            assert!(chunk.len() <= 4);
        }
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn long_lines_are_wrapped_first() {
        let text = "abcdefghij";
        let chunks = split_message(
            text,
            ChunkLimits {
                max_chars: 100,
                max_bytes: 4096,
                max_line_length: 4,
            },
        );
        assert_eq!(chunks, vec!["abcd\nefgh\nij"]);
    }
}
