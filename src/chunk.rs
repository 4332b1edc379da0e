//! Paragraph-first passage chunker.
//!
//! Splits extracted document text into overlapping [`Passage`]s.
//!
//! # Algorithm
//!
//! 1. Split the text into paragraphs on blank lines.
//! 2. Paragraphs no longer than `max_chars` are kept whole. A run of short
//!    paragraphs is merged while the accumulated piece is still below
//!    `min_chars` and the merge stays within `max_chars`.
//! 3. Longer paragraphs are split at sentence boundaries (terminal
//!    punctuation or a line break) and the sentences regrouped greedily
//!    into pieces of at most `max_chars`. A sentence longer than
//!    `max_chars` becomes its own oversized piece; nothing is truncated.
//! 4. Own spans tile the whole text: each passage ends where its piece
//!    ends and the next passage starts right there. Leading whitespace
//!    belongs to the first passage, trailing whitespace to the last.
//! 5. Every passage after the first carries the last `overlap_chars`
//!    characters of the previous passage's own span in front of its own.
//!
//! All offsets and sizes are in characters, not bytes. The function is
//! pure: the same text and configuration always yield the same passages.

use crate::config::ChunkingConfig;
use crate::models::Passage;

/// Split `text` into passages with contiguous indices starting at 0.
///
/// Empty or whitespace-only text yields no passages.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<Passage> {
    let chars: Vec<char> = text.chars().collect();
    let pieces = plan_pieces(&chars, config);
    let Some(last) = pieces.len().checked_sub(1) else {
        return Vec::new();
    };

    let mut passages = Vec::with_capacity(pieces.len());
    let mut start = 0usize;
    let mut prev_start = 0usize;

    for (index, piece) in pieces.iter().enumerate() {
        let end = if index == last { chars.len() } else { piece.end };
        let overlap = if index == 0 {
            0
        } else {
            config.overlap_chars.min(start - prev_start)
        };
        let content: String = chars[start - overlap..end].iter().collect();

        passages.push(Passage {
            index,
            start,
            end,
            overlap,
            content,
        });

        prev_start = start;
        start = end;
    }

    passages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

fn plan_pieces(chars: &[char], config: &ChunkingConfig) -> Vec<Span> {
    let max = config.max_chars;
    let min = config.min_chars;

    let mut pieces = Vec::new();
    let mut pending: Option<Span> = None;

    for para in paragraphs(chars) {
        if para.len() > max {
            if let Some(p) = pending.take() {
                pieces.push(p);
            }
            pieces.extend(group(&sentences(chars, para), max));
            continue;
        }

        pending = match pending {
            Some(p) if p.len() < min && para.end - p.start <= max => Some(Span {
                start: p.start,
                end: para.end,
            }),
            Some(p) => {
                pieces.push(p);
                Some(para)
            }
            None => Some(para),
        };
    }

    if let Some(p) = pending {
        pieces.push(p);
    }

    pieces
}

/// Trimmed paragraph spans separated by blank (whitespace-only) lines.
fn paragraphs(chars: &[char]) -> Vec<Span> {
    let mut out = Vec::new();
    let mut current: Option<Span> = None;
    let mut line_start = 0;

    loop {
        let line_end = chars[line_start..]
            .iter()
            .position(|&c| c == '\n')
            .map(|p| line_start + p)
            .unwrap_or(chars.len());
        let line = &chars[line_start..line_end];

        match line.iter().position(|c| !c.is_whitespace()) {
            None => {
                if let Some(p) = current.take() {
                    out.push(p);
                }
            }
            Some(first) => {
                let last = line
                    .iter()
                    .rposition(|c| !c.is_whitespace())
                    .unwrap_or(first);
                let end = line_start + last + 1;
                current = Some(match current {
                    Some(p) => Span {
                        start: p.start,
                        end,
                    },
                    None => Span {
                        start: line_start + first,
                        end,
                    },
                });
            }
        }

        if line_end >= chars.len() {
            break;
        }
        line_start = line_end + 1;
    }

    if let Some(p) = current {
        out.push(p);
    }
    out
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…') || is_cjk_terminator(c)
}

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn is_closer(c: char) -> bool {
    matches!(
        c,
        '"' | '\'' | ')' | ']' | '»' | '”' | '’' | '」' | '』' | '）'
    )
}

/// Trimmed sentence spans inside a paragraph. A sentence ends after
/// terminal punctuation (plus closing quotes or brackets) followed by
/// whitespace, after a CJK full stop, or at a line break.
fn sentences(chars: &[char], para: Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut i = para.start;

    while i < para.end {
        while i < para.end && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= para.end {
            break;
        }

        let start = i;
        let mut end = para.end;
        while i < para.end {
            let c = chars[i];
            if c == '\n' {
                end = i;
                break;
            }
            i += 1;
            if is_terminator(c) {
                while i < para.end && is_closer(chars[i]) {
                    i += 1;
                }
                if is_cjk_terminator(c) || i >= para.end || chars[i].is_whitespace() {
                    end = i;
                    break;
                }
            }
        }

        let mut trimmed = end;
        while trimmed > start && chars[trimmed - 1].is_whitespace() {
            trimmed -= 1;
        }
        out.push(Span {
            start,
            end: trimmed,
        });
    }

    out
}

/// Greedily pack consecutive units into pieces of at most `max` chars.
fn group(units: &[Span], max: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut current: Option<Span> = None;

    for unit in units {
        current = match current {
            None => Some(*unit),
            Some(c) if unit.end - c.start <= max => Some(Span {
                start: c.start,
                end: unit.end,
            }),
            Some(c) => {
                out.push(c);
                Some(*unit)
            }
        };
    }

    if let Some(c) = current {
        out.push(c);
    }
    out
}
