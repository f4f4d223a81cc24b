use crate::text::{char_len, SENTENCE_ENDINGS};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// One speakable chunk with a fixed playback position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub sequence_index: usize,
    pub text: String,
}

/// Ordered segments of one request. Indices are contiguous from 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackPlan {
    segments: Vec<Segment>,
}

impl PlaybackPlan {
    pub(crate) fn from_texts(texts: Vec<String>) -> Self {
        let segments = texts
            .into_iter()
            .enumerate()
            .map(|(sequence_index, text)| Segment {
                sequence_index,
                text,
            })
            .collect();
        Self { segments }
    }

    /// The whole text as a single segment (non-streaming playback).
    pub fn single(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::default();
        }
        Self::from_texts(vec![text.to_string()])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.text.clone()).collect()
    }
}

/// Splits after every sentence-ending mark. Text without any mark is one sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let normalized = WHITESPACE.replace_all(text, " ");
    let normalized = normalized.trim();
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for c in normalized.chars() {
        current.push(c);
        if SENTENCE_ENDINGS.contains(&c) {
            let part = current.trim();
            if !part.is_empty() {
                parts.push(part.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        parts.push(tail.to_string());
    }

    if parts.is_empty() {
        parts.push(normalized.to_string());
    }
    parts
}

fn join(head: &str, tail: &str) -> String {
    let cjk_break = head.ends_with(['。', '！', '？']);
    if cjk_break {
        format!("{}{}", head, tail)
    } else {
        format!("{} {}", head, tail)
    }
}

/// Greedily merges sentences into segments of `[min_chars, max_chars]`.
///
/// A chunk that already reached `min_chars` is closed before the next
/// sentence is considered. A short chunk absorbs the next sentence only if
/// the result stays within `max_chars`. A sentence longer than `max_chars`
/// becomes its own segment, uncut. The final segment may be short.
pub fn segment(text: &str, min_chars: usize, max_chars: usize) -> PlaybackPlan {
    let mut chunks: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for sentence in split_sentences(text) {
        current = Some(match current.take() {
            None => sentence,
            Some(cur) if char_len(&cur) >= min_chars => {
                chunks.push(cur);
                sentence
            }
            Some(cur) => {
                let merged = join(&cur, &sentence);
                if char_len(&merged) <= max_chars {
                    merged
                } else {
                    chunks.push(cur);
                    sentence
                }
            }
        });
    }
    if let Some(cur) = current {
        chunks.push(cur);
    }

    PlaybackPlan::from_texts(chunks)
}
