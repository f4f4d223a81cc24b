use crate::error::{ReplyError, SpeakError};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref BULLET: Regex = Regex::new(r"(?:^|\s)[\-\*]\s+").unwrap();
}

/// Characters that close a sentence for both segmentation and normalization.
pub const SENTENCE_ENDINGS: [char; 5] = ['。', '！', '？', '!', '?'];

/// Generated replies must end with one of these (ASCII endings are not enough).
const REPLY_ENDINGS: [char; 3] = ['。', '！', '？'];

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Strips control characters and list bullets and collapses whitespace.
pub(crate) fn clean(text: &str) -> String {
    let without_controls: String = text
        .chars()
        .map(|c| if c == '\r' || c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect();
    let collapsed = WHITESPACE.replace_all(&without_controls, " ");
    let collapsed = collapsed.trim();
    BULLET.replace_all(collapsed, " ").trim().to_string()
}

fn ends_with_any(text: &str, endings: &[char]) -> bool {
    text.chars().last().is_some_and(|c| endings.contains(&c))
}

/// Cleans caller-supplied text. Length bounds are left to the segmenter.
pub fn normalize_direct(text: &str) -> Result<String, SpeakError> {
    let mut text = clean(text);
    if text.is_empty() {
        return Err(SpeakError::EmptyInput);
    }
    if !ends_with_any(&text, &SENTENCE_ENDINGS) {
        text.push('。');
    }
    Ok(text)
}

/// Shapes a generated reply into `[min_chars, max_chars]`.
///
/// Questions and replies that stay too short are rejected so the caller can
/// retry or fall back. Long replies are cut at the last sentence end that
/// keeps at least `min_chars - 1` characters, otherwise hard-cut.
pub fn shape_reply(text: &str, min_chars: usize, max_chars: usize) -> Result<String, ReplyError> {
    let mut text = clean(text);
    if text.is_empty() {
        return Err(ReplyError::Empty);
    }
    if text.ends_with('?') || text.ends_with('？') {
        return Err(ReplyError::Malformed("reply ends with a question".to_string()));
    }
    if !ends_with_any(&text, &REPLY_ENDINGS) {
        text.push('。');
    }

    if char_len(&text) > max_chars {
        let head: Vec<char> = text.chars().take(max_chars + 1).collect();
        let cut = head.iter().rposition(|c| REPLY_ENDINGS.contains(c));
        text = match cut {
            Some(idx) if idx + 1 >= min_chars => head[..=idx].iter().collect(),
            _ => {
                let mut hard: String = text.chars().take(max_chars).collect();
                hard.truncate(hard.trim_end().len());
                hard.push('。');
                hard
            }
        };
    }

    let len = char_len(&text);
    if len < min_chars {
        return Err(ReplyError::Malformed(format!(
            "reply has {} characters, need at least {}",
            len, min_chars
        )));
    }
    Ok(text)
}
