//! Streaming tokenizer turning an LLM token sequence into speakable
//! sentences (§A.4.5).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

/// Minimum sentence length (characters) before an end-of-sentence trigger
/// is honored.
pub const MIN_SENTENCE_LENGTH: usize = 5;
/// Size of the trailing-context window used for decimal-point disambiguation.
const CONTEXT_WINDOW: usize = 20;

static KAOMOJI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\([^)]{1,10}\)|<[^>]{1,10}>|\*[_-]{1,2}\*|\\o/|:-?[)D(]|;-?\)|=\\?[_/]")
        .expect("valid kaomoji pattern")
});

/// Returns true for codepoints in the emoji ranges carried from the source
/// dialogue system (face/symbol blocks plus misc/dingbats/supplemental
/// symbols-and-pictographs).
pub fn is_emoji(c: char) -> bool {
    let code = c as u32;
    (0x1F600..=0x1F64F).contains(&code)
        || (0x1F300..=0x1F5FF).contains(&code)
        || (0x1F680..=0x1F6FF).contains(&code)
        || (0x1F900..=0x1F9FF).contains(&code)
        || (0x1FA70..=0x1FAFF).contains(&code)
        || (0x2600..=0x26FF).contains(&code)
        || (0x2700..=0x27BF).contains(&code)
}

pub fn contains_kaomoji(text: &str) -> bool {
    !text.is_empty() && KAOMOJI_PATTERN.is_match(text)
}

pub fn filter_kaomoji(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    KAOMOJI_PATTERN.replace_all(text, "").into_owned()
}

/// Strips emoji from `text`, appending one `"happy"` mood per emoji found,
/// and returns the speech-ready text. Grounded on the reference
/// `process_sentence` helper.
pub fn process_sentence(text: &str, moods: &mut Vec<String>) -> String {
    if text.is_empty() {
        return String::new();
    }
    let cleaned = clean_text(text);
    let cleaned = filter_kaomoji(&cleaned);
    let mut out = String::with_capacity(cleaned.len());
    for ch in cleaned.chars() {
        if is_emoji(ch) {
            moods.push("happy".to_string());
        } else {
            out.push(ch);
        }
    }
    out.trim().to_string()
}

fn clean_text(text: &str) -> String {
    let stripped: String = text.chars().filter(|&c| c != '\t' && c != '\n' && c != '\r').collect();
    static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
    static SPECIAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[@#$%&*]").unwrap());
    static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    let stripped = HTML_TAG.replace_all(&stripped, "");
    let stripped = SPECIAL.replace_all(&stripped, "");
    WS.replace_all(&stripped, " ").trim().to_string()
}

fn is_end_punct(c: char) -> bool {
    matches!(c, '。' | '!' | '?' | '！' | '？')
}

fn is_pause_punct(c: char) -> bool {
    matches!(c, '，' | '、' | '；' | ',' | ';')
}

fn is_newline(c: char) -> bool {
    c == '\n' || c == '\r'
}

/// Streaming sentence tokenizer. Consumes token chunks, emits complete
/// sentences as soon as a boundary is confirmed.
pub struct Sentencer {
    current: String,
    context: VecDeque<char>,
    /// True when the last processed character was a `.` whose end-of-sentence
    /// status could not yet be decided (decimal guard needs one char of
    /// lookahead that a token boundary may not have supplied).
    pending_dot: bool,
}

impl Default for Sentencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentencer {
    pub fn new() -> Self {
        Self {
            current: String::new(),
            context: VecDeque::with_capacity(CONTEXT_WINDOW),
            pending_dot: false,
        }
    }

    fn push_context(&mut self, c: char) {
        self.context.push_back(c);
        while self.context.len() > CONTEXT_WINDOW {
            self.context.pop_front();
        }
    }

    /// Feed one token (may be any length) of streamed LLM output. Returns
    /// zero or more complete sentences.
    pub fn push_token(&mut self, token: &str) -> Vec<String> {
        let mut emitted = Vec::new();
        for ch in token.chars() {
            self.push_char(ch, &mut emitted);
        }
        emitted
    }

    fn push_char(&mut self, ch: char, emitted: &mut Vec<String>) {
        if self.pending_dot {
            self.pending_dot = false;
            let chars: Vec<char> = self.current.chars().collect();
            let dot_idx = chars.len().saturating_sub(1);
            let prev_is_digit = dot_idx > 0 && chars[dot_idx - 1].is_ascii_digit();
            let next_is_digit = ch.is_ascii_digit();
            if !(prev_is_digit && next_is_digit) {
                self.try_emit(emitted, true);
            }
        }

        self.current.push(ch);
        self.push_context(ch);

        if ch == '.' {
            self.pending_dot = true;
            return;
        }

        if is_end_punct(ch) || is_newline(ch) {
            self.try_emit(emitted, true);
        } else if is_pause_punct(ch) || is_emoji(ch) || contains_kaomoji(&self.current) {
            self.try_emit(emitted, false);
        }
    }

    /// Attempt to emit `self.current` as a sentence.
    ///
    /// `is_end` trigger bypasses nothing: even end-punctuation withholds
    /// below `MIN_SENTENCE_LENGTH`, and every trigger requires at least two
    /// word/CJK characters after kaomoji-stripping.
    fn try_emit(&mut self, emitted: &mut Vec<String>, _is_end: bool) {
        let trimmed = self.current.trim();
        if trimmed.chars().count() < MIN_SENTENCE_LENGTH {
            return;
        }
        let candidate = filter_kaomoji(trimmed).trim().to_string();
        let word_count = candidate.chars().filter(|c| c.is_alphanumeric() || is_cjk(*c)).count();
        if word_count < 2 {
            return;
        }
        emitted.push(candidate);
        self.current.clear();
    }

    /// Flush any non-empty remainder at stream end.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending_dot {
            self.pending_dot = false;
        }
        let trimmed = self.current.trim();
        if trimmed.is_empty() {
            return None;
        }
        let candidate = filter_kaomoji(trimmed).trim().to_string();
        if candidate.is_empty() {
            return None;
        }
        self.current.clear();
        Some(candidate)
    }
}

fn is_cjk(c: char) -> bool {
    let code = c as u32;
    (0x4E00..=0x9FFF).contains(&code) || (0x3400..=0x4DBF).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withholds_below_min_sentence_length() {
        let mut s = Sentencer::new();
        let out = s.push_token("嗨。");
        assert!(out.is_empty(), "too short, should be withheld: {out:?}");
    }

    #[test]
    fn decimal_point_does_not_split() {
        let mut s = Sentencer::new();
        let mut out = s.push_token("3.14 元");
        out.extend(s.finish());
        assert_eq!(out, vec!["3.14 元".to_string()]);
    }

    #[test]
    fn emits_on_end_punctuation_above_min_length() {
        let mut s = Sentencer::new();
        let out = s.push_token("你好，世界！");
        assert_eq!(out, vec!["你好，世界！".to_string()]);
    }

    #[test]
    fn single_emoji_alone_produces_no_sentence() {
        let mut s = Sentencer::new();
        let out = s.push_token("\u{1F600}");
        assert!(out.is_empty());
    }

    #[test]
    fn flushes_remainder_on_finish() {
        let mut s = Sentencer::new();
        s.push_token("还没完");
        let flushed = s.finish();
        assert_eq!(flushed, Some("还没完".to_string()));
    }

    #[test]
    fn kaomoji_is_stripped_before_emission() {
        let mut s = Sentencer::new();
        let mut out = s.push_token("你好呀(^_^)世界。");
        out.extend(s.finish());
        assert!(out.iter().all(|s| !s.contains("(^_^)")));
    }
}
