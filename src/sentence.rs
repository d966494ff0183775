//! Sentence segmentation matching Kobo's kepub conversion.
//!
//! Kobo numbers the sentences inside every text node (`kobo.P.S`) and stores
//! highlight offsets relative to the start of sentence `S`. To turn that back
//! into an offset inside the text node we need to cut the node the same way the
//! converter did.

use regex::Regex;
use std::sync::LazyLock;

static SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s*.*?[.!?:]['"\u{201c}\u{201d}\u{2018}\u{2019}\u{2026}]?\s*"#)
        .expect("sentence pattern is valid")
});

/// Split `text` into sentence segments.
///
/// Terminated sentences and the unterminated text between them are both kept,
/// so the segments always concatenate back to `text`.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut last = 0;
    for m in SENTENCE.find_iter(text) {
        if m.start() > last {
            segments.push(&text[last..m.start()]);
        }
        if !m.as_str().is_empty() {
            segments.push(m.as_str());
        }
        last = m.end();
    }
    if last < text.len() {
        segments.push(&text[last..]);
    }
    segments
}

/// Number of characters preceding the 1-based sentence `sentence` in `text`.
pub fn prefix_len(text: &str, sentence: usize) -> usize {
    if sentence <= 1 {
        return 0;
    }
    split_sentences(text)
        .iter()
        .take(sentence - 1)
        .map(|s| s.chars().count())
        .sum()
}
