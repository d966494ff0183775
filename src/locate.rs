//! Locating a Kobo highlight inside a chapter of the Calibre EPUB.
//!
//! Kobo records a highlight as a pair of kepub span ids (`kobo.P.S`, paragraph
//! and sentence) plus character offsets into those sentences, and keeps the
//! highlighted text verbatim. Calibre wants EPUB CFIs into the plain EPUB, which
//! has no kobo spans. We first rebuild the position from the span ids and check
//! that it covers the highlighted text. When it does not, the text itself is
//! searched for in the chapter, first after light normalization and then
//! comparing only letters and digits.

use crate::kobo::KoboHighlight;
use crate::sentence;
use eyre::{Context, Result};
use regex::{Captures, Regex};
use roxmltree::{Document, Node, ParsingOptions};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

/// A kepub span id, `span#kobo\.12\.3` on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KoboSpan {
    /// 1-based index of the non-empty text node in the chapter body.
    pub paragraph: usize,
    /// 1-based sentence inside that text node.
    pub sentence: usize,
}

impl KoboSpan {
    pub fn parse(path: &str) -> Option<Self> {
        let cleaned = path.replace('\\', "");
        let idx = cleaned.rfind("kobo.")?;
        let mut parts = cleaned[idx + "kobo.".len()..].split('.');
        let paragraph = parts.next()?.trim().parse().ok()?;
        let sentence = parts.next()?.trim().parse().ok()?;
        Some(Self {
            paragraph,
            sentence,
        })
    }
}

/// A character position inside one of the chapter's text nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TextPoint {
    pub node: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    /// The kobo span ids resolved to a range covering the highlighted text.
    Structural,
    /// Found by searching the normalized chapter text.
    Exact,
    /// Found by comparing letters and digits only.
    Fuzzy,
    /// The span ids resolved but the covered text differs and no search hit.
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub start: TextPoint,
    pub end: TextPoint,
    pub start_cfi: String,
    pub end_cfi: String,
    pub method: MatchMethod,
}

#[derive(Debug, Clone)]
struct TextNode {
    text: String,
    /// CFI steps from the document node down to this text node.
    cfi_path: String,
    len: usize,
}

/// The text nodes of a chapter body, in document order.
#[derive(Debug, Clone)]
pub struct Chapter {
    nodes: Vec<TextNode>,
    /// Indices into `nodes` of the nodes Kobo numbers as paragraphs.
    counted: Vec<usize>,
}

impl Chapter {
    pub fn parse(xhtml: &str) -> Result<Self> {
        let source = normalize_markup(xhtml);
        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let doc = Document::parse_with_options(&source, options)
            .wrap_err("Failed to parse chapter XHTML")?;

        let mut nodes = Vec::new();
        let mut counted = Vec::new();
        collect_text(doc.root(), "", false, false, &mut nodes, &mut counted);
        Ok(Self { nodes, counted })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_text(&self, node: usize) -> Option<&str> {
        self.nodes.get(node).map(|n| n.text.as_str())
    }

    /// Node index of Kobo paragraph `paragraph` (1-based).
    pub fn counted_node(&self, paragraph: usize) -> Option<usize> {
        paragraph
            .checked_sub(1)
            .and_then(|i| self.counted.get(i))
            .copied()
    }

    pub fn encode_cfi(&self, point: TextPoint) -> Option<String> {
        let node = self.nodes.get(point.node)?;
        Some(format!("{}:{}", node.cfi_path, point.offset))
    }

    /// The text covered by `start..end`, across node boundaries.
    pub fn text_between(&self, start: TextPoint, end: TextPoint) -> String {
        let mut out = String::new();
        if start > end {
            return out;
        }
        for (i, node) in self
            .nodes
            .iter()
            .enumerate()
            .take(end.node + 1)
            .skip(start.node)
        {
            let from = if i == start.node { start.offset } else { 0 };
            let to = if i == end.node { end.offset } else { node.len };
            out.extend(node.text.chars().skip(from).take(to.saturating_sub(from)));
        }
        out
    }

    fn located(&self, start: TextPoint, end: TextPoint, method: MatchMethod) -> Option<Located> {
        Some(Located {
            start,
            end,
            start_cfi: self.encode_cfi(start)?,
            end_cfi: self.encode_cfi(end)?,
            method,
        })
    }
}

fn collect_text(
    element: Node,
    path: &str,
    in_body: bool,
    in_figure: bool,
    nodes: &mut Vec<TextNode>,
    counted: &mut Vec<usize>,
) {
    let name = element.tag_name().name();
    let in_body = in_body || name == "body";
    let in_figure = in_figure || name == "figure";

    let mut elements = 0;
    for child in element.children() {
        if child.is_element() {
            elements += 1;
            let child_path = format!("{}/{}", path, elements * 2);
            collect_text(child, &child_path, in_body, in_figure, nodes, counted);
        } else if child.is_text() && in_body {
            let text = child.text().unwrap_or_default();
            if !in_figure && !text.trim().is_empty() {
                counted.push(nodes.len());
            }
            nodes.push(TextNode {
                text: text.to_string(),
                cfi_path: format!("{}/{}", path, elements * 2 + 1),
                len: text.chars().count(),
            });
        }
    }
}

static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&([A-Za-z][A-Za-z0-9]*);").expect("entity pattern is valid"));

const VOID_ELEMENTS: &str = "area|base|br|col|embed|hr|img|input|link|meta|param|source|track|wbr";

static VOID_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)<({})\b([^>]*?)/?>", VOID_ELEMENTS))
        .expect("void element pattern is valid")
});

static VOID_CLOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)</({})\s*>", VOID_ELEMENTS)).expect("void element pattern is valid")
});

/// Chapters are often HTML rather than XHTML: named entities a plain XML
/// parser rejects, and void elements such as `<br>` left open. Rewrite both
/// into well-formed XML.
fn normalize_markup(xhtml: &str) -> String {
    let closed = VOID_CLOSE.replace_all(xhtml, "");
    let voids = VOID_OPEN.replace_all(&closed, "<$1$2/>");
    ENTITY
        .replace_all(&voids, |caps: &Captures| {
            if matches!(&caps[1], "lt" | "gt" | "amp" | "quot" | "apos") {
                return caps[0].to_string();
            }
            let decoded = html_escape::decode_html_entities(&caps[0]);
            if decoded == &caps[0] {
                // Unknown entity, keep it as literal text.
                return format!("&amp;{};", &caps[1]);
            }
            decoded.chars().map(|c| format!("&#{};", c as u32)).collect()
        })
        .into_owned()
}

/// Locate `highlight` in `chapter`.
pub fn locate(chapter: &Chapter, highlight: &KoboHighlight) -> Option<Located> {
    let structural = resolve_structural(chapter, highlight);

    if let Some((start, end)) = structural
        && covers(chapter, start, end, &highlight.text)
    {
        return chapter.located(start, end, MatchMethod::Structural);
    }

    let hint = structural.map(|(start, _)| start.node).or_else(|| {
        KoboSpan::parse(&highlight.start_path).and_then(|s| chapter.counted_node(s.paragraph))
    });

    if let Some((start, end, method)) = search_text(chapter, &highlight.text, hint) {
        return chapter.located(start, end, method);
    }

    structural.and_then(|(start, end)| chapter.located(start, end, MatchMethod::Unverified))
}

/// Rebuild the highlighted range from the kepub span ids and sentence offsets.
pub fn resolve_structural(
    chapter: &Chapter,
    highlight: &KoboHighlight,
) -> Option<(TextPoint, TextPoint)> {
    let start_span = KoboSpan::parse(&highlight.start_path)?;
    let end_span = KoboSpan::parse(&highlight.end_path)?;
    let start_offset = usize::try_from(highlight.start_offset).ok()?;
    let end_offset = usize::try_from(highlight.end_offset).ok()?;

    let start_node = chapter.counted_node(start_span.paragraph)?;
    let start_text = &chapter.nodes[start_node].text;
    let start_prefix = sentence::prefix_len(start_text, start_span.sentence);
    let start = TextPoint {
        node: start_node,
        offset: start_offset + start_prefix,
    };

    let end = if end_span.paragraph == start_span.paragraph {
        let prefix = if end_span.sentence == start_span.sentence {
            start_prefix
        } else {
            sentence::prefix_len(start_text, end_span.sentence)
        };
        TextPoint {
            node: start_node,
            offset: end_offset + prefix,
        }
    } else {
        let end_node = chapter.counted_node(end_span.paragraph)?;
        let end_prefix = sentence::prefix_len(&chapter.nodes[end_node].text, end_span.sentence);
        TextPoint {
            node: end_node,
            offset: end_offset + end_prefix,
        }
    };

    let in_bounds = start.offset <= chapter.nodes[start.node].len
        && end.offset <= chapter.nodes[end.node].len;
    (in_bounds && start <= end).then_some((start, end))
}

fn covers(chapter: &Chapter, start: TextPoint, end: TextPoint, text: &str) -> bool {
    let covered = fold_str(&chapter.text_between(start, end), Fold::Loose);
    let wanted = fold_str(text, Fold::Loose);
    !wanted.is_empty() && covered == wanted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fold {
    /// Compatibility decomposition, unified quotes and dashes, collapsed whitespace.
    Normal,
    /// Lowercase letters and digits only.
    Loose,
}

fn fold_char(c: char, fold: Fold, emit: &mut impl FnMut(char)) {
    match c {
        '\u{ad}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{feff}' => {}
        c if c.is_whitespace() => {
            if fold == Fold::Normal {
                emit(' ');
            }
        }
        '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' | '\u{2032}' => {
            if fold == Fold::Normal {
                emit('\'');
            }
        }
        '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' | '\u{2033}' | '\u{ab}' | '\u{bb}' => {
            if fold == Fold::Normal {
                emit('"');
            }
        }
        '\u{2010}'..='\u{2015}' | '\u{2212}' => {
            if fold == Fold::Normal {
                emit('-');
            }
        }
        c => {
            for d in std::iter::once(c).nfkd() {
                match fold {
                    Fold::Normal => emit(d),
                    Fold::Loose if d.is_alphanumeric() => d.to_lowercase().for_each(&mut *emit),
                    Fold::Loose => {}
                }
            }
        }
    }
}

fn fold_str(text: &str, fold: Fold) -> Vec<char> {
    let mut out: Vec<char> = Vec::with_capacity(text.len());
    for c in text.chars() {
        fold_char(c, fold, &mut |d| {
            if d == ' ' && out.last().is_none_or(|&last| last == ' ') {
                return;
            }
            out.push(d);
        });
    }
    while out.last() == Some(&' ') {
        out.pop();
    }
    out
}

/// Folded chapter text with the source position of every folded character.
struct FoldedChapter {
    chars: Vec<char>,
    origin: Vec<TextPoint>,
}

impl FoldedChapter {
    fn new(chapter: &Chapter, fold: Fold) -> Self {
        let mut chars: Vec<char> = Vec::new();
        let mut origin = Vec::new();
        for (node, text_node) in chapter.nodes.iter().enumerate() {
            for (offset, c) in text_node.text.chars().enumerate() {
                fold_char(c, fold, &mut |d| {
                    if d == ' ' && chars.last().is_none_or(|&last| last == ' ') {
                        return;
                    }
                    chars.push(d);
                    origin.push(TextPoint { node, offset });
                });
            }
        }
        Self { chars, origin }
    }

    fn find_all(&self, needle: &[char]) -> Vec<usize> {
        if needle.is_empty() || needle.len() > self.chars.len() {
            return Vec::new();
        }
        self.chars
            .windows(needle.len())
            .enumerate()
            .filter(|(_, w)| *w == needle)
            .map(|(i, _)| i)
            .collect()
    }

    fn range(&self, at: usize, len: usize) -> (TextPoint, TextPoint) {
        let start = self.origin[at];
        let last = self.origin[at + len - 1];
        (
            start,
            TextPoint {
                node: last.node,
                offset: last.offset + 1,
            },
        )
    }
}

/// Search the chapter for `text`, preferring the hit nearest to `hint`.
pub fn search_text(
    chapter: &Chapter,
    text: &str,
    hint: Option<usize>,
) -> Option<(TextPoint, TextPoint, MatchMethod)> {
    for (fold, method) in [(Fold::Normal, MatchMethod::Exact), (Fold::Loose, MatchMethod::Fuzzy)] {
        let needle = fold_str(text, fold);
        let haystack = FoldedChapter::new(chapter, fold);
        let hits = haystack.find_all(&needle);
        let best = match hint {
            Some(node) => hits
                .iter()
                .min_by_key(|&&at| haystack.origin[at].node.abs_diff(node))
                .copied(),
            None => hits.first().copied(),
        };
        if let Some(at) = best {
            let (start, end) = haystack.range(at, needle.len());
            return Some((start, end, method));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.1//EN" "http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd">
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>Chapter&nbsp;One</title></head>
<body>
<h1>Chapter One</h1>
<p>It was a bright cold day in April. The clocks were striking thirteen.</p>
<figure><p>Figure caption.</p></figure>
<p>Winston Smith slipped quickly through the <em>glass doors</em> of Victory Mansions.</p>
</body>
</html>
"#;

    fn highlight(
        start: &str,
        start_offset: i64,
        end: &str,
        end_offset: i64,
        text: &str,
    ) -> KoboHighlight {
        KoboHighlight {
            volume_id: "file:///mnt/onboard/1984.kepub.epub".into(),
            content_path: "OEBPS/ch01.xhtml".into(),
            start_path: start.into(),
            end_path: end.into(),
            start_offset,
            end_offset,
            text: text.into(),
            note: None,
            color: None,
            created: None,
        }
    }

    #[test]
    fn parses_kobo_span_ids() {
        assert_eq!(
            KoboSpan::parse(r"span#kobo\.12\.3"),
            Some(KoboSpan {
                paragraph: 12,
                sentence: 3
            })
        );
        assert_eq!(
            KoboSpan::parse("span#kobo.4.1"),
            Some(KoboSpan {
                paragraph: 4,
                sentence: 1
            })
        );
        assert_eq!(KoboSpan::parse("point(/1/4/2:3)"), None);
    }

    #[test]
    fn numbers_paragraphs_outside_figures() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let text = |p| chapter.node_text(chapter.counted_node(p).unwrap()).unwrap();
        assert_eq!(text(1), "Chapter One");
        assert_eq!(text(3), "Winston Smith slipped quickly through the ");
        assert_eq!(text(4), "glass doors");
        assert_eq!(chapter.counted_node(0), None);
    }

    #[test]
    fn encodes_cfi_steps() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let first = chapter.counted_node(1).unwrap();
        assert_eq!(
            chapter.encode_cfi(TextPoint { node: first, offset: 0 }).unwrap(),
            "/2/4/2/1:0"
        );
        let em = chapter.counted_node(4).unwrap();
        assert_eq!(
            chapter.encode_cfi(TextPoint { node: em, offset: 5 }).unwrap(),
            "/2/4/8/2/1:5"
        );
        let tail = chapter.counted_node(5).unwrap();
        assert_eq!(
            chapter.encode_cfi(TextPoint { node: tail, offset: 1 }).unwrap(),
            "/2/4/8/3:1"
        );
    }

    #[test]
    fn resolves_second_sentence_structurally() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight(
            r"span#kobo\.2\.2",
            0,
            r"span#kobo\.2\.2",
            34,
            "The clocks were striking thirteen.",
        );
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Structural);
        assert_eq!(found.start_cfi, "/2/4/4/1:35");
        assert_eq!(found.end_cfi, "/2/4/4/1:69");
    }

    #[test]
    fn resolves_across_nodes() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight(
            r"span#kobo\.3\.1",
            0,
            r"span#kobo\.5\.1",
            21,
            "Winston Smith slipped quickly through the glass doors of Victory Mansions.",
        );
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Structural);
        assert_eq!(found.start_cfi, "/2/4/8/1:0");
        assert_eq!(found.end_cfi, "/2/4/8/3:21");
    }

    #[test]
    fn falls_back_to_text_search() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight("", 0, "", 0, "glass doors of Victory");
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Exact);
        assert_eq!(found.start_cfi, "/2/4/8/2/1:0");
        assert_eq!(found.end_cfi, "/2/4/8/3:11");
    }

    #[test]
    fn wrong_offsets_are_corrected_by_search() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight(
            r"span#kobo\.2\.1",
            0,
            r"span#kobo\.2\.1",
            10,
            "The clocks were  striking\nthirteen.",
        );
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Exact);
        assert_eq!(found.start_cfi, "/2/4/4/1:35");
        assert_eq!(found.end_cfi, "/2/4/4/1:69");
    }

    #[test]
    fn fuzzy_match_ignores_punctuation_and_case() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight("", 0, "", 0, "it was a bright, cold day in april");
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Fuzzy);
        assert_eq!(found.start_cfi, "/2/4/4/1:0");
        assert_eq!(found.end_cfi, "/2/4/4/1:33");
    }

    #[test]
    fn keeps_unverified_structural_match() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight(
            r"span#kobo\.2\.1",
            0,
            r"span#kobo\.2\.1",
            6,
            "nowhere in this chapter",
        );
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Unverified);
        assert_eq!(chapter.text_between(found.start, found.end), "It was");
    }

    #[test]
    fn gives_up_without_any_anchor() {
        let chapter = Chapter::parse(CHAPTER).unwrap();
        let h = highlight(r"span#kobo\.99\.1", 0, r"span#kobo\.99\.1", 3, "nowhere");
        assert!(locate(&chapter, &h).is_none());
    }

    #[test]
    fn folding_unifies_typography() {
        assert_eq!(
            fold_str("  It\u{2019}s\u{a0} a \u{201c}test\u{201d}\u{2026} ", Fold::Normal)
                .into_iter()
                .collect::<String>(),
            "It's a \"test\"..."
        );
        assert_eq!(
            fold_str("Caf\u{e9}-au-lait", Fold::Loose)
                .into_iter()
                .collect::<String>(),
            "cafeaulait"
        );
    }

    fn compact(body: &str) -> Chapter {
        Chapter::parse(&format!(
            r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>t</title></head><body>{}</body></html>"#,
            body
        ))
        .unwrap()
    }

    #[test]
    fn tolerates_html_entities_and_void_tags() {
        let chapter = Chapter::parse(
            r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><meta charset="utf-8"><link rel="stylesheet" href="css/a.css"></link></head><body><p>Love &hearts; it &amp; &frac12; &bogus; more.</p><p>Line one<br>Line two.<img src="x.png"></p></body></html>"#,
        )
        .unwrap();
        let first = chapter.counted_node(1).unwrap();
        assert_eq!(
            chapter.node_text(first),
            Some("Love \u{2665} it & \u{bd} &bogus; more.")
        );
        let second = chapter.counted_node(3).unwrap();
        assert_eq!(chapter.node_text(second), Some("Line two."));
        assert_eq!(
            chapter.encode_cfi(TextPoint { node: second, offset: 0 }).unwrap(),
            "/2/4/4/3:0"
        );
    }

    #[test]
    fn repeated_text_prefers_hit_near_device_position() {
        let chapter = compact("<p>Again.</p><p>Other text.</p><p>Again.</p>");
        let h = highlight(r"span#kobo\.3\.1", 0, r"span#kobo\.3\.1", 3, "Again.");
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.method, MatchMethod::Exact);
        assert_eq!(found.start_cfi, "/2/4/6/1:0");
        assert_eq!(found.end_cfi, "/2/4/6/1:6");

        let h = highlight("", 0, "", 0, "Again.");
        let found = locate(&chapter, &h).unwrap();
        assert_eq!(found.start_cfi, "/2/4/2/1:0");
    }

    #[test]
    fn search_skips_soft_hyphens_and_zero_width_characters() {
        let chapter = compact("<p>un\u{ad}break\u{200b}able words</p>");
        let (start, end, method) = search_text(&chapter, "unbreakable", None).unwrap();
        assert_eq!(method, MatchMethod::Exact);
        assert_eq!(start, TextPoint { node: 0, offset: 0 });
        assert_eq!(end, TextPoint { node: 0, offset: 13 });
        assert_eq!(chapter.text_between(start, end), "un\u{ad}break\u{200b}able");
    }
}
