use crate::calibre::{ANNOT_TYPE, AnnotationData, AnnotationStyle, CalibreAnnotation};
use crate::epub::EpubBook;
use crate::kobo::KoboHighlight;
use crate::locate::{self, Chapter, MatchMethod};
use chrono::{DateTime, Utc};
use eyre::{Result, eyre};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Calibre builtin highlight color used when the device recorded none.
    pub default_color: String,
    pub now: DateTime<Utc>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            default_color: "green".into(),
            now: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BookReport {
    pub annotations: Vec<CalibreAnnotation>,
    pub located: usize,
    /// Located only by searching the text, not through the kobo span ids.
    pub searched: usize,
    /// Kept at the device position although the text there differs.
    pub unverified: usize,
    pub failed: usize,
    /// Chapters that could not be parsed, in archive path order.
    pub broken_chapters: Vec<String>,
}

/// Stable annotation id. The stray `)` is part of the ids earlier releases
/// wrote, so it has to stay for duplicates to be recognised.
pub fn annotation_id(start_cfi: &str, end_cfi: &str, text: &str) -> String {
    let name = format!("{}*{}*{})", start_cfi, end_cfi, text);
    Uuid::new_v3(&Uuid::NAMESPACE_DNS, name.as_bytes())
        .simple()
        .to_string()
}

/// Calibre builtin color for a Kobo highlight color.
pub fn highlight_color(kobo_color: Option<i64>, default: &str) -> String {
    match kobo_color {
        Some(0) => "yellow",
        Some(1) => "red",
        Some(2) => "blue",
        Some(3) => "green",
        _ => default,
    }
    .to_string()
}

/// Convert every highlight of one book. Individual failures are counted, not
/// propagated.
pub fn convert_book(
    epub: &EpubBook,
    book_id: i64,
    highlights: &[KoboHighlight],
    options: &ConvertOptions,
) -> BookReport {
    let mut report = BookReport::default();
    let mut chapters: HashMap<String, Option<Chapter>> = HashMap::new();

    for highlight in highlights {
        match convert_highlight(epub, book_id, highlight, &mut chapters, options) {
            Ok((annotation, method)) => {
                tracing::debug!(
                    start = %annotation.data.start_cfi,
                    end = %annotation.data.end_cfi,
                    ?method,
                    "located highlight"
                );
                if matches!(method, MatchMethod::Exact | MatchMethod::Fuzzy) {
                    report.searched += 1;
                }
                if method == MatchMethod::Unverified {
                    report.unverified += 1;
                    tracing::debug!(
                        text = %highlight.text,
                        "highlight text not found; using the device position as is"
                    );
                }
                report.located += 1;
                report.annotations.push(annotation);
            }
            Err(e) => {
                report.failed += 1;
                tracing::debug!(text = %highlight.text, "skipping highlight: {:#}", e);
            }
        }
    }

    report.broken_chapters = chapters
        .into_iter()
        .filter_map(|(path, chapter)| chapter.is_none().then_some(path))
        .collect();
    report.broken_chapters.sort();
    report
}

fn convert_highlight(
    epub: &EpubBook,
    book_id: i64,
    highlight: &KoboHighlight,
    chapters: &mut HashMap<String, Option<Chapter>>,
    options: &ConvertOptions,
) -> Result<(CalibreAnnotation, MatchMethod)> {
    let spine_name = epub
        .resolve_content_path(&highlight.content_path)
        .ok_or_else(|| eyre!("chapter {} not in EPUB", highlight.content_path))?;
    let spine_index = epub
        .spine_index(&spine_name)
        .ok_or_else(|| eyre!("chapter {} not in spine", spine_name))?;

    let chapter = chapters
        .entry(spine_name.clone())
        .or_insert_with(|| {
            match epub
                .read_text(&spine_name)
                .and_then(|xhtml| Chapter::parse(&xhtml))
            {
                Ok(chapter) => Some(chapter),
                Err(e) => {
                    tracing::debug!(chapter = %spine_name, "cannot parse chapter: {:#}", e);
                    None
                }
            }
        })
        .as_ref()
        .ok_or_else(|| eyre!("chapter {} could not be parsed", spine_name))?;

    let found = locate::locate(chapter, highlight)
        .ok_or_else(|| eyre!("text not found in {}", spine_name))?;

    let timestamp = highlight.created.unwrap_or(options.now);
    let uuid = annotation_id(&found.start_cfi, &found.end_cfi, &highlight.text);
    let searchable_text = match &highlight.note {
        Some(note) => format!("{}\n{}", highlight.text, note),
        None => highlight.text.clone(),
    };

    let data = AnnotationData {
        start_cfi: found.start_cfi,
        end_cfi: found.end_cfi,
        highlighted_text: highlight.text.clone(),
        spine_index,
        spine_name,
        style: AnnotationStyle::builtin(&highlight_color(
            highlight.color,
            &options.default_color,
        )),
        timestamp: timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        annot_type: ANNOT_TYPE.into(),
        uuid,
        notes: highlight.note.clone(),
    };

    Ok((
        CalibreAnnotation {
            book: book_id,
            timestamp,
            data,
            searchable_text,
        },
        found.method,
    ))
}
