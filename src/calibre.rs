//! Calibre library adapter: finding the book that matches a Kobo volume and
//! writing viewer annotations into `metadata.db`.
//!
//! Annotations live in:
//! ```sql
//! CREATE TABLE annotations (
//!     id INTEGER PRIMARY KEY,
//!     book INTEGER NOT NULL,
//!     format TEXT NOT NULL COLLATE NOCASE,
//!     user_type TEXT NOT NULL,
//!     user TEXT NOT NULL,
//!     timestamp REAL NOT NULL,
//!     annot_id TEXT NOT NULL,
//!     annot_type TEXT NOT NULL,
//!     annot_data TEXT NOT NULL,
//!     searchable_text TEXT NOT NULL DEFAULT "",
//!     UNIQUE(book, user_type, user, format, annot_type, annot_id)
//! );
//! ```

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use rusqlite::{Connection, OptionalExtension, backup::Backup, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const FORMAT: &str = "EPUB";
pub const USER_TYPE: &str = "local";
pub const USER: &str = "viewer";
pub const ANNOT_TYPE: &str = "highlight";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibreBook {
    pub id: i64,
    /// Directory of the book relative to the library root.
    pub path: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationStyle {
    pub kind: String,
    #[serde(rename = "type")]
    pub style_type: String,
    pub which: String,
}

impl AnnotationStyle {
    pub fn builtin(which: &str) -> Self {
        Self {
            kind: "color".into(),
            style_type: "builtin".into(),
            which: which.into(),
        }
    }
}

/// The JSON document stored in `annotations.annot_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationData {
    pub start_cfi: String,
    pub end_cfi: String,
    pub highlighted_text: String,
    pub spine_index: usize,
    pub spine_name: String,
    pub style: AnnotationStyle,
    /// `%Y-%m-%dT%H:%M:%SZ`
    pub timestamp: String,
    #[serde(rename = "type")]
    pub annot_type: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One row of the `annotations` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibreAnnotation {
    pub book: i64,
    pub timestamp: DateTime<Utc>,
    pub data: AnnotationData,
    pub searchable_text: String,
}

impl CalibreAnnotation {
    pub fn annot_id(&self) -> &str {
        &self.data.uuid
    }
}

pub fn library_db_path(library_root: &Path) -> PathBuf {
    library_root.join("metadata.db")
}

#[derive(Deserialize)]
struct DeviceBookEntry {
    lpath: Option<String>,
    application_id: Option<i64>,
}

/// The Calibre book ids that Calibre recorded when it sent books to the
/// device (`<volume>/metadata.calibre`), keyed by file name.
#[derive(Debug, Default, Clone)]
pub struct DeviceMetadata {
    ids: HashMap<String, i64>,
}

impl DeviceMetadata {
    /// Empty when the device has no `metadata.calibre`.
    pub fn load(volume_root: &Path) -> Result<Self> {
        let path = volume_root.join("metadata.calibre");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .wrap_err_with(|| format!("Failed to read device metadata: {}", path.display()))?;
        let entries: Vec<DeviceBookEntry> = serde_json::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse device metadata: {}", path.display()))?;

        let mut ids = HashMap::new();
        for entry in entries {
            let (Some(lpath), Some(id)) = (entry.lpath, entry.application_id) else {
                continue;
            };
            let name = lpath.rsplit('/').next().unwrap_or(&lpath).to_string();
            ids.entry(name).or_insert(id);
        }
        tracing::debug!(books = ids.len(), "read device metadata");
        Ok(Self { ids })
    }

    pub fn book_id(&self, file_name: &str) -> Option<i64> {
        self.ids.get(file_name).copied()
    }
}

/// Outcome of matching a book by title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleMatch {
    Found(CalibreBook),
    Missing,
    /// Several books carry the title and none shares an author.
    Ambiguous(usize),
}

pub fn find_book(conn: &Connection, id: i64) -> Result<Option<CalibreBook>> {
    conn.query_row(
        "SELECT id, path, title FROM books WHERE id = ?1",
        [id],
        |row| {
            Ok(CalibreBook {
                id: row.get(0)?,
                path: row.get(1)?,
                title: row.get(2)?,
            })
        },
    )
    .optional()
    .wrap_err_with(|| format!("Failed to look up book {}", id))
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn author_names(attribution: &str) -> Vec<String> {
    attribution
        .split(['&', ',', ';'])
        .map(normalize_title)
        .filter(|a| !a.is_empty())
        .collect()
}

/// Match a book by title, using the authors to break ties.
pub fn find_book_by_metadata(
    conn: &Connection,
    title: &str,
    authors: Option<&str>,
) -> Result<TitleMatch> {
    let wanted = normalize_title(title);
    if wanted.is_empty() {
        return Ok(TitleMatch::Missing);
    }

    let mut stmt = conn
        .prepare(
            "SELECT b.id, b.path, b.title, \
             (SELECT group_concat(a.name, ' & ') FROM books_authors_link l \
              JOIN authors a ON a.id = l.author WHERE l.book = b.id) \
             FROM books b",
        )
        .wrap_err("Failed to prepare book query")?;
    let candidates = stmt
        .query_map([], |row| {
            Ok((
                CalibreBook {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    title: row.get(2)?,
                },
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("Failed to read books")?
        .into_iter()
        .filter(|(book, _)| normalize_title(&book.title) == wanted)
        .collect::<Vec<_>>();

    let kobo_authors = authors.map(author_names).unwrap_or_default();
    let overlapping = candidates.iter().find(|(_, calibre_authors)| {
        let calibre_authors = calibre_authors
            .as_deref()
            .map(author_names)
            .unwrap_or_default();
        kobo_authors.iter().any(|a| calibre_authors.contains(a))
    });

    if let Some((book, _)) = overlapping {
        return Ok(TitleMatch::Found(book.clone()));
    }
    Ok(match candidates.as_slice() {
        [(book, _)] => TitleMatch::Found(book.clone()),
        [] => TitleMatch::Missing,
        many => TitleMatch::Ambiguous(many.len()),
    })
}

/// The EPUB file of `book` inside the library, if it has one.
pub fn epub_path(library_root: &Path, book: &CalibreBook) -> Result<Option<PathBuf>> {
    let dir = library_root.join(&book.path);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .wrap_err_with(|| format!("Failed to list book directory: {}", dir.display()));
        }
    };
    let mut epubs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"))
        })
        .collect();
    epubs.sort();
    Ok(epubs.into_iter().next())
}

/// Copy `metadata.db` next to itself before we write to it.
pub fn backup_database(db_path: &Path) -> Result<PathBuf> {
    let file_name = db_path
        .file_name()
        .ok_or_else(|| eyre!("Not a database file: {}", db_path.display()))?
        .to_string_lossy();
    let target = db_path.with_file_name(format!(
        "{}.kobo2calibre-{}.bak",
        file_name,
        Utc::now().format("%Y%m%dT%H%M%SZ")
    ));

    let src = Connection::open(db_path)
        .wrap_err_with(|| format!("Failed to open Calibre database: {}", db_path.display()))?;
    let mut dst = Connection::open(&target)
        .wrap_err_with(|| format!("Failed to create backup: {}", target.display()))?;
    {
        let backup = Backup::new(&src, &mut dst).wrap_err("Failed to initialize backup")?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .wrap_err("Backup did not complete successfully")?;
    }

    tracing::info!(backup = %target.display(), "backed up Calibre database");
    Ok(target)
}

pub fn annotation_exists(conn: &Connection, annot_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM annotations WHERE annot_id = ?1 LIMIT 1",
        [annot_id],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .wrap_err("Failed to check for existing annotation")
}

/// Insert `annotations`, skipping ids already in the library.
/// Returns how many rows were inserted.
pub fn insert_annotations(
    conn: &mut Connection,
    annotations: &[CalibreAnnotation],
) -> Result<usize> {
    let tx = conn.transaction().wrap_err("Failed to start transaction")?;
    let mut inserted = 0;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO annotations (book, format, user_type, user, timestamp, annot_id, \
                 annot_type, annot_data, searchable_text) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .wrap_err("Failed to prepare insert")?;

        for annotation in annotations {
            if annotation_exists(&tx, annotation.annot_id())? {
                tracing::debug!(
                    annot_id = annotation.annot_id(),
                    book = annotation.book,
                    "annotation already exists"
                );
                continue;
            }
            let data = serde_json::to_string(&annotation.data)
                .wrap_err("Failed to serialize annotation")?;
            let timestamp = annotation.timestamp.timestamp_millis() as f64 / 1000.0;
            stmt.execute(params![
                annotation.book,
                FORMAT,
                USER_TYPE,
                USER,
                timestamp,
                annotation.annot_id(),
                ANNOT_TYPE,
                data,
                annotation.searchable_text,
            ])
            .wrap_err_with(|| format!("Failed to insert annotation {}", annotation.annot_id()))?;
            inserted += 1;
        }
    }
    tx.commit().wrap_err("Failed to commit annotations")?;
    Ok(inserted)
}
